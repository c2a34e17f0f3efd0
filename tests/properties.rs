use approx::assert_abs_diff_eq;
use faer::Side;
use ndarray::{Array2, Array3, Axis, s};
use permgmm::estimate::{WEIGHT_FLOOR, m_step};
use permgmm::linalg::{FaerEigh, empirical_covariance};
use permgmm::score::{joint_log_evidence, score_block_samples};
use permgmm::{
    CovarianceType, Covariances, MixtureParameters, PermutationGmm, PermutationGmmConfig,
    PermutationSpec, PermutationTable,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_tensor(n: usize, p: usize, d: usize, seed: u64) -> Array3<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array3::from_shape_fn((n, p, d), |(i, _, _)| {
        rng.gen_range(-1.0..1.0) + if i % 2 == 0 { 2.0 } else { -2.0 }
    })
}

fn random_params(kind: CovarianceType, k: usize, p: usize, d: usize, seed: u64) -> MixtureParameters {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut weights = Array2::from_shape_fn((k, p), |_| rng.gen_range(0.2..1.0));
    let total = weights.sum();
    weights /= total;
    let means = Array3::from_shape_fn((k, p, d), |_| rng.gen_range(-2.0..2.0));
    let pooled = Array2::from_shape_fn((d, d), |(i, j)| if i == j { 1.5 } else { 0.3 });
    MixtureParameters {
        weights,
        means,
        covariances: Covariances::init(kind, pooled.view(), k, p, 1e-3),
        converged: false,
        log_likelihood: f64::NEG_INFINITY,
    }
}

#[test]
fn m_step_keeps_weights_normalized_and_bounded() {
    let (n, k, p, d) = (30, 3, 4, 2);
    let x = random_tensor(n, p, d, 1);
    let table = PermutationTable::cyclic(p).unwrap();
    let flat = x.to_shape((n * p, d)).unwrap().to_owned();
    let background = empirical_covariance(flat.view());
    for kind in CovarianceType::ALL {
        let config = PermutationGmmConfig::new(k, PermutationSpec::Cyclic(p))
            .with_covariance_type(kind)
            .with_reg_covar(0.1);
        let mut params = random_params(kind, k, p, d, 2);
        for _ in 0..3 {
            let scores = score_block_samples(&params, &table, x.view()).unwrap();
            m_step(&config, &table, x.view(), background.view(), &mut params, &scores).unwrap();
            assert_abs_diff_eq!(params.weights.sum(), 1.0, epsilon = 1e-9);
            for &w in params.weights.iter() {
                assert!(
                    (WEIGHT_FLOOR - 1e-15..=1.0 - WEIGHT_FLOOR + 1e-15).contains(&w),
                    "{kind}: weight {w}"
                );
            }
        }
    }
}

#[test]
fn fitted_covariances_respect_the_floor() {
    let (n, k, p, d) = (40, 2, 3, 3);
    let x = random_tensor(n, p, d, 4);
    let floor = 0.02;
    for kind in CovarianceType::ALL {
        let config = PermutationGmmConfig::new(k, PermutationSpec::Cyclic(p))
            .with_covariance_type(kind)
            .with_min_covar(floor)
            .with_reg_covar(0.25)
            .with_covar_limit(25)
            .with_n_iter(4);
        let mut model = PermutationGmm::new(config).unwrap();
        let params = model.fit(x.view()).unwrap();
        for kk in 0..k {
            for pp in 0..p {
                let cov = params.covariances.slot_matrix(kk, pp);
                let (values, _) = cov.eigh(Side::Lower).unwrap();
                let smallest = values.iter().copied().fold(f64::INFINITY, f64::min);
                assert!(
                    smallest >= floor * (1.0 - 1e-8),
                    "{kind}: eigenvalue {smallest} below {floor}"
                );
            }
        }
    }
}

#[test]
fn rotating_views_and_means_preserves_logprob() {
    let (n, k, p, d) = (10, 2, 4, 2);
    let x = random_tensor(n, p, d, 8);
    let table = PermutationTable::cyclic(p).unwrap();
    for kind in CovarianceType::ALL {
        let params = random_params(kind, k, p, d, 9);
        let base = score_block_samples(&params, &table, x.view()).unwrap();
        for shift in 1..p {
            let rotated_x = Array3::from_shape_fn((n, p, d), |(i, v, f)| x[(i, (v + shift) % p, f)]);
            let mut rotated = params.clone();
            rotated.means = Array3::from_shape_fn((k, p, d), |(kk, u, f)| {
                params.means[(kk, (u + shift) % p, f)]
            });
            let scores = score_block_samples(&rotated, &table, rotated_x.view()).unwrap();
            for (a, b) in base.logprob.iter().zip(scores.logprob.iter()) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-9);
            }
            for (a, b) in base.log_resp.iter().zip(scores.log_resp.iter()) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-9);
            }
        }
    }
}

#[test]
fn logprob_round_trips_through_exponentiation() {
    let (n, k, p, d) = (12, 3, 2, 3);
    let x = random_tensor(n, p, d, 21);
    let table = PermutationTable::cyclic(p).unwrap();
    for kind in CovarianceType::ALL {
        let params = random_params(kind, k, p, d, 22);
        let joint = joint_log_evidence(&params, &table, x.view()).unwrap();
        let scores = score_block_samples(&params, &table, x.view()).unwrap();
        for i in 0..n {
            let slab = joint.slice(s![i, .., ..]);
            let max = slab.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
            let direct = max + slab.mapv(|v| (v - max).exp()).sum().ln();
            assert_abs_diff_eq!(scores.logprob[i], direct, epsilon = 1e-9);
        }
        let mass = scores.log_resp.mapv(f64::exp).sum_axis(Axis(2)).sum_axis(Axis(1));
        for &m in mass.iter() {
            assert_abs_diff_eq!(m, 1.0, epsilon = 1e-9);
        }
    }
}

#[test]
fn custom_table_is_used_for_alignment() {
    // Two views whose alignments are given as an explicit table.
    let config = PermutationGmmConfig::new(1, PermutationSpec::Table(vec![vec![0, 1], vec![1, 0]]))
        .with_covariance_type(CovarianceType::Ones);
    let params = MixtureParameters {
        weights: Array2::from_elem((1, 2), 0.5),
        means: ndarray::array![[[0.0], [10.0]]],
        covariances: Covariances::Ones(ndarray::array![1.0]),
        converged: true,
        log_likelihood: 0.0,
    };
    let model = PermutationGmm::from_parameters(config, params).unwrap();
    let x = ndarray::array![[[0.1], [9.8]], [[10.2], [-0.3]]];
    let pairs = model.predict(x.view()).unwrap();
    assert_eq!(pairs, ndarray::array![[0, 0], [0, 1]]);
}
