use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::{Array2, Array3};
use permgmm::permutation::PermutationTable;
use permgmm::score::score_block_samples;
use permgmm::{CovarianceType, Covariances, MixtureParameters};
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const N_SAMPLES: usize = 2_000;
const N_COMPONENTS: usize = 8;
const N_PERMUTATIONS: usize = 4;
const N_FEATURES: usize = 16;

fn random_tensor(shape: (usize, usize, usize), seed: u64) -> Array3<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array3::from_shape_fn(shape, |_| rng.sample(Standard))
}

fn params_for(kind: CovarianceType) -> MixtureParameters {
    let pooled = Array2::from_shape_fn((N_FEATURES, N_FEATURES), |(i, j)| {
        if i == j { 1.0 } else { 0.1 }
    });
    MixtureParameters {
        weights: Array2::from_elem(
            (N_COMPONENTS, N_PERMUTATIONS),
            1.0 / (N_COMPONENTS * N_PERMUTATIONS) as f64,
        ),
        means: random_tensor((N_COMPONENTS, N_PERMUTATIONS, N_FEATURES), 0x5EED),
        covariances: Covariances::init(
            kind,
            pooled.view(),
            N_COMPONENTS,
            N_PERMUTATIONS,
            1e-3,
        ),
        converged: false,
        log_likelihood: f64::NEG_INFINITY,
    }
}

fn benchmark_scoring(c: &mut Criterion) {
    let table = PermutationTable::cyclic(N_PERMUTATIONS).expect("cyclic table");
    let x = random_tensor((N_SAMPLES, N_PERMUTATIONS, N_FEATURES), 0xDA7A);

    let mut group = c.benchmark_group("score_block_samples");
    group.throughput(Throughput::Elements(N_SAMPLES as u64));
    for kind in [
        CovarianceType::DiagPerm,
        CovarianceType::Tied,
        CovarianceType::FullFull,
    ] {
        let params = params_for(kind);
        group.bench_with_input(BenchmarkId::new("policy", kind), &params, |b, input| {
            b.iter(|| {
                let scores = score_block_samples(black_box(input), &table, x.view())
                    .expect("scoring");
                black_box(scores);
            });
        });
    }
    group.finish();
}

criterion_group!(score_benchmark, benchmark_scoring);
criterion_main!(score_benchmark);
