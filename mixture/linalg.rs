use faer::diag::DiagRef;
use faer::linalg::solvers;
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, ArrayView2, Axis, Data, Ix2, s};
use std::f64::consts::PI;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl<'a> FaerStorage<'a> {
    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Zero-copy faer view over an ndarray matrix when the layout allows it.
pub struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let storage = match array.as_slice_memory_order() {
            Some(slice) if array.is_standard_layout() => FaerStorage::Borrowed(
                MatRef::from_row_major_slice(slice, array.nrows(), array.ncols()),
            ),
            Some(slice) if array.t().is_standard_layout() => FaerStorage::Borrowed(
                MatRef::from_column_major_slice(slice, array.nrows(), array.ncols()),
            ),
            _ => {
                let (rows, cols) = array.dim();
                FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
            }
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

pub trait FaerEigh {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigh for ArrayBase<S, Ix2> {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let eigen = faer_view
            .as_ref()
            .self_adjoint_eigen(side)
            .map_err(FaerLinalgError::SelfAdjointEigen)?;
        let values = diag_to_array(eigen.S());
        let vectors = mat_to_array(eigen.U());
        Ok((values, vectors))
    }
}

/// Lower Cholesky factor of a covariance matrix, used to evaluate Gaussian
/// log-densities without forming an explicit inverse.
pub struct FaerCholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl FaerCholeskyFactor {
    pub fn diag(&self) -> Array1<f64> {
        diag_to_array(self.factor.L().diagonal())
    }

    /// `ln |Σ|` from the factor diagonal.
    pub fn log_det(&self) -> f64 {
        2.0 * self.diag().iter().map(|v| v.ln()).sum::<f64>()
    }

    /// Mahalanobis norms `‖L⁻¹ r‖²` for every row of `residuals`, whitened by
    /// forward substitution against the lower factor.
    pub fn mahalanobis_rows(&self, residuals: ArrayView2<'_, f64>) -> Array1<f64> {
        let lower = mat_to_array(self.factor.L());
        let dim = lower.nrows();
        let mut z = Array1::<f64>::zeros(dim);
        residuals
            .rows()
            .into_iter()
            .map(|r| {
                for i in 0..dim {
                    let partial = lower.slice(s![i, ..i]).dot(&z.slice(s![..i]));
                    z[i] = (r[i] - partial) / lower[(i, i)];
                }
                z.dot(&z)
            })
            .collect()
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let factor = faer_view
            .as_ref()
            .llt(side)
            .map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { factor })
    }
}

/// `D · ln(2π)`, the constant part of a `D`-dimensional Gaussian log-density.
pub fn log_two_pi_term(dim: usize) -> f64 {
    dim as f64 * (2.0 * PI).ln()
}

/// Unbiased covariance of the rows of `rows`. Returns zeros when fewer than two
/// rows are available.
pub fn empirical_covariance(rows: ArrayView2<'_, f64>) -> Array2<f64> {
    let (n, d) = rows.dim();
    if n < 2 {
        return Array2::zeros((d, d));
    }
    let mean = rows.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(d));
    let centered = &rows - &mean;
    let mut cov = centered.t().dot(&centered);
    cov /= (n - 1) as f64;
    cov
}

/// Averages a matrix with its transpose in place.
pub fn symmetrize(matrix: &mut Array2<f64>) {
    let sym = (&*matrix + &matrix.t()) * 0.5;
    matrix.assign(&sym);
}

/// Rebuilds a symmetric matrix with every eigenvalue raised to at least `floor`.
pub fn clamp_spectrum(matrix: &Array2<f64>, floor: f64) -> Result<Array2<f64>, FaerLinalgError> {
    let mut sym = matrix.clone();
    symmetrize(&mut sym);
    let (values, vectors) = sym.eigh(Side::Lower)?;
    if values.iter().all(|&v| v >= floor) {
        return Ok(sym);
    }
    let clamped = values.mapv(|v| if v.is_finite() { v.max(floor) } else { floor });
    let scaled = &vectors * &clamped;
    let mut rebuilt = scaled.dot(&vectors.t());
    symmetrize(&mut rebuilt);
    Ok(rebuilt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_psd(n: usize, rank: usize, rng: &mut StdRng) -> Array2<f64> {
        let mut mat = Array2::zeros((rank, n));
        for i in 0..rank {
            for j in 0..n {
                mat[(i, j)] = rng.gen_range(-1.0..1.0);
            }
        }
        mat.t().dot(&mat)
    }

    #[test]
    fn mahalanobis_matches_explicit_inverse() {
        let cov = array![[2.0, 0.5], [0.5, 1.0]];
        let det: f64 = 2.0 * 1.0 - 0.25;
        let inv = array![[1.0, -0.5], [-0.5, 2.0]] / det;
        let residuals = array![[1.0, -1.0], [0.25, 2.0], [0.0, 0.0]];

        let factor = cov.cholesky(Side::Lower).unwrap();
        let quad = factor.mahalanobis_rows(residuals.view());
        for (n, row) in residuals.rows().into_iter().enumerate() {
            let expected = row.dot(&inv.dot(&row));
            assert_abs_diff_eq!(quad[n], expected, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(factor.log_det(), det.ln(), epsilon = 1e-12);
    }

    #[test]
    fn whitening_agrees_with_spectral_inverse() {
        let mut rng = StdRng::seed_from_u64(31);
        let mut cov = random_psd(4, 6, &mut rng);
        cov.diag_mut().mapv_inplace(|v| v + 0.1);
        let (values, vectors) = cov.eigh(Side::Lower).unwrap();
        let inv = (&vectors / &values).dot(&vectors.t());
        let residuals = Array2::from_shape_fn((5, 4), |_| rng.gen_range(-2.0..2.0));

        let factor = cov.cholesky(Side::Lower).unwrap();
        let quad = factor.mahalanobis_rows(residuals.view());
        for (n, row) in residuals.rows().into_iter().enumerate() {
            let expected = row.dot(&inv.dot(&row));
            assert_abs_diff_eq!(quad[n], expected, epsilon = 1e-9 * expected.max(1.0));
        }
        assert_abs_diff_eq!(
            factor.log_det(),
            values.mapv(f64::ln).sum(),
            epsilon = 1e-10
        );
    }

    #[test]
    fn empirical_covariance_is_unbiased() {
        let rows = array![[1.0, 2.0], [3.0, 2.0], [5.0, 8.0]];
        let cov = empirical_covariance(rows.view());
        assert_abs_diff_eq!(cov[(0, 0)], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[(1, 1)], 12.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[(0, 1)], 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[(1, 0)], 6.0, epsilon = 1e-12);

        let single = array![[1.0, 2.0]];
        assert!(empirical_covariance(single.view()).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn clamped_spectrum_respects_floor() {
        let mut rng = StdRng::seed_from_u64(42);
        let matrix = random_psd(6, 2, &mut rng);
        let floor = 1e-2;
        let clamped = clamp_spectrum(&matrix, floor).unwrap();
        let (values, _) = clamped.eigh(Side::Lower).unwrap();
        for &v in values.iter() {
            assert!(v >= floor * (1.0 - 1e-9), "eigenvalue {v} below floor");
        }
        for i in 0..6 {
            for j in 0..6 {
                assert_abs_diff_eq!(clamped[(i, j)], clamped[(j, i)], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn well_conditioned_matrix_passes_through_clamp() {
        let matrix = array![[3.0, 1.0], [1.0, 2.0]];
        let clamped = clamp_spectrum(&matrix, 1e-3).unwrap();
        for (a, b) in clamped.iter().zip(matrix.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    }
}
