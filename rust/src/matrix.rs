//! Transition probability matrices from a cached eigendecomposition.
//!
//! The decomposition of the instantaneous rate matrix is computed once per
//! analysis and shared by every edge and rate class:
//! P(t, r) = V diag(exp(λ r t)) V^{-1}
//!
//! Each call is O(n^3) and runs once per edge, per rate class, per pass.

use ndarray::linalg::general_mat_mul;
use ndarray::prelude::*;

use crate::error::{PmlError, Result};

/// Cached eigendecomposition of a rate matrix
#[derive(Clone, Debug)]
pub struct EigenDecomposition {
    /// Eigenvalues (λ)
    pub eigenvalues: Array1<f64>,
    /// Eigenvectors (V): columns are eigenvectors
    pub eigenvectors: Array2<f64>,
    /// V^{-1}
    pub eigenvectors_inv: Array2<f64>,
    /// Number of states
    pub n: usize,
}

impl EigenDecomposition {
    /// Wrap an externally computed decomposition, checking only shapes.
    pub fn new(
        eigenvalues: Array1<f64>,
        eigenvectors: Array2<f64>,
        eigenvectors_inv: Array2<f64>,
    ) -> Result<Self> {
        let n = eigenvalues.len();
        if n == 0 {
            return Err(PmlError::Empty { what: "eigenvalues" });
        }
        for (what, m) in [
            ("eigenvector rows", eigenvectors.nrows()),
            ("eigenvector columns", eigenvectors.ncols()),
            ("inverse eigenvector rows", eigenvectors_inv.nrows()),
            ("inverse eigenvector columns", eigenvectors_inv.ncols()),
        ] {
            if m != n {
                return Err(PmlError::ShapeMismatch {
                    what,
                    expected: n,
                    found: m,
                });
            }
        }

        Ok(Self {
            eigenvalues,
            eigenvectors,
            eigenvectors_inv,
            n,
        })
    }

    /// Decompose a reversible rate matrix
    ///
    /// For reversible Q with stationary frequencies π:
    /// 1. Symmetrize: S = Π^{1/2} Q Π^{-1/2}
    /// 2. Eigendecomposition: S = W D W^T
    /// 3. Transform back: V = Π^{-1/2} W, V^{-1} computed by LAPACK
    #[cfg(feature = "lapack")]
    pub fn from_reversible(q: ArrayView2<f64>, pi: ArrayView1<f64>) -> Result<Self> {
        use ndarray_linalg::{Eigh, Inverse, UPLO};

        let n = q.nrows();
        if q.ncols() != n {
            return Err(PmlError::ShapeMismatch {
                what: "rate matrix columns",
                expected: n,
                found: q.ncols(),
            });
        }
        if pi.len() != n {
            return Err(PmlError::ShapeMismatch {
                what: "equilibrium frequencies",
                expected: n,
                found: pi.len(),
            });
        }

        let sqrt_pi = pi.mapv(f64::sqrt);
        let inv_sqrt_pi = pi.mapv(|x| 1.0 / x.sqrt());

        let s = Array2::from_shape_fn((n, n), |(i, j)| sqrt_pi[i] * q[[i, j]] * inv_sqrt_pi[j]);

        let (eigenvalues, w) = s
            .eigh(UPLO::Lower)
            .map_err(|e| PmlError::Decomposition(format!("{e:?}")))?;

        let eigenvectors = Array2::from_shape_fn((n, n), |(i, j)| inv_sqrt_pi[i] * w[[i, j]]);
        let eigenvectors_inv = eigenvectors
            .inv()
            .map_err(|e| PmlError::Decomposition(format!("{e:?}")))?;

        Self::new(eigenvalues, eigenvectors, eigenvectors_inv)
    }

    /// Transition matrix for branch length `t` under rate multiplier `rate`.
    pub fn transition_matrix(&self, t: f64, rate: f64) -> Array2<f64> {
        let mut scaled = Array2::zeros((self.n, self.n));
        let mut p = Array2::zeros((self.n, self.n));
        self.transition_matrix_into(t, rate, &mut scaled, &mut p);
        p
    }

    /// Non-allocating form of [`transition_matrix`](Self::transition_matrix).
    ///
    /// `scaled` is an n×n scratch buffer for V diag(exp(λ r t)).
    /// A zero length or zero rate yields the exact identity.
    #[inline]
    pub fn transition_matrix_into(
        &self,
        t: f64,
        rate: f64,
        scaled: &mut Array2<f64>,
        out: &mut Array2<f64>,
    ) {
        if t == 0.0 || rate == 0.0 {
            out.fill(0.0);
            out.diag_mut().fill(1.0);
            return;
        }

        scaled.assign(&self.eigenvectors);
        for (mut column, &lambda) in scaled.columns_mut().into_iter().zip(self.eigenvalues.iter()) {
            let e = (lambda * rate * t).exp();
            column.mapv_inplace(|x| x * e);
        }
        general_mat_mul(1.0, scaled, &self.eigenvectors_inv, 0.0, out);
    }

    /// One matrix per (edge, rate class), edge-major.
    pub fn transition_matrices(&self, branch_lengths: &[f64], rates: &[f64]) -> Vec<Array2<f64>> {
        branch_lengths
            .iter()
            .flat_map(|&t| rates.iter().map(move |&r| (t, r)))
            .map(|(t, r)| self.transition_matrix(t, r))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Symmetric two-state model Q = [[-1, 1], [1, -1]]
    pub(crate) fn two_state() -> EigenDecomposition {
        EigenDecomposition::new(
            arr1(&[0.0, -2.0]),
            arr2(&[[1.0, 1.0], [1.0, -1.0]]),
            arr2(&[[0.5, 0.5], [0.5, -0.5]]),
        )
        .unwrap()
    }

    /// Jukes-Cantor with unit expected rate
    pub(crate) fn jukes_cantor() -> EigenDecomposition {
        let h = arr2(&[
            [1.0, 1.0, 1.0, 1.0],
            [1.0, -1.0, 1.0, -1.0],
            [1.0, 1.0, -1.0, -1.0],
            [1.0, -1.0, -1.0, 1.0],
        ]);
        let l = -4.0 / 3.0;
        EigenDecomposition::new(arr1(&[0.0, l, l, l]), h.clone(), h / 4.0).unwrap()
    }

    #[test]
    fn zero_length_is_exact_identity() {
        let eigen = jukes_cantor();
        for rate in [0.0, 0.3, 2.5] {
            let p = eigen.transition_matrix(0.0, rate);
            assert_eq!(p, Array2::eye(4));
        }
        assert_eq!(eigen.transition_matrix(0.7, 0.0), Array2::eye(4));
    }

    #[test]
    fn two_state_matches_closed_form() {
        let eigen = two_state();
        let t = 0.37;
        let r = 1.6;
        let p = eigen.transition_matrix(t, r);
        let e = (-2.0 * r * t).exp();
        assert_abs_diff_eq!(p[[0, 0]], 0.5 + 0.5 * e, epsilon = 1e-14);
        assert_abs_diff_eq!(p[[0, 1]], 0.5 - 0.5 * e, epsilon = 1e-14);
        assert_abs_diff_eq!(p[[1, 0]], 0.5 - 0.5 * e, epsilon = 1e-14);
        assert_abs_diff_eq!(p[[1, 1]], 0.5 + 0.5 * e, epsilon = 1e-14);
    }

    #[test]
    fn rows_sum_to_one_and_rate_scales_time() {
        let eigen = jukes_cantor();
        let p = eigen.transition_matrix(0.2, 1.5);
        for row in p.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
        let q = eigen.transition_matrix(0.3, 1.0);
        for (a, b) in p.iter().zip(q.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-14);
        }
    }

    #[test]
    fn transition_matrices_are_edge_major() {
        let eigen = two_state();
        let ps = eigen.transition_matrices(&[0.1, 0.0], &[1.0, 2.0]);
        assert_eq!(ps.len(), 4);
        assert_eq!(ps[1], eigen.transition_matrix(0.1, 2.0));
        assert_eq!(ps[2], Array2::eye(2));
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let err = EigenDecomposition::new(arr1(&[0.0, -1.0]), Array2::eye(3), Array2::eye(2))
            .unwrap_err();
        assert!(matches!(err, PmlError::ShapeMismatch { expected: 2, found: 3, .. }));
    }

    #[cfg(feature = "lapack")]
    #[test]
    fn reversible_decomposition_reproduces_rate_matrix() {
        let pi = arr1(&[0.3, 0.5, 0.2]);
        let mut q = Array2::zeros((3, 3));
        q[[0, 1]] = 1.0 * pi[1];
        q[[1, 0]] = 1.0 * pi[0];
        q[[1, 2]] = 0.5 * pi[2];
        q[[2, 1]] = 0.5 * pi[1];
        q[[0, 2]] = 0.2 * pi[2];
        q[[2, 0]] = 0.2 * pi[0];
        for i in 0..3 {
            let row_sum: f64 = q.row(i).sum();
            q[[i, i]] = -row_sum;
        }

        let eigen = EigenDecomposition::from_reversible(q.view(), pi.view()).unwrap();
        let p = eigen.transition_matrix(0.1, 1.0);
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(pi[i] * p[[i, j]], pi[j] * p[[j, i]], epsilon = 1e-10);
            }
        }
    }
}
