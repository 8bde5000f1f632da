//! Substitution model: eigendecomposition, equilibrium frequencies and the
//! discrete rate mixture.

use ndarray::prelude::*;

use crate::error::{PmlError, Result};
use crate::matrix::EigenDecomposition;

/// Discrete mixture of rate classes (e.g. gamma categories).
#[derive(Clone, Debug)]
pub struct RateClasses {
    /// Mixture weights, one per class
    pub weights: Array1<f64>,
    /// Rate multipliers, one per class
    pub rates: Array1<f64>,
}

impl RateClasses {
    pub fn new(weights: Array1<f64>, rates: Array1<f64>) -> Result<Self> {
        if weights.is_empty() {
            return Err(PmlError::Empty { what: "rate classes" });
        }
        if rates.len() != weights.len() {
            return Err(PmlError::ShapeMismatch {
                what: "rate multipliers",
                expected: weights.len(),
                found: rates.len(),
            });
        }
        Ok(Self { weights, rates })
    }

    /// A single class with weight 1 and rate 1.
    pub fn single() -> Self {
        Self {
            weights: arr1(&[1.0]),
            rates: arr1(&[1.0]),
        }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Everything about the substitution process that stays fixed during an
/// analysis.
#[derive(Clone, Debug)]
pub struct Model {
    pub eigen: EigenDecomposition,
    /// Equilibrium frequencies π
    pub frequencies: Array1<f64>,
    pub classes: RateClasses,
    /// diag(π) V, the parent-side rotation of an edge
    pub(crate) weighted_eigenvectors: Array2<f64>,
}

impl Model {
    pub fn new(
        eigen: EigenDecomposition,
        frequencies: Array1<f64>,
        classes: RateClasses,
    ) -> Result<Self> {
        if frequencies.len() != eigen.n {
            return Err(PmlError::ShapeMismatch {
                what: "equilibrium frequencies",
                expected: eigen.n,
                found: frequencies.len(),
            });
        }

        let weighted_eigenvectors = &eigen.eigenvectors * &frequencies.view().insert_axis(Axis(1));

        Ok(Self {
            eigen,
            frequencies,
            classes,
            weighted_eigenvectors,
        })
    }

    pub fn n_states(&self) -> usize {
        self.eigen.n
    }

    pub fn n_classes(&self) -> usize {
        self.classes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::tests::two_state;

    #[test]
    fn weighted_eigenvectors_scale_rows_by_frequency() {
        let model = Model::new(two_state(), arr1(&[0.25, 0.75]), RateClasses::single()).unwrap();
        assert_eq!(
            model.weighted_eigenvectors,
            arr2(&[[0.25, 0.25], [0.75, -0.75]])
        );
    }

    #[test]
    fn rejects_frequency_length_mismatch() {
        let err = Model::new(two_state(), arr1(&[1.0]), RateClasses::single()).unwrap_err();
        assert_eq!(
            err,
            PmlError::ShapeMismatch {
                what: "equilibrium frequencies",
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn rate_classes_need_matching_lengths() {
        assert!(RateClasses::new(arr1(&[0.5, 0.5]), arr1(&[1.0])).is_err());
        assert!(RateClasses::new(Array1::zeros(0), Array1::zeros(0)).is_err());
        assert_eq!(RateClasses::new(arr1(&[0.5, 0.5]), arr1(&[0.4, 1.6])).unwrap().len(), 2);
    }
}
