//! Observed data at the leaves, compressed to site patterns.
//!
//! Each tip stores one code per site pattern. Codes index rows of a shared
//! contrast matrix, which maps an observed (possibly ambiguous) character to
//! a distribution over model states. Gaps and ambiguity codes therefore need
//! no special casing in the hot loops.

use ndarray::prelude::*;

use crate::error::{PmlError, Result};

#[derive(Clone, Debug)]
pub struct TipData {
    /// n_codes × n_states
    contrast: Array2<f64>,
    /// n_tips × n_sites, 0-based row indices into `contrast`
    codes: Array2<usize>,
    /// Multiplicity of each site pattern
    pattern_weights: Array1<f64>,
}

impl TipData {
    pub fn new(
        contrast: Array2<f64>,
        codes: Array2<usize>,
        pattern_weights: Array1<f64>,
    ) -> Result<Self> {
        if codes.ncols() == 0 {
            return Err(PmlError::Empty { what: "site patterns" });
        }
        if pattern_weights.len() != codes.ncols() {
            return Err(PmlError::ShapeMismatch {
                what: "pattern weights",
                expected: codes.ncols(),
                found: pattern_weights.len(),
            });
        }

        let n_codes = contrast.nrows();
        for ((tip, site), &code) in codes.indexed_iter() {
            if code >= n_codes {
                return Err(PmlError::InvalidTipCode {
                    tip: tip + 1,
                    site,
                    code,
                    n_codes,
                });
            }
        }

        Ok(Self {
            contrast,
            codes,
            pattern_weights,
        })
    }

    /// Data with unit pattern weights.
    pub fn unweighted(contrast: Array2<f64>, codes: Array2<usize>) -> Result<Self> {
        let n_sites = codes.ncols();
        Self::new(contrast, codes, Array1::ones(n_sites))
    }

    /// Identity contrast: code `i` observes state `i`, code `n_states` is
    /// a gap/unknown observing every state.
    pub fn identity_contrast(n_states: usize) -> Array2<f64> {
        let mut contrast = Array2::zeros((n_states + 1, n_states));
        contrast.slice_mut(s![..n_states, ..]).diag_mut().fill(1.0);
        contrast.row_mut(n_states).fill(1.0);
        contrast
    }

    pub fn n_tips(&self) -> usize {
        self.codes.nrows()
    }

    pub fn n_sites(&self) -> usize {
        self.codes.ncols()
    }

    pub fn n_states(&self) -> usize {
        self.contrast.ncols()
    }

    pub fn contrast(&self) -> ArrayView2<'_, f64> {
        self.contrast.view()
    }

    pub fn pattern_weights(&self) -> ArrayView1<'_, f64> {
        self.pattern_weights.view()
    }

    /// Codes of leaf `tip` (1-based node number).
    #[inline]
    pub fn codes(&self, tip: usize) -> ArrayView1<'_, usize> {
        self.codes.row(tip - 1)
    }

    /// Per site, the elementwise product of all tips' contrast rows.
    ///
    /// A nonzero entry means every tip is compatible with that state, i.e.
    /// the site could be invariant in it.
    pub fn invariant_sites(&self) -> Array2<f64> {
        let mut result = Array2::ones((self.n_sites(), self.n_states()));
        for tip_codes in self.codes.rows() {
            for (mut row, &code) in result.rows_mut().into_iter().zip(tip_codes.iter()) {
                row *= &self.contrast.row(code);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_contrast_has_gap_row() {
        let c = TipData::identity_contrast(2);
        assert_eq!(c, arr2(&[[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]));
    }

    #[test]
    fn rejects_out_of_range_codes() {
        let err = TipData::unweighted(TipData::identity_contrast(2), arr2(&[[0, 1], [3, 0]]))
            .unwrap_err();
        assert_eq!(
            err,
            PmlError::InvalidTipCode {
                tip: 2,
                site: 0,
                code: 3,
                n_codes: 3
            }
        );
    }

    #[test]
    fn invariant_sites_flags_constant_and_gapped_columns() {
        // sites: constant 0, variable, constant 1 with a gap
        let tips = TipData::unweighted(
            TipData::identity_contrast(2),
            arr2(&[[0, 0, 1], [0, 1, 2], [0, 0, 1]]),
        )
        .unwrap();
        let inv = tips.invariant_sites();
        assert_eq!(inv, arr2(&[[1.0, 0.0], [0.0, 0.0], [0.0, 1.0]]));
    }

    #[test]
    fn codes_are_addressed_by_leaf_number() {
        let tips =
            TipData::unweighted(TipData::identity_contrast(2), arr2(&[[0, 1], [1, 1]])).unwrap();
        assert_eq!(tips.codes(2), arr1(&[1usize, 1]));
        assert_eq!(tips.pattern_weights(), arr1(&[1.0, 1.0]));
    }
}
