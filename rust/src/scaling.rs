//! Underflow protection for conditional likelihoods.
//!
//! Rows whose mass drops below `SCALE_EPS` are multiplied by `SCALE_MAX`
//! (an exact power of two) and the row's exponent counter is incremented.
//! The true likelihood of a row is `scaled · SCALE_EPS^exponent`.

use ndarray::prelude::*;

pub const SCALE_EPS: f64 = 1.0 / 4_294_967_296.0;
pub const SCALE_MAX: f64 = 4_294_967_296.0;
/// ln(SCALE_EPS)
pub const LOG_SCALE_EPS: f64 = -22.180_709_777_918_249;

/// Rescale every row of `matrix` (sites × states) whose sum is below
/// `SCALE_EPS`, repeating until it is not, and count each step.
pub fn rescale(mut matrix: ArrayViewMut2<f64>, mut counters: ArrayViewMut1<u32>) {
    for (mut row, counter) in matrix.rows_mut().into_iter().zip(counters.iter_mut()) {
        let mut total = row.sum();
        // A zero row can never be rescaled out of underflow.
        while total < SCALE_EPS && total > 0.0 {
            row.mapv_inplace(|x| x * SCALE_MAX);
            *counter += 1;
            total *= SCALE_MAX;
        }
    }
}

/// Per-site normalization of exponents across rate classes.
///
/// `exponents` is classes × sites. Returns the relative factors
/// `SCALE_EPS^(e - min)` (classes × sites) and the per-site log offset
/// `min · LOG_SCALE_EPS`. Without this, a class rescaled far more often
/// than the others would vanish from the mixture.
pub fn normalize_exponents(exponents: ArrayView2<u32>) -> (Array2<f64>, Array1<f64>) {
    let n_sites = exponents.ncols();
    let mut factors = Array2::zeros(exponents.raw_dim());
    let mut offsets = Array1::zeros(n_sites);

    for site in 0..n_sites {
        let column = exponents.column(site);
        let min = column.iter().copied().min().unwrap_or(0);
        for (factor, &e) in factors.column_mut(site).iter_mut().zip(column.iter()) {
            *factor = (LOG_SCALE_EPS * f64::from(e - min)).exp();
        }
        offsets[site] = LOG_SCALE_EPS * f64::from(min);
    }

    (factors, offsets)
}

/// Site log-likelihoods of the mixture.
///
/// `site_likelihoods` and `exponents` are classes × sites, holding the
/// scaled `root · π` of each class and the root's total exponents.
pub fn mix_classes(
    site_likelihoods: ArrayView2<f64>,
    exponents: ArrayView2<u32>,
    weights: ArrayView1<f64>,
) -> Array1<f64> {
    let (factors, offsets) = normalize_exponents(exponents);
    let mut mixed = Array1::<f64>::zeros(site_likelihoods.ncols());
    for ((likelihoods, factor), &w) in site_likelihoods
        .rows()
        .into_iter()
        .zip(factors.rows())
        .zip(weights.iter())
    {
        mixed.zip_mut_with(&(&likelihoods * &factor), |m, &l| *m += w * l);
    }
    mixed.mapv_inplace(f64::ln);
    mixed + offsets
}

/// Per-class site log-likelihoods, `ln L + e · LOG_SCALE_EPS` (sites × classes).
pub fn class_log_likelihoods(
    site_likelihoods: ArrayView2<f64>,
    exponents: ArrayView2<u32>,
) -> Array2<f64> {
    let mut result = Array2::zeros((site_likelihoods.ncols(), site_likelihoods.nrows()));
    for ((mut out, likelihoods), exps) in result
        .columns_mut()
        .into_iter()
        .zip(site_likelihoods.rows())
        .zip(exponents.rows())
    {
        for ((o, &l), &e) in out.iter_mut().zip(likelihoods.iter()).zip(exps.iter()) {
            *o = l.ln() + LOG_SCALE_EPS * f64::from(e);
        }
    }
    result
}
