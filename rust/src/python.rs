//! Python bindings (`pmlcore_rust` extension module).

use numpy::{PyArray1, PyArray2, PyReadonlyArray1, PyReadonlyArray2};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::error::PmlError;
use crate::matrix::EigenDecomposition;
use crate::model::{Model, RateClasses};
use crate::optimize::NewtonConfig;
use crate::pruning::PruningConfig;
use crate::session::Session;
use crate::tips::TipData;
use crate::tree::Tree;

impl From<PmlError> for PyErr {
    fn from(err: PmlError) -> PyErr {
        PyValueError::new_err(err.to_string())
    }
}

/// Likelihood session over one tree, model and alignment.
///
/// Args:
///     eigenvalues, eigenvectors, eigenvectors_inv: decomposition of Q
///     frequencies: equilibrium frequencies (n_states,)
///     weights, rates: rate-class mixture
///     contrast: code → state compatibility (n_codes × n_states)
///     codes: 0-based codes per tip and site pattern (n_tips × n_sites)
///     pattern_weights: multiplicity of each site pattern
///     edges: (parent, child) pairs in parent-contiguous post-order
///     branch_lengths: one per edge
#[pyclass(name = "Session", module = "pmlcore_rust")]
pub struct PySession {
    inner: Session,
}

#[pymethods]
impl PySession {
    #[new]
    #[pyo3(signature = (
        eigenvalues, eigenvectors, eigenvectors_inv, frequencies, weights, rates,
        contrast, codes, pattern_weights, edges, n_tips, branch_lengths
    ))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        eigenvalues: PyReadonlyArray1<f64>,
        eigenvectors: PyReadonlyArray2<f64>,
        eigenvectors_inv: PyReadonlyArray2<f64>,
        frequencies: PyReadonlyArray1<f64>,
        weights: PyReadonlyArray1<f64>,
        rates: PyReadonlyArray1<f64>,
        contrast: PyReadonlyArray2<f64>,
        codes: PyReadonlyArray2<i64>,
        pattern_weights: PyReadonlyArray1<f64>,
        edges: Vec<(usize, usize)>,
        n_tips: usize,
        branch_lengths: Vec<f64>,
    ) -> PyResult<Self> {
        let codes = codes.as_array();
        if let Some(&negative) = codes.iter().find(|&&c| c < 0) {
            return Err(PyValueError::new_err(format!("negative tip code {negative}")));
        }

        let eigen = EigenDecomposition::new(
            eigenvalues.as_array().to_owned(),
            eigenvectors.as_array().to_owned(),
            eigenvectors_inv.as_array().to_owned(),
        )?;
        let classes = RateClasses::new(weights.as_array().to_owned(), rates.as_array().to_owned())?;
        let model = Model::new(eigen, frequencies.as_array().to_owned(), classes)?;
        let tips = TipData::new(
            contrast.as_array().to_owned(),
            codes.mapv(|c| c as usize),
            pattern_weights.as_array().to_owned(),
        )?;
        let tree = Tree::new(edges, n_tips)?;

        let inner = Session::new(model, tips, tree, branch_lengths, PruningConfig::default())?;
        Ok(Self { inner })
    }

    /// Total log-likelihood from a full pass.
    fn log_likelihood(&mut self, py: Python<'_>) -> f64 {
        py.allow_threads(|| self.inner.log_likelihood())
    }

    fn site_log_likelihoods<'py>(&mut self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        let result = py.allow_threads(|| self.inner.site_log_likelihoods());
        PyArray1::from_owned_array_bound(py, result)
    }

    /// Sites × classes log-likelihoods.
    fn site_log_likelihoods_by_class<'py>(&mut self, py: Python<'py>) -> Bound<'py, PyArray2<f64>> {
        let result = py.allow_threads(|| self.inner.site_log_likelihoods_by_class());
        PyArray2::from_owned_array_bound(py, result)
    }

    /// Log-likelihood of the quartet ((c0, c1), (c2, c3)); `lengths` are the
    /// four pendant lengths followed by the middle edge.
    fn quartet_log_likelihood(&mut self, nodes: [usize; 4], lengths: [f64; 5]) -> PyResult<f64> {
        Ok(self.inner.quartet_log_likelihood(nodes, lengths)?)
    }

    /// Optimize the five quartet edges in turn. Returns the new lengths in
    /// the order of `lengths`.
    #[pyo3(signature = (nodes, lengths, quick = false))]
    fn optimize_quartet(
        &mut self,
        py: Python<'_>,
        nodes: [usize; 4],
        lengths: [f64; 5],
        quick: bool,
    ) -> PyResult<Vec<f64>> {
        let config = newton_config(quick);
        let estimates =
            py.allow_threads(|| self.inner.optimize_quartet(nodes, lengths, &config))?;
        Ok(estimates.iter().map(|estimate| estimate.length).collect())
    }

    /// Optimize one edge. Returns (length, variance, log_likelihood, iterations).
    #[pyo3(signature = (parent, child, quick = false))]
    fn optimize_edge(
        &mut self,
        py: Python<'_>,
        parent: usize,
        child: usize,
        quick: bool,
    ) -> PyResult<(f64, f64, f64, usize)> {
        let config = newton_config(quick);
        let estimate = py.allow_threads(|| self.inner.optimize_edge(parent, child, &config))?;
        Ok((
            estimate.length,
            estimate.variance,
            estimate.log_likelihood,
            estimate.iterations,
        ))
    }

    /// One round over all edges. Returns (branch_lengths, log_likelihood).
    #[pyo3(signature = (quick = false))]
    fn optimize_edges(&mut self, py: Python<'_>, quick: bool) -> PyResult<(Vec<f64>, f64)> {
        let config = newton_config(quick);
        Ok(py.allow_threads(|| self.inner.optimize_edges(&config))?)
    }

    #[getter]
    fn branch_lengths(&self) -> Vec<f64> {
        self.inner.branch_lengths().to_vec()
    }

    fn set_branch_length(&mut self, parent: usize, child: usize, length: f64) -> PyResult<()> {
        Ok(self.inner.set_branch_length(parent, child, length)?)
    }
}

fn newton_config(quick: bool) -> NewtonConfig {
    if quick {
        NewtonConfig::quick()
    } else {
        NewtonConfig::default()
    }
}

/// Transition matrix P(t) = V diag(exp(λ r t)) V^{-1}
#[pyfunction]
#[pyo3(signature = (eigenvalues, eigenvectors, eigenvectors_inv, t, rate = 1.0))]
fn transition_matrix<'py>(
    py: Python<'py>,
    eigenvalues: PyReadonlyArray1<'py, f64>,
    eigenvectors: PyReadonlyArray2<'py, f64>,
    eigenvectors_inv: PyReadonlyArray2<'py, f64>,
    t: f64,
    rate: f64,
) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let eigen = EigenDecomposition::new(
        eigenvalues.as_array().to_owned(),
        eigenvectors.as_array().to_owned(),
        eigenvectors_inv.as_array().to_owned(),
    )?;
    Ok(PyArray2::from_owned_array_bound(py, eigen.transition_matrix(t, rate)))
}

#[pymodule]
fn pmlcore_rust(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PySession>()?;
    m.add_function(wrap_pyfunction!(transition_matrix, m)?)?;
    Ok(())
}
