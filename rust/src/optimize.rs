//! Damped Newton-Raphson search for a single branch length.
//!
//! Works on the rotated form of an edge, in which the likelihood of a site
//! is a short sum of exponentials in the branch length:
//!
//! f_s(t) = Σ_c w_c Σ_h X[c, s, h] · exp(λ_h r_c t)
//!
//! so each evaluation costs O(classes × sites × states) no matter how large
//! the tree is. Steps are taken in log(t); the curvature is the outer
//! product of per-site scores.

use log::{debug, trace};
use ndarray::linalg::general_mat_vec_mul;
use ndarray::prelude::*;

/// Tuning of the branch-length search.
#[derive(Clone, Debug, PartialEq)]
pub struct NewtonConfig {
    pub max_iterations: usize,
    /// Stop once an accepted step improves lnL by no more than this
    pub tolerance: f64,
    /// Bound on |Newton step| in log-length units
    pub max_step: f64,
    pub min_length: f64,
    pub max_length: f64,
    /// Propose t/2 before clamping a step that lands below `min_length`
    pub halve_below_min: bool,
}

impl Default for NewtonConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            tolerance: 1e-5,
            max_step: 3.0,
            min_length: 1e-8,
            max_length: 10.0,
            halve_below_min: false,
        }
    }
}

impl NewtonConfig {
    /// Short search used while the topology is still changing.
    pub fn quick() -> Self {
        Self {
            max_iterations: 5,
            halve_below_min: true,
            ..Self::default()
        }
    }
}

/// One edge with its length factored out.
#[derive(Clone, Debug)]
pub struct RotatedEdge {
    pub parent: usize,
    pub child: usize,
    /// Length before optimization
    pub length: f64,
    /// classes × sites × states, already multiplied by each class's
    /// relative scale factor
    pub x: Array3<f64>,
    /// Per-site log offset restoring the common scale
    pub log_offset: Array1<f64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EdgeEstimate {
    pub length: f64,
    /// Inverse of the observed information at `length`
    pub variance: f64,
    pub log_likelihood: f64,
    pub iterations: usize,
}

/// Evaluates and maximizes the likelihood of a [`RotatedEdge`].
pub struct EdgeOptimizer<'a> {
    eigenvalues: ArrayView1<'a, f64>,
    rates: ArrayView1<'a, f64>,
    class_weights: ArrayView1<'a, f64>,
    pattern_weights: ArrayView1<'a, f64>,
    config: &'a NewtonConfig,
}

impl<'a> EdgeOptimizer<'a> {
    pub fn new(
        eigenvalues: ArrayView1<'a, f64>,
        rates: ArrayView1<'a, f64>,
        class_weights: ArrayView1<'a, f64>,
        pattern_weights: ArrayView1<'a, f64>,
        config: &'a NewtonConfig,
    ) -> Self {
        Self {
            eigenvalues,
            rates,
            class_weights,
            pattern_weights,
            config,
        }
    }

    /// f_s(t) and, when requested, f'_s(t) into the given buffers.
    fn site_values(
        &self,
        edge: &RotatedEdge,
        t: f64,
        f: &mut Array1<f64>,
        mut df: Option<&mut Array1<f64>>,
    ) {
        f.fill(0.0);
        if let Some(df) = df.as_deref_mut() {
            df.fill(0.0);
        }

        for ((x, &rate), &w) in edge
            .x
            .outer_iter()
            .zip(self.rates.iter())
            .zip(self.class_weights.iter())
        {
            let e = self.eigenvalues.mapv(|lambda| (lambda * rate * t).exp());
            general_mat_vec_mul(w, &x, &e, 1.0, f);

            if let Some(df) = df.as_deref_mut() {
                let de = &e * &self.eigenvalues * rate;
                general_mat_vec_mul(w, &x, &de, 1.0, df);
            }
        }
    }

    /// Log-likelihood of the whole alignment with this edge at length `t`.
    pub fn log_likelihood(&self, edge: &RotatedEdge, t: f64) -> f64 {
        let mut f = Array1::zeros(edge.log_offset.len());
        self.site_values(edge, t, &mut f, None);
        self.total(&f, edge)
    }

    fn total(&self, f: &Array1<f64>, edge: &RotatedEdge) -> f64 {
        f.iter()
            .zip(edge.log_offset.iter())
            .zip(self.pattern_weights.iter())
            .map(|((&f, &offset), &w)| w * (f.ln() + offset))
            .sum()
    }

    /// Search for the maximum-likelihood length of `edge`.
    pub fn optimize(&self, edge: &RotatedEdge) -> EdgeEstimate {
        let config = self.config;
        let n_sites = edge.log_offset.len();
        let mut f = Array1::zeros(n_sites);
        let mut df = Array1::zeros(n_sites);

        let mut t = edge.length.max(config.min_length);
        let mut l0 = self.log_likelihood(edge, t);
        let mut step_scale = 1.0;
        let mut delta = 0.0;
        let mut eps = f64::INFINITY;
        let mut iterations = 0;

        while eps > config.tolerance && iterations < config.max_iterations {
            if step_scale > 0.6 {
                self.site_values(edge, t, &mut f, Some(&mut df));
                let (score, information) = f
                    .iter()
                    .zip(df.iter())
                    .zip(self.pattern_weights.iter())
                    .fold((0.0, 0.0), |(score, info), ((&f, &df), &w)| {
                        let d = t * df / f;
                        (score + w * d, info + w * d * d)
                    });
                delta = score / information;
                if !delta.is_finite() {
                    trace!("edge ({}, {}): Newton ratio not finite", edge.parent, edge.child);
                    break;
                }
                delta = delta.clamp(-config.max_step, config.max_step);
            }

            let mut proposal = (t.ln() + step_scale * delta).exp().min(config.max_length);
            if proposal < config.min_length {
                if config.halve_below_min {
                    proposal = t / 2.0;
                }
                proposal = proposal.max(config.min_length);
            }

            let l1 = self.log_likelihood(edge, proposal);
            let gain = l1 - l0;
            if gain.is_nan() {
                eps = 0.0;
            } else if gain < 0.0 {
                step_scale /= 2.0;
                eps = 1.0;
            } else {
                t = proposal;
                l0 = l1;
                step_scale = 1.0;
                eps = gain;
            }
            iterations += 1;

            trace!(
                "edge ({}, {}) iter {}: t = {:.8}, lnL = {:.8}, gain = {:.3e}",
                edge.parent,
                edge.child,
                iterations,
                t,
                l0,
                gain
            );
        }

        self.site_values(edge, t, &mut f, Some(&mut df));
        let information: f64 = f
            .iter()
            .zip(df.iter())
            .zip(self.pattern_weights.iter())
            .map(|((&f, &df), &w)| w * (df / f).powi(2))
            .sum();

        debug!(
            "edge ({}, {}): {:.6} -> {:.6} after {} iterations, lnL = {:.6}",
            edge.parent, edge.child, edge.length, t, iterations, l0
        );

        EdgeEstimate {
            length: t,
            variance: 1.0 / information,
            log_likelihood: l0,
            iterations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Two-state model, one class: f(t) = a + b·exp(-2t) per site.
    fn edge(a: &[f64], b: &[f64], length: f64) -> RotatedEdge {
        let n = a.len();
        let mut x = Array3::zeros((1, n, 2));
        for s in 0..n {
            x[[0, s, 0]] = a[s];
            x[[0, s, 1]] = b[s];
        }
        RotatedEdge {
            parent: 3,
            child: 1,
            length,
            x,
            log_offset: Array1::zeros(n),
        }
    }

    fn fixture() -> (Array1<f64>, Array1<f64>, Array1<f64>) {
        (arr1(&[0.0, -2.0]), arr1(&[1.0]), arr1(&[1.0]))
    }

    #[test]
    fn evaluates_sum_of_exponentials() {
        let (eigenvalues, rates, weights) = fixture();
        let pattern_weights = arr1(&[2.0, 1.0]);
        let config = NewtonConfig::default();
        let opt = EdgeOptimizer::new(
            eigenvalues.view(),
            rates.view(),
            weights.view(),
            pattern_weights.view(),
            &config,
        );
        let e = edge(&[0.25, 0.25], &[0.25, -0.25], 0.1);
        let t = 0.3_f64;
        let expected = 2.0 * (0.25 + 0.25 * (-2.0 * t).exp()).ln()
            + (0.25 - 0.25 * (-2.0 * t).exp()).ln();
        assert_abs_diff_eq!(opt.log_likelihood(&e, t), expected, epsilon = 1e-14);
    }

    #[test]
    fn finds_closed_form_maximum() {
        // n_same sites agreeing and n_diff disagreeing across one edge of the
        // symmetric two-state model: the MLE is t = -ln(1 - 2p)/2 with
        // p = n_diff / n.
        let (eigenvalues, rates, weights) = fixture();
        let pattern_weights = arr1(&[80.0, 20.0]);
        let config = NewtonConfig {
            max_iterations: 100,
            tolerance: 1e-12,
            ..NewtonConfig::default()
        };
        let opt = EdgeOptimizer::new(
            eigenvalues.view(),
            rates.view(),
            weights.view(),
            pattern_weights.view(),
            &config,
        );
        let e = edge(&[0.25, 0.25], &[0.25, -0.25], 0.05);
        let estimate = opt.optimize(&e);

        let expected = -(1.0 - 2.0 * 0.2_f64).ln() / 2.0;
        assert_abs_diff_eq!(estimate.length, expected, epsilon = 1e-6);
        assert!(estimate.iterations > 1);
        assert!(estimate.variance > 0.0 && estimate.variance.is_finite());
        assert_abs_diff_eq!(
            estimate.log_likelihood,
            opt.log_likelihood(&e, estimate.length),
            epsilon = 1e-12
        );
    }

    #[test]
    fn identical_sequences_shrink_towards_minimum() {
        let (eigenvalues, rates, weights) = fixture();
        let pattern_weights = arr1(&[50.0]);
        let config = NewtonConfig::quick();
        let opt = EdgeOptimizer::new(
            eigenvalues.view(),
            rates.view(),
            weights.view(),
            pattern_weights.view(),
            &config,
        );
        let e = edge(&[0.25], &[0.25], 0.5);
        let estimate = opt.optimize(&e);
        assert!(estimate.length < 0.5);
        assert!(estimate.length >= config.min_length);
        assert!(estimate.iterations <= 5);
        assert!(estimate.log_likelihood > opt.log_likelihood(&e, 0.5));
    }

    #[test]
    fn saturated_edge_is_capped_at_max_length() {
        // Half the sites differ: the likelihood is maximized as t -> ∞.
        let (eigenvalues, rates, weights) = fixture();
        let pattern_weights = arr1(&[10.0, 12.0]);
        let config = NewtonConfig {
            max_iterations: 50,
            max_length: 2.0,
            ..NewtonConfig::default()
        };
        let opt = EdgeOptimizer::new(
            eigenvalues.view(),
            rates.view(),
            weights.view(),
            pattern_weights.view(),
            &config,
        );
        let e = edge(&[0.25, 0.25], &[0.25, -0.25], 0.5);
        let estimate = opt.optimize(&e);
        assert!(estimate.length <= 2.0);
        assert!(estimate.length > 1.0);
    }
}
