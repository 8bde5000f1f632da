//! The quartet fast path.
//!
//! Four nodes of the session tree are joined by two junction nodes `a` and
//! `b` that live outside the tree:
//!
//! ```text
//! c0         c2
//!    \     /
//!     a───b
//!    /     \
//! c1         c3
//! ```
//!
//! The junctions get slots of their own, numbered `n_nodes + 1` and
//! `n_nodes + 2`, layered over the arena. Internal pendant nodes contribute
//! their stored subtree conditionals. The session tree, its branch lengths
//! and the arena are never written.

use log::debug;
use ndarray::prelude::*;

use crate::arena::{NodeStore, NodeStoreMut, OverlaySlots};
use crate::error::{PmlError, Result};
use crate::optimize::{EdgeEstimate, EdgeOptimizer, NewtonConfig, RotatedEdge};
use crate::scaling;
use crate::session::Session;
use crate::update::ChildSide;

/// Conditionals and exponents of the two junction nodes.
#[derive(Clone, Debug)]
pub(crate) struct QuartetSlots {
    /// [class, junction, site, state]
    partials: Array4<f64>,
    /// [class, junction, site]
    exponents: Array3<u32>,
}

impl QuartetSlots {
    pub(crate) fn new(n_classes: usize, n_sites: usize, n_states: usize) -> Self {
        Self {
            partials: Array4::zeros((n_classes, 2, n_sites, n_states)),
            exponents: Array3::zeros((n_classes, 2, n_sites)),
        }
    }

    fn class_mut(&mut self, class: usize) -> (ArrayViewMut3<'_, f64>, ArrayViewMut2<'_, u32>) {
        (
            self.partials.index_axis_mut(Axis(0), class),
            self.exponents.index_axis_mut(Axis(0), class),
        )
    }
}

impl Session {
    /// Number of junction `a`; `b` follows it.
    fn junction(&self) -> usize {
        self.tree.n_nodes() + 1
    }

    fn junction_partial(&self, node: usize, class: usize) -> ArrayView2<'_, f64> {
        let slot = node - self.junction();
        self.quartet.partials.slice(s![class, slot, .., ..])
    }

    fn check_quartet(&self, nodes: &[usize; 4]) -> Result<()> {
        for &node in nodes {
            if !self.tree.contains(node) {
                return Err(PmlError::UnknownNode {
                    node,
                    n_nodes: self.tree.n_nodes(),
                });
            }
            if !self.tree.is_tip(node) {
                self.check_subtrees()?;
            }
        }
        Ok(())
    }

    /// Prune the quartet into the junction slots. Returns the scaled site
    /// likelihoods at `b` and its exponents, both classes × sites.
    fn quartet_pass(
        &mut self,
        nodes: [usize; 4],
        lengths: [f64; 5],
    ) -> (Array2<f64>, Array2<u32>) {
        let [c0, c1, c2, c3] = nodes;
        let [l0, l1, l2, l3, middle] = lengths;
        let a = self.junction();
        let b = a + 1;
        let edges = [
            (a, c0, l0),
            (a, c1, l1),
            (b, a, middle),
            (b, c2, l2),
            (b, c3, l3),
        ];

        let n_classes = self.model.n_classes();
        let n_sites = self.tips.n_sites();
        let mut site_likelihoods = Array2::zeros((n_classes, n_sites));
        let mut exponents = Array2::zeros((n_classes, n_sites));

        for class in 0..n_classes {
            let rate = self.model.classes.rates[class];
            let (local, local_exponents) = self.quartet.class_mut(class);
            let mut slots =
                OverlaySlots::new(self.arena.class_view(class), local, local_exponents, a);
            self.config.prune(
                &self.model.eigen,
                &self.tips,
                edges,
                rate,
                &mut slots,
                &mut self.work,
            );
            site_likelihoods
                .row_mut(class)
                .assign(&slots.partial(b).dot(&self.model.frequencies));
            exponents.row_mut(class).assign(&slots.exponents(b));
        }
        (site_likelihoods, exponents)
    }

    /// Site log-likelihoods of the unrooted quartet `((c0, c1), (c2, c3))`.
    ///
    /// `lengths` are the four pendant lengths followed by the middle edge.
    /// Internal pendants need their subtree conditionals: a full pass with
    /// the free root at the tree root and no open edge. Quartets of leaves
    /// can be scored at any time.
    pub fn quartet_site_log_likelihoods(
        &mut self,
        nodes: [usize; 4],
        lengths: [f64; 5],
    ) -> Result<Array1<f64>> {
        self.check_quartet(&nodes)?;
        let (site_likelihoods, exponents) = self.quartet_pass(nodes, lengths);
        Ok(scaling::mix_classes(
            site_likelihoods.view(),
            exponents.view(),
            self.model.classes.weights.view(),
        ))
    }

    /// Weighted total of [`quartet_site_log_likelihoods`](Self::quartet_site_log_likelihoods).
    pub fn quartet_log_likelihood(&mut self, nodes: [usize; 4], lengths: [f64; 5]) -> Result<f64> {
        let site_lnl = self.quartet_site_log_likelihoods(nodes, lengths)?;
        Ok(site_lnl.dot(&self.tips.pattern_weights()))
    }

    /// Multiply (or divide) junction `target` by the contribution of
    /// `source` across an edge of `length`, in every rate class.
    fn quartet_combine(&mut self, source: usize, target: usize, length: f64, divide: bool) {
        let a = self.junction();
        for class in 0..self.model.n_classes() {
            let rate = self.model.classes.rates[class];
            let (local, local_exponents) = self.quartet.class_mut(class);
            let mut slots =
                OverlaySlots::new(self.arena.class_view(class), local, local_exponents, a);
            self.config.contribution(
                &self.model.eigen,
                &self.tips,
                source,
                length,
                rate,
                &slots,
                &mut self.work,
            );
            let (mut matrix, _) = slots.node_mut(target);
            if divide {
                matrix.zip_mut_with(&self.work.contribution, |m, &c| *m /= c);
            } else {
                matrix *= &self.work.contribution;
            }
        }
    }

    /// Rotate quartet edge `(parent, child)` after it has been divided out
    /// of the junction holding the full conditional.
    fn quartet_rotate(&self, parent: usize, child: usize, length: f64) -> RotatedEdge {
        let a = self.junction();
        let n_classes = self.model.n_classes();
        let n_sites = self.tips.n_sites();
        let n_states = self.model.n_states();

        // b's exponents are the quartet totals, whichever junction holds
        // the full conditional
        let (factors, log_offset) =
            scaling::normalize_exponents(self.quartet.exponents.index_axis(Axis(1), 1));

        let mut x = Array3::zeros((n_classes, n_sites, n_states));
        let mut child_side = Array2::zeros((n_sites, n_states));
        for class in 0..n_classes {
            let side = if self.tree.is_tip(child) {
                ChildSide::Tip(child)
            } else if child >= a {
                ChildSide::Internal(self.junction_partial(child, class))
            } else {
                ChildSide::Internal(self.arena.get(child, class))
            };
            self.rotate_class(
                self.junction_partial(parent, class),
                side,
                factors.row(class),
                &mut child_side,
                x.index_axis_mut(Axis(0), class),
            );
        }

        RotatedEdge {
            parent,
            child,
            length,
            x,
            log_offset,
        }
    }

    /// Optimize the five edges of the quartet `((c0, c1), (c2, c3))`, last
    /// edge first: the pendants of `b`, the middle edge, then the pendants
    /// of `a`.
    ///
    /// Each edge is divided out, rotated, optimized and put back with its
    /// new length before the next is visited. Estimates come back in the
    /// order of `lengths`. Pendant preconditions are those of
    /// [`quartet_site_log_likelihoods`](Self::quartet_site_log_likelihoods);
    /// the session itself is left untouched.
    pub fn optimize_quartet(
        &mut self,
        nodes: [usize; 4],
        lengths: [f64; 5],
        config: &NewtonConfig,
    ) -> Result<[EdgeEstimate; 5]> {
        self.check_quartet(&nodes)?;
        self.quartet_pass(nodes, lengths);

        let [c0, c1, c2, c3] = nodes;
        let a = self.junction();
        let b = a + 1;
        let mut lengths = lengths;
        let mut estimates = [EdgeEstimate::default(); 5];

        for (parent, child, slot) in [(b, c3, 3), (b, c2, 2), (b, a, 4), (a, c1, 1), (a, c0, 0)] {
            self.quartet_combine(child, parent, lengths[slot], true);
            let edge = self.quartet_rotate(parent, child, lengths[slot]);
            let estimate = EdgeOptimizer::new(
                self.model.eigen.eigenvalues.view(),
                self.model.classes.rates.view(),
                self.model.classes.weights.view(),
                self.tips.pattern_weights(),
                config,
            )
            .optimize(&edge);

            if child == a {
                // a takes b's complement and holds the full conditional
                self.quartet_combine(b, a, estimate.length, false);
            } else {
                self.quartet_combine(child, parent, estimate.length, false);
            }
            lengths[slot] = estimate.length;
            estimates[slot] = estimate;
        }

        debug!(
            "quartet {nodes:?}: lengths {lengths:?}, lnL = {:.6}",
            estimates[0].log_likelihood
        );
        Ok(estimates)
    }
}
