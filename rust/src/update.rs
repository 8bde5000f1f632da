//! Incremental edge updates on a filled arena.
//!
//! After a full pass the tree root holds the full conditional likelihood of
//! the whole alignment. Moving that "free root" across an edge costs one
//! division and one multiplication per rate class:
//!
//! x → y:  LL[x] /= LL[y] · Pᵀ   then   LL[y] *= LL[x] · Pᵀ
//!
//! Afterwards every node on the path from the tree root to the free root
//! holds its conditional with the branch towards the free root removed,
//! and all other nodes still hold their subtree conditionals. This relies
//! on the model being time-reversible.
//!
//! None of these steps rescale: a full conditional carries the tree root's
//! exponents wherever it sits, so per-class scale factors stay valid until
//! the next full pass.

use log::{debug, warn};
use ndarray::linalg::general_mat_mul;
use ndarray::prelude::*;

use crate::error::{PmlError, Result};
use crate::optimize::{EdgeEstimate, EdgeOptimizer, NewtonConfig, RotatedEdge};
use crate::scaling;
use crate::session::Session;

/// Child end of an edge being rotated.
pub(crate) enum ChildSide<'a> {
    /// Leaf, rotated through its codes
    Tip(usize),
    /// Stored conditional of an internal node
    Internal(ArrayView2<'a, f64>),
}

impl Session {
    /// One rate class of a rotated edge:
    /// X = (parent · diag(π) V) ∘ (child · Vinvᵀ), each site multiplied by
    /// its scale factor. `child_side` is sites × states scratch.
    pub(crate) fn rotate_class(
        &self,
        parent: ArrayView2<'_, f64>,
        child: ChildSide<'_>,
        factors: ArrayView1<'_, f64>,
        child_side: &mut Array2<f64>,
        mut x: ArrayViewMut2<'_, f64>,
    ) {
        general_mat_mul(1.0, &parent, &self.model.weighted_eigenvectors, 0.0, &mut x);
        match child {
            ChildSide::Tip(tip) => {
                let codes = self.tips.codes(tip);
                for (mut row, &code) in child_side.rows_mut().into_iter().zip(codes.iter()) {
                    row.assign(&self.rotated_contrast.row(code));
                }
            }
            ChildSide::Internal(partial) => general_mat_mul(
                1.0,
                &partial,
                &self.model.eigen.eigenvectors_inv.t(),
                0.0,
                child_side,
            ),
        }
        x *= &*child_side;
        for (mut row, &factor) in x.rows_mut().into_iter().zip(factors.iter()) {
            row *= factor;
        }
    }

    fn ensure_evaluated(&self) -> Result<usize> {
        if let Some((parent, child)) = self.open_edge {
            return Err(PmlError::EdgeOpen { parent, child });
        }
        self.free_root.ok_or(PmlError::NotEvaluated)
    }

    /// Length of the edge joining neighbours `a` and `b`.
    fn length_between(&self, a: usize, b: usize) -> Result<f64> {
        let index = match self.tree.find_edge(a, b) {
            Ok(index) => index,
            Err(_) => self.tree.find_edge(b, a)?,
        };
        Ok(self.lengths[index])
    }

    /// Write the contribution of `node` across an edge of `length` in
    /// `class` into the workspace.
    fn load_contribution(&mut self, node: usize, length: f64, class: usize) {
        let rate = self.model.classes.rates[class];
        let store = self.arena.class_view(class);
        self.config.contribution(
            &self.model.eigen,
            &self.tips,
            node,
            length,
            rate,
            &store,
            &mut self.work,
        );
    }

    /// Move the full conditional from neighbour `from` to neighbour `to`.
    fn step(&mut self, from: usize, to: usize) -> Result<()> {
        let length = self.length_between(from, to)?;
        for class in 0..self.model.n_classes() {
            self.load_contribution(to, length, class);
            self.arena
                .get_mut(from, class)
                .zip_mut_with(&self.work.contribution, |a, &b| *a /= b);
            self.load_contribution(from, length, class);
            self.arena
                .get_mut(to, class)
                .zip_mut_with(&self.work.contribution, |a, &b| *a *= b);
        }
        Ok(())
    }

    /// Move the free root to internal `node` along the tree path.
    pub fn move_root_to(&mut self, node: usize) -> Result<()> {
        self.check_internal(node)?;
        let mut current = self.ensure_evaluated()?;
        if current == node {
            return Ok(());
        }

        let up = self.tree.path_to_root(current);
        let down = self.tree.path_to_root(node);
        let (up_len, down_len) = up
            .iter()
            .enumerate()
            .find_map(|(i, n)| down.iter().position(|d| d == n).map(|j| (i, j)))
            .ok_or(PmlError::UnknownNode {
                node,
                n_nodes: self.tree.n_nodes(),
            })?;

        for &next in up[1..=up_len].iter().chain(down[..down_len].iter().rev()) {
            self.step(current, next)?;
            current = next;
        }
        self.free_root = Some(node);
        Ok(())
    }

    /// Remove edge `(parent, child)` from the full conditional, moving the
    /// free root to `parent` first.
    ///
    /// A zero contribution turns the affected sites into NaN or infinity;
    /// this is not trapped.
    pub fn downdate(&mut self, parent: usize, child: usize) -> Result<()> {
        let index = self.tree.find_edge(parent, child)?;
        self.move_root_to(parent)?;

        let length = self.lengths[index];
        for class in 0..self.model.n_classes() {
            self.load_contribution(child, length, class);
            self.arena
                .get_mut(parent, class)
                .zip_mut_with(&self.work.contribution, |a, &b| *a /= b);
        }
        self.open_edge = Some((parent, child));
        Ok(())
    }

    fn check_open(&self, parent: usize, child: usize) -> Result<()> {
        match self.open_edge {
            Some(edge) if edge == (parent, child) => Ok(()),
            Some((p, c)) => Err(PmlError::EdgeOpen { parent: p, child: c }),
            None => Err(PmlError::NoOpenEdge),
        }
    }

    /// Rotated representation of the open edge `(parent, child)`.
    ///
    /// X_c = (LL[parent] · diag(π) V) ∘ B_c, with B_c = LL[child] · Vinvᵀ
    /// (or the gathered rows of contrast · Vinvᵀ for a leaf), each site
    /// multiplied by the class's relative scale factor.
    pub fn rotate(&mut self, parent: usize, child: usize) -> Result<RotatedEdge> {
        self.check_open(parent, child)?;
        let index = self.tree.find_edge(parent, child)?;

        let n_classes = self.model.n_classes();
        let n_sites = self.tips.n_sites();
        let n_states = self.model.n_states();
        let root = self.tree.root();

        let mut root_exponents = Array2::zeros((n_classes, n_sites));
        for class in 0..n_classes {
            root_exponents.row_mut(class).assign(&self.arena.scaling(root, class));
        }
        let (factors, log_offset) = scaling::normalize_exponents(root_exponents.view());

        let mut x = Array3::zeros((n_classes, n_sites, n_states));
        let mut child_side = Array2::zeros((n_sites, n_states));
        for class in 0..n_classes {
            let side = if self.tree.is_tip(child) {
                ChildSide::Tip(child)
            } else {
                ChildSide::Internal(self.arena.get(child, class))
            };
            self.rotate_class(
                self.arena.get(parent, class),
                side,
                factors.row(class),
                &mut child_side,
                x.index_axis_mut(Axis(0), class),
            );
        }

        Ok(RotatedEdge {
            parent,
            child,
            length: self.lengths[index],
            x,
            log_offset,
        })
    }

    /// Put edge `(parent, child)` back with `length` and close it.
    ///
    /// A leaf child is multiplied into `parent`, which stays the free root.
    /// An internal child receives `parent`'s complement and becomes the free
    /// root.
    pub fn commit(&mut self, parent: usize, child: usize, length: f64) -> Result<()> {
        self.check_open(parent, child)?;
        let index = self.tree.find_edge(parent, child)?;

        if self.tree.is_tip(child) {
            for class in 0..self.model.n_classes() {
                self.load_contribution(child, length, class);
                self.arena
                    .get_mut(parent, class)
                    .zip_mut_with(&self.work.contribution, |a, &b| *a *= b);
            }
        } else {
            for class in 0..self.model.n_classes() {
                self.load_contribution(parent, length, class);
                self.arena
                    .get_mut(child, class)
                    .zip_mut_with(&self.work.contribution, |a, &b| *a *= b);
            }
            self.free_root = Some(child);
        }

        self.lengths[index] = length;
        self.open_edge = None;
        Ok(())
    }

    /// Move to `parent`, remove the edge and rotate it.
    pub fn prepare_edge(&mut self, parent: usize, child: usize) -> Result<RotatedEdge> {
        self.downdate(parent, child)?;
        self.rotate(parent, child)
    }

    /// Optimize the length of one edge and commit the result.
    pub fn optimize_edge(
        &mut self,
        parent: usize,
        child: usize,
        config: &NewtonConfig,
    ) -> Result<EdgeEstimate> {
        let edge = self.prepare_edge(parent, child)?;
        let estimate = EdgeOptimizer::new(
            self.model.eigen.eigenvalues.view(),
            self.model.classes.rates.view(),
            self.model.classes.weights.view(),
            self.tips.pattern_weights(),
            config,
        )
        .optimize(&edge);

        self.commit(parent, child, estimate.length)?;
        if !estimate.log_likelihood.is_finite() {
            warn!(
                "edge ({parent}, {child}): log-likelihood {} after optimization",
                estimate.log_likelihood
            );
        }
        Ok(estimate)
    }

    /// One round of [`optimize_edge`](Self::optimize_edge) over every edge,
    /// last edge first, so the free root travels down the tree.
    ///
    /// Runs a full pass first if the arena is stale. Returns the new branch
    /// lengths and the log-likelihood read off the free root.
    pub fn optimize_edges(&mut self, config: &NewtonConfig) -> Result<(Vec<f64>, f64)> {
        if let Some((parent, child)) = self.open_edge {
            return Err(PmlError::EdgeOpen { parent, child });
        }
        if self.free_root.is_none() {
            self.log_likelihood();
        }

        let edges = self.tree.edges().to_vec();
        for &(parent, child) in edges.iter().rev() {
            self.optimize_edge(parent, child, config)?;
        }

        let lnl = self
            .free_root_site_log_likelihoods()?
            .dot(&self.tips.pattern_weights());
        if !lnl.is_finite() {
            warn!("log-likelihood {lnl} after a round of edge optimization");
        }
        debug!("edge round: lnL = {lnl:.6}");
        Ok((self.lengths.clone(), lnl))
    }
}
