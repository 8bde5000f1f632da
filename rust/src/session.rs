//! The analysis context.
//!
//! A [`Session`] owns everything one likelihood analysis touches: the
//! model, the tip data, the tree with its branch lengths, the arena of
//! conditional likelihoods and the scratch buffers. Allocation happens once,
//! in [`Session::new`]; every later pass and update works in place.

use log::debug;
use ndarray::linalg::general_mat_mul;
use ndarray::prelude::*;

use crate::arena::{NodeStore, PartialLikelihoods};
use crate::error::{PmlError, Result};
use crate::model::Model;
use crate::pruning::{PruningConfig, Workspace};
use crate::quartet::QuartetSlots;
use crate::scaling;
use crate::tips::TipData;
use crate::tree::Tree;

#[derive(Debug)]
pub struct Session {
    pub(crate) model: Model,
    pub(crate) tips: TipData,
    pub(crate) tree: Tree,
    /// One length per edge, in edge-list order
    pub(crate) lengths: Vec<f64>,
    pub(crate) arena: PartialLikelihoods,
    pub(crate) quartet: QuartetSlots,
    pub(crate) work: Workspace,
    /// contrast · Vinvᵀ, the child side of a rotated leaf edge
    pub(crate) rotated_contrast: Array2<f64>,
    pub(crate) config: PruningConfig,
    /// Node holding the full conditional; `None` until a full pass
    pub(crate) free_root: Option<usize>,
    /// Edge removed by `downdate` and not yet committed
    pub(crate) open_edge: Option<(usize, usize)>,
}

impl Session {
    pub fn new(
        model: Model,
        tips: TipData,
        tree: Tree,
        branch_lengths: Vec<f64>,
        config: PruningConfig,
    ) -> Result<Self> {
        let n_states = model.n_states();
        if tips.n_states() != n_states {
            return Err(PmlError::ShapeMismatch {
                what: "contrast matrix columns",
                expected: n_states,
                found: tips.n_states(),
            });
        }
        if tips.n_tips() != tree.n_tips() {
            return Err(PmlError::ShapeMismatch {
                what: "tips with data",
                expected: tree.n_tips(),
                found: tips.n_tips(),
            });
        }
        if branch_lengths.len() != tree.edges().len() {
            return Err(PmlError::ShapeMismatch {
                what: "branch lengths",
                expected: tree.edges().len(),
                found: branch_lengths.len(),
            });
        }
        if tree.is_tip(tree.root()) {
            return Err(PmlError::NotInternal { node: tree.root() });
        }

        let n_sites = tips.n_sites();
        let n_codes = tips.contrast().nrows();
        let n_classes = model.n_classes();

        let arena = PartialLikelihoods::new(
            n_sites,
            n_states,
            n_classes,
            tree.n_tips(),
            tree.n_internal(),
        );
        let quartet = QuartetSlots::new(n_classes, n_sites, n_states);
        let mut rotated_contrast = Array2::zeros((n_codes, n_states));
        general_mat_mul(
            1.0,
            &tips.contrast(),
            &model.eigen.eigenvectors_inv.t(),
            0.0,
            &mut rotated_contrast,
        );

        debug!(
            "session: {} tips, {} internal nodes, {} sites, {} states, {} classes",
            tree.n_tips(),
            tree.n_internal(),
            n_sites,
            n_states,
            n_classes
        );

        Ok(Self {
            work: Workspace::new(n_sites, n_states, n_codes),
            config: config.resolve(n_codes, n_sites),
            model,
            tips,
            tree,
            lengths: branch_lengths,
            arena,
            quartet,
            rotated_contrast,
            free_root: None,
            open_edge: None,
        })
    }

    /// Release the session and its arena.
    pub fn destroy(self) {
        self.arena.destroy();
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn tips(&self) -> &TipData {
        &self.tips
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn config(&self) -> PruningConfig {
        self.config
    }

    pub fn free_root(&self) -> Option<usize> {
        self.free_root
    }

    pub fn branch_lengths(&self) -> &[f64] {
        &self.lengths
    }

    /// Change the length of edge `(parent, child)`.
    ///
    /// Stored conditionals become stale, so the next incremental operation
    /// needs a new full pass.
    pub fn set_branch_length(&mut self, parent: usize, child: usize, length: f64) -> Result<()> {
        if let Some((p, c)) = self.open_edge {
            return Err(PmlError::EdgeOpen { parent: p, child: c });
        }
        let index = self.tree.find_edge(parent, child)?;
        self.lengths[index] = length;
        self.free_root = None;
        Ok(())
    }

    /// Stored conditional likelihoods of internal `node` in rate class
    /// `class`.
    ///
    /// These are subtree conditionals only while the free root sits at the
    /// tree root. Once it has moved, nodes on the path to it hold
    /// complements and the free root holds the full conditional.
    pub fn partial(&self, node: usize, class: usize) -> Result<ArrayView2<'_, f64>> {
        self.check_internal(node)?;
        Ok(self.arena.get(node, class))
    }

    /// Scaling exponents of internal `node` in rate class `class`, as of
    /// the last full pass. Incremental updates never change them.
    pub fn scaling(&self, node: usize, class: usize) -> Result<ArrayView1<'_, u32>> {
        self.check_internal(node)?;
        Ok(self.arena.scaling(node, class))
    }

    pub(crate) fn check_internal(&self, node: usize) -> Result<()> {
        if !self.tree.contains(node) {
            return Err(PmlError::UnknownNode {
                node,
                n_nodes: self.tree.n_nodes(),
            });
        }
        if self.tree.is_tip(node) {
            return Err(PmlError::NotInternal { node });
        }
        Ok(())
    }

    /// Fails unless every internal node holds its subtree conditional,
    /// i.e. after a full pass with the free root back at the tree root.
    pub(crate) fn check_subtrees(&self) -> Result<()> {
        if let Some((parent, child)) = self.open_edge {
            return Err(PmlError::EdgeOpen { parent, child });
        }
        match self.free_root {
            None => Err(PmlError::NotEvaluated),
            Some(node) if node != self.tree.root() => Err(PmlError::FreeRootMoved { node }),
            Some(_) => Ok(()),
        }
    }

    /// Full pruning pass over every rate class.
    ///
    /// Returns the scaled site likelihoods `root · π` and the root's total
    /// exponents, both classes × sites. Leaves the free root at the tree
    /// root and closes any open edge.
    fn full_pass(&mut self) -> (Array2<f64>, Array2<u32>) {
        let n_classes = self.model.n_classes();
        let n_sites = self.tips.n_sites();
        let mut site_likelihoods = Array2::zeros((n_classes, n_sites));
        let mut exponents = Array2::zeros((n_classes, n_sites));

        for class in 0..n_classes {
            let rate = self.model.classes.rates[class];
            let edges = self
                .tree
                .edges()
                .iter()
                .zip(&self.lengths)
                .map(|(&(parent, child), &length)| (parent, child, length));
            let mut slots = self.arena.class_slots(class);
            let root = self.config.prune(
                &self.model.eigen,
                &self.tips,
                edges,
                rate,
                &mut slots,
                &mut self.work,
            );

            if let Some(root) = root {
                site_likelihoods
                    .row_mut(class)
                    .assign(&slots.partial(root).dot(&self.model.frequencies));
                exponents.row_mut(class).assign(&slots.exponents(root));
            }
        }

        self.free_root = Some(self.tree.root());
        self.open_edge = None;
        (site_likelihoods, exponents)
    }

    /// Per-site log-likelihood of the rate mixture after a full pass.
    pub fn site_log_likelihoods(&mut self) -> Array1<f64> {
        let (site_likelihoods, exponents) = self.full_pass();
        scaling::mix_classes(
            site_likelihoods.view(),
            exponents.view(),
            self.model.classes.weights.view(),
        )
    }

    /// Per-site, per-class log-likelihoods (sites × classes), unweighted by
    /// the mixture.
    pub fn site_log_likelihoods_by_class(&mut self) -> Array2<f64> {
        let (site_likelihoods, exponents) = self.full_pass();
        scaling::class_log_likelihoods(site_likelihoods.view(), exponents.view())
    }

    /// Total log-likelihood, weighted by site-pattern multiplicity.
    pub fn log_likelihood(&mut self) -> f64 {
        let site_lnl = self.site_log_likelihoods();
        let lnl = site_lnl.dot(&self.tips.pattern_weights());
        debug!("full pass: lnL = {lnl:.6}");
        lnl
    }

    /// Site log-likelihoods read off the free root's full conditional.
    ///
    /// Valid at any point between full passes while no edge is open; a
    /// non-finite entry signals numerical trouble in an earlier update.
    pub fn free_root_site_log_likelihoods(&self) -> Result<Array1<f64>> {
        if let Some((parent, child)) = self.open_edge {
            return Err(PmlError::EdgeOpen { parent, child });
        }
        let free_root = self.free_root.ok_or(PmlError::NotEvaluated)?;
        let root = self.tree.root();

        let n_classes = self.model.n_classes();
        let mut site_likelihoods = Array2::zeros((n_classes, self.tips.n_sites()));
        let mut exponents = Array2::zeros((n_classes, self.tips.n_sites()));
        for class in 0..n_classes {
            site_likelihoods
                .row_mut(class)
                .assign(&self.arena.get(free_root, class).dot(&self.model.frequencies));
            // A full conditional carries the same scale wherever it sits.
            exponents.row_mut(class).assign(&self.arena.scaling(root, class));
        }
        Ok(scaling::mix_classes(
            site_likelihoods.view(),
            exponents.view(),
            self.model.classes.weights.view(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::tests::two_state;
    use crate::model::RateClasses;
    use approx::assert_abs_diff_eq;

    fn cherry_session() -> Session {
        let model = Model::new(two_state(), arr1(&[0.5, 0.5]), RateClasses::single()).unwrap();
        let codes = arr2(&[[0, 1], [0, 0]]);
        let tips = TipData::unweighted(TipData::identity_contrast(2), codes).unwrap();
        let tree = Tree::new(vec![(3, 1), (3, 2)], 2).unwrap();
        Session::new(model, tips, tree, vec![0.1, 0.2], PruningConfig::default()).unwrap()
    }

    #[test]
    fn two_leaf_likelihood_is_closed_form() {
        let mut session = cherry_session();
        let site_lnl = session.site_log_likelihoods();

        // P(x, y | t) = π_x P_xy(t) with t the path length
        let e = (-2.0 * 0.3_f64).exp();
        assert_abs_diff_eq!(site_lnl[0], (0.5 * (0.5 + 0.5 * e)).ln(), epsilon = 1e-14);
        assert_abs_diff_eq!(site_lnl[1], (0.5 * (0.5 - 0.5 * e)).ln(), epsilon = 1e-14);
        assert_eq!(session.free_root(), Some(3));
    }

    #[test]
    fn free_root_reading_matches_full_pass() {
        let mut session = cherry_session();
        assert_eq!(session.free_root_site_log_likelihoods(), Err(PmlError::NotEvaluated));
        let full = session.site_log_likelihoods();
        let read = session.free_root_site_log_likelihoods().unwrap();
        assert_eq!(full, read);
    }

    #[test]
    fn construction_checks_shapes() {
        let model = Model::new(two_state(), arr1(&[0.5, 0.5]), RateClasses::single()).unwrap();
        let tips = TipData::unweighted(TipData::identity_contrast(2), arr2(&[[0], [1]])).unwrap();
        let tree = Tree::new(vec![(3, 1), (3, 2)], 2).unwrap();
        let err = Session::new(model, tips, tree, vec![0.1], PruningConfig::default()).unwrap_err();
        assert_eq!(
            err,
            PmlError::ShapeMismatch {
                what: "branch lengths",
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn accessors_reject_leaves_and_strangers() {
        let mut session = cherry_session();
        session.log_likelihood();
        assert!(session.partial(3, 0).is_ok());
        assert_eq!(session.partial(1, 0).unwrap_err(), PmlError::NotInternal { node: 1 });
        assert_eq!(
            session.scaling(9, 0).unwrap_err(),
            PmlError::UnknownNode { node: 9, n_nodes: 3 }
        );
    }

    #[test]
    fn setting_a_length_requires_a_new_pass() {
        let mut session = cherry_session();
        let before = session.log_likelihood();
        session.set_branch_length(3, 2, 0.5).unwrap();
        assert_eq!(session.free_root(), None);
        assert_eq!(session.branch_lengths(), &[0.1, 0.5]);
        assert!(session.log_likelihood() != before);
        assert!(session.set_branch_length(1, 2, 0.5).is_err());
    }
}
