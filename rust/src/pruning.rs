//! Felsenstein pruning over a post-order edge list.
//!
//! One traversal serves every pass in the crate: the full pass over the
//! session tree, the quartet fast path, and (through [`PruningEngine::contribution`])
//! the single-edge updates. What varies is plugged in as type parameters:
//!
//! - [`TipCombine`]: how a leaf's contribution is built from its codes
//! - [`Rescaler`]: what happens to a parent once all its children are in
//!
//! Contribution of a child with conditional `M` (sites × states) across an
//! edge with transition matrix `P`:
//! C[site, i] = Σ_j P[i, j] · M[site, j]   i.e.   C = M · Pᵀ
//! One GEMM covers all sites at once.

use std::marker::PhantomData;

use ndarray::linalg::{general_mat_mul, general_mat_vec_mul};
use ndarray::prelude::*;

use crate::arena::{NodeStore, NodeStoreMut};
use crate::matrix::EigenDecomposition;
use crate::scaling;
use crate::tips::TipData;

/// Builds a leaf's contribution `contrast[code] · Pᵀ` for every site.
pub trait TipCombine {
    /// `table` is a codes × states scratch buffer, `out` is sites × states.
    fn combine(
        tips: &TipData,
        tip: usize,
        p: &Array2<f64>,
        table: &mut Array2<f64>,
        out: &mut Array2<f64>,
    );
}

/// Multiply the whole contrast matrix once, then gather rows by code.
///
/// Cheapest whenever there are fewer contrast codes than site patterns.
pub struct ContrastLookup;

impl TipCombine for ContrastLookup {
    #[inline]
    fn combine(
        tips: &TipData,
        tip: usize,
        p: &Array2<f64>,
        table: &mut Array2<f64>,
        out: &mut Array2<f64>,
    ) {
        general_mat_mul(1.0, &tips.contrast(), &p.t(), 0.0, table);
        for (mut row, &code) in out.rows_mut().into_iter().zip(tips.codes(tip).iter()) {
            row.assign(&table.row(code));
        }
    }
}

/// One mat-vec per site; for alignments with very few patterns.
pub struct PerSiteTips;

impl TipCombine for PerSiteTips {
    #[inline]
    fn combine(
        tips: &TipData,
        tip: usize,
        p: &Array2<f64>,
        _table: &mut Array2<f64>,
        out: &mut Array2<f64>,
    ) {
        let contrast = tips.contrast();
        for (mut row, &code) in out.rows_mut().into_iter().zip(tips.codes(tip).iter()) {
            general_mat_vec_mul(1.0, p, &contrast.row(code), 0.0, &mut row);
        }
    }
}

/// Applied to each parent after its last child has been combined.
pub trait Rescaler {
    fn finalize(matrix: ArrayViewMut2<f64>, exponents: ArrayViewMut1<u32>);
}

/// Threshold rescaling, see [`scaling::rescale`].
pub struct Rescale;

impl Rescaler for Rescale {
    #[inline]
    fn finalize(matrix: ArrayViewMut2<f64>, exponents: ArrayViewMut1<u32>) {
        scaling::rescale(matrix, exponents);
    }
}

/// Leaves conditionals untouched; exponents stay at the children's sum.
pub struct NoRescale;

impl Rescaler for NoRescale {
    #[inline]
    fn finalize(_matrix: ArrayViewMut2<f64>, _exponents: ArrayViewMut1<u32>) {}
}

/// Runtime choice of [`TipCombine`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TipStrategy {
    /// `ContrastLookup` unless there are more codes than site patterns.
    #[default]
    Auto,
    ContrastLookup,
    PerSiteTips,
}

/// Runtime choice of [`Rescaler`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ScalingMode {
    #[default]
    Threshold,
    Disabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PruningConfig {
    pub tips: TipStrategy,
    pub scaling: ScalingMode,
}

impl PruningConfig {
    /// Replace `Auto` by a concrete strategy for the given data shape.
    pub fn resolve(self, n_codes: usize, n_sites: usize) -> Self {
        let tips = match self.tips {
            TipStrategy::Auto if n_codes > n_sites => TipStrategy::PerSiteTips,
            TipStrategy::Auto => TipStrategy::ContrastLookup,
            other => other,
        };
        Self { tips, ..self }
    }

    /// Run [`PruningEngine::prune`] with the strategies named by this config.
    pub fn prune<S, I>(
        &self,
        eigen: &EigenDecomposition,
        tips: &TipData,
        edges: I,
        rate: f64,
        store: &mut S,
        work: &mut Workspace,
    ) -> Option<usize>
    where
        S: NodeStoreMut,
        I: IntoIterator<Item = (usize, usize, f64)>,
    {
        use ScalingMode::*;
        use TipStrategy as T;

        match (self.tips, self.scaling) {
            (T::PerSiteTips, Threshold) => PruningEngine::<PerSiteTips, Rescale>::new(eigen, tips)
                .prune(edges, rate, store, work),
            (T::PerSiteTips, Disabled) => PruningEngine::<PerSiteTips, NoRescale>::new(eigen, tips)
                .prune(edges, rate, store, work),
            (_, Threshold) => PruningEngine::<ContrastLookup, Rescale>::new(eigen, tips)
                .prune(edges, rate, store, work),
            (_, Disabled) => PruningEngine::<ContrastLookup, NoRescale>::new(eigen, tips)
                .prune(edges, rate, store, work),
        }
    }

    /// Contribution of `child` across an edge of `length`, written to
    /// `work.contribution`. See [`PruningEngine::contribution`].
    pub fn contribution<S: NodeStore>(
        &self,
        eigen: &EigenDecomposition,
        tips: &TipData,
        child: usize,
        length: f64,
        rate: f64,
        store: &S,
        work: &mut Workspace,
    ) {
        match self.tips {
            TipStrategy::PerSiteTips => PruningEngine::<PerSiteTips, NoRescale>::new(eigen, tips)
                .contribution(child, length, rate, store, work),
            _ => PruningEngine::<ContrastLookup, NoRescale>::new(eigen, tips)
                .contribution(child, length, rate, store, work),
        }
    }
}

/// Scratch buffers reused across edges and passes.
#[derive(Clone, Debug)]
pub struct Workspace {
    /// V diag(exp(λ r t)), n × n
    scaled: Array2<f64>,
    /// P(t, r), n × n
    transition: Array2<f64>,
    /// Child contribution, sites × states
    pub(crate) contribution: Array2<f64>,
    /// contrast · Pᵀ, codes × states
    tip_table: Array2<f64>,
    /// Exponents of the internal child just combined
    child_exponents: Array1<u32>,
}

impl Workspace {
    pub fn new(n_sites: usize, n_states: usize, n_codes: usize) -> Self {
        Self {
            scaled: Array2::zeros((n_states, n_states)),
            transition: Array2::zeros((n_states, n_states)),
            contribution: Array2::zeros((n_sites, n_states)),
            tip_table: Array2::zeros((n_codes, n_states)),
            child_exponents: Array1::zeros(n_sites),
        }
    }

    pub(crate) fn load_transition(&mut self, eigen: &EigenDecomposition, length: f64, rate: f64) {
        eigen.transition_matrix_into(length, rate, &mut self.scaled, &mut self.transition);
    }
}

/// Post-order traversal parameterized by tip and rescaling strategies.
pub struct PruningEngine<'a, T, R> {
    eigen: &'a EigenDecomposition,
    tips: &'a TipData,
    _strategy: PhantomData<(T, R)>,
}

impl<'a, T: TipCombine, R: Rescaler> PruningEngine<'a, T, R> {
    pub fn new(eigen: &'a EigenDecomposition, tips: &'a TipData) -> Self {
        Self {
            eigen,
            tips,
            _strategy: PhantomData,
        }
    }

    #[inline]
    fn is_tip(&self, node: usize) -> bool {
        node <= self.tips.n_tips()
    }

    /// Write the contribution of `child` across an edge of `length` into
    /// `work.contribution`, leaving `P` in `work.transition`.
    ///
    /// An internal child's exponents are copied to the workspace so the
    /// caller can add them to the parent.
    pub fn contribution<S: NodeStore>(
        &self,
        child: usize,
        length: f64,
        rate: f64,
        store: &S,
        work: &mut Workspace,
    ) {
        work.load_transition(self.eigen, length, rate);
        if self.is_tip(child) {
            T::combine(
                self.tips,
                child,
                &work.transition,
                &mut work.tip_table,
                &mut work.contribution,
            );
        } else {
            general_mat_mul(
                1.0,
                &store.partial(child),
                &work.transition.t(),
                0.0,
                &mut work.contribution,
            );
            work.child_exponents.assign(&store.exponents(child));
        }
    }

    /// Fill `store` for every parent in `edges` (`(parent, child, length)`
    /// triples in parent-contiguous post-order) under rate multiplier `rate`.
    ///
    /// The first child of a parent is written, later children are
    /// multiplied in. A parent's exponents are the sum over its internal
    /// children plus its own rescaling count, so the last parent (returned)
    /// ends up holding the total exponent of every site.
    pub fn prune<S, I>(
        &self,
        edges: I,
        rate: f64,
        store: &mut S,
        work: &mut Workspace,
    ) -> Option<usize>
    where
        S: NodeStoreMut,
        I: IntoIterator<Item = (usize, usize, f64)>,
    {
        let mut current: Option<usize> = None;

        for (parent, child, length) in edges {
            self.contribution(child, length, rate, store, work);

            let first = current != Some(parent);
            if first {
                if let Some(previous) = current {
                    let (matrix, exponents) = store.node_mut(previous);
                    R::finalize(matrix, exponents);
                }
                current = Some(parent);
            }

            let (mut matrix, mut exponents) = store.node_mut(parent);
            if first {
                matrix.assign(&work.contribution);
                exponents.fill(0);
            } else {
                matrix *= &work.contribution;
            }
            if !self.is_tip(child) {
                exponents += &work.child_exponents;
            }
        }

        if let Some(root) = current {
            let (matrix, exponents) = store.node_mut(root);
            R::finalize(matrix, exponents);
        }
        current
    }
}
