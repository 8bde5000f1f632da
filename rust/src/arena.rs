//! Session-scoped storage of conditional likelihoods and scaling exponents.
//!
//! One flat allocation holds a sites × states matrix for every
//! (rate class, internal node) pair; a parallel allocation holds one `u32`
//! exponent per (rate class, internal node, site). Leaves have no slot:
//! their contributions are rebuilt from the contrast matrix on demand.
//!
//! Addressing is `[class, node - n_tips - 1, site, state]` in row-major
//! order, so every matrix is a contiguous block usable by GEMM directly.

use ndarray::prelude::*;

/// Per-node read access used by the pruning traversal.
///
/// Node numbers follow the tree convention; only internal nodes are valid.
/// Out-of-range nodes panic through ndarray's bounds checks.
pub trait NodeStore {
    fn partial(&self, node: usize) -> ArrayView2<'_, f64>;
    fn exponents(&self, node: usize) -> ArrayView1<'_, u32>;
}

/// Stores the traversal can write parents into.
pub trait NodeStoreMut: NodeStore {
    fn node_mut(&mut self, node: usize) -> (ArrayViewMut2<'_, f64>, ArrayViewMut1<'_, u32>);
}

/// Arena of partial likelihoods
#[derive(Clone, Debug)]
pub struct PartialLikelihoods {
    /// [class, slot, site, state]
    partials: Array4<f64>,
    /// [class, slot, site]
    exponents: Array3<u32>,
    n_tips: usize,
}

impl PartialLikelihoods {
    /// Allocate a zeroed arena.
    pub fn new(
        n_sites: usize,
        n_states: usize,
        n_classes: usize,
        n_tips: usize,
        n_internal: usize,
    ) -> Self {
        Self {
            partials: Array4::zeros((n_classes, n_internal, n_sites, n_states)),
            exponents: Array3::zeros((n_classes, n_internal, n_sites)),
            n_tips,
        }
    }

    /// Release the arena. Equivalent to dropping it.
    pub fn destroy(self) {}

    pub fn n_classes(&self) -> usize {
        self.partials.len_of(Axis(0))
    }

    pub fn n_internal(&self) -> usize {
        self.partials.len_of(Axis(1))
    }

    pub fn n_sites(&self) -> usize {
        self.partials.len_of(Axis(2))
    }

    pub fn n_states(&self) -> usize {
        self.partials.len_of(Axis(3))
    }

    #[inline]
    fn slot(&self, node: usize) -> usize {
        node - self.n_tips - 1
    }

    /// Whether `node` has a slot in this arena.
    pub fn holds(&self, node: usize) -> bool {
        node > self.n_tips && node - self.n_tips <= self.n_internal()
    }

    pub fn get(&self, node: usize, class: usize) -> ArrayView2<'_, f64> {
        let slot = self.slot(node);
        self.partials.slice(s![class, slot, .., ..])
    }

    pub fn get_mut(&mut self, node: usize, class: usize) -> ArrayViewMut2<'_, f64> {
        let slot = self.slot(node);
        self.partials.slice_mut(s![class, slot, .., ..])
    }

    pub fn scaling(&self, node: usize, class: usize) -> ArrayView1<'_, u32> {
        let slot = self.slot(node);
        self.exponents.slice(s![class, slot, ..])
    }

    pub fn scaling_mut(&mut self, node: usize, class: usize) -> ArrayViewMut1<'_, u32> {
        let slot = self.slot(node);
        self.exponents.slice_mut(s![class, slot, ..])
    }

    /// All internal nodes of one rate class, for a pruning pass.
    pub fn class_slots(&mut self, class: usize) -> ClassSlots<'_> {
        ClassSlots {
            partials: self.partials.index_axis_mut(Axis(0), class),
            exponents: self.exponents.index_axis_mut(Axis(0), class),
            n_tips: self.n_tips,
        }
    }

    /// Read-only view of one rate class.
    pub fn class_view(&self, class: usize) -> ClassView<'_> {
        ClassView {
            partials: self.partials.index_axis(Axis(0), class),
            exponents: self.exponents.index_axis(Axis(0), class),
            n_tips: self.n_tips,
        }
    }
}

/// One rate class of the arena, read-only.
#[derive(Clone, Copy)]
pub struct ClassView<'a> {
    partials: ArrayView3<'a, f64>,
    exponents: ArrayView2<'a, u32>,
    n_tips: usize,
}

impl NodeStore for ClassView<'_> {
    fn partial(&self, node: usize) -> ArrayView2<'_, f64> {
        self.partials.index_axis(Axis(0), node - self.n_tips - 1)
    }

    fn exponents(&self, node: usize) -> ArrayView1<'_, u32> {
        self.exponents.index_axis(Axis(0), node - self.n_tips - 1)
    }
}

/// One rate class of the arena.
pub struct ClassSlots<'a> {
    partials: ArrayViewMut3<'a, f64>,
    exponents: ArrayViewMut2<'a, u32>,
    n_tips: usize,
}

impl NodeStore for ClassSlots<'_> {
    fn partial(&self, node: usize) -> ArrayView2<'_, f64> {
        self.partials.index_axis(Axis(0), node - self.n_tips - 1)
    }

    fn exponents(&self, node: usize) -> ArrayView1<'_, u32> {
        self.exponents.index_axis(Axis(0), node - self.n_tips - 1)
    }
}

impl NodeStoreMut for ClassSlots<'_> {
    fn node_mut(&mut self, node: usize) -> (ArrayViewMut2<'_, f64>, ArrayViewMut1<'_, u32>) {
        let slot = node - self.n_tips - 1;
        (
            self.partials.index_axis_mut(Axis(0), slot),
            self.exponents.index_axis_mut(Axis(0), slot),
        )
    }
}

/// Two scratch slots layered over a read-only class of the arena.
///
/// Nodes `first_local` and `first_local + 1` live in the scratch slots; any
/// other internal node is read from the arena. Used by the quartet pass,
/// whose two junction nodes are not part of the session tree.
pub struct OverlaySlots<'a> {
    base: ClassView<'a>,
    local: ArrayViewMut3<'a, f64>,
    local_exponents: ArrayViewMut2<'a, u32>,
    first_local: usize,
}

impl<'a> OverlaySlots<'a> {
    pub fn new(
        base: ClassView<'a>,
        local: ArrayViewMut3<'a, f64>,
        local_exponents: ArrayViewMut2<'a, u32>,
        first_local: usize,
    ) -> Self {
        Self {
            base,
            local,
            local_exponents,
            first_local,
        }
    }
}

impl NodeStore for OverlaySlots<'_> {
    fn partial(&self, node: usize) -> ArrayView2<'_, f64> {
        if node >= self.first_local {
            self.local.index_axis(Axis(0), node - self.first_local)
        } else {
            self.base.partial(node)
        }
    }

    fn exponents(&self, node: usize) -> ArrayView1<'_, u32> {
        if node >= self.first_local {
            self.local_exponents.index_axis(Axis(0), node - self.first_local)
        } else {
            self.base.exponents(node)
        }
    }
}

impl NodeStoreMut for OverlaySlots<'_> {
    fn node_mut(&mut self, node: usize) -> (ArrayViewMut2<'_, f64>, ArrayViewMut1<'_, u32>) {
        let slot = node - self.first_local;
        (
            self.local.index_axis_mut(Axis(0), slot),
            self.local_exponents.index_axis_mut(Axis(0), slot),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_independent_blocks() {
        let mut arena = PartialLikelihoods::new(3, 2, 2, 4, 3);
        arena.get_mut(5, 1).fill(2.0);
        arena.scaling_mut(7, 0).fill(3);

        assert_eq!(arena.get(5, 0).sum(), 0.0);
        assert_eq!(arena.get(5, 1).sum(), 12.0);
        assert_eq!(arena.get(6, 1).sum(), 0.0);
        assert_eq!(arena.scaling(7, 0).to_vec(), vec![3, 3, 3]);
        assert_eq!(arena.scaling(7, 1).to_vec(), vec![0, 0, 0]);
        assert!(arena.get(6, 1).is_standard_layout());
    }

    #[test]
    fn holds_only_internal_nodes() {
        let arena = PartialLikelihoods::new(1, 2, 1, 4, 3);
        assert!(!arena.holds(4));
        assert!(arena.holds(5));
        assert!(arena.holds(7));
        assert!(!arena.holds(8));
    }

    #[test]
    fn class_slots_write_through() {
        let mut arena = PartialLikelihoods::new(2, 2, 2, 2, 1);
        {
            let mut slots = arena.class_slots(1);
            let (mut m, mut e) = slots.node_mut(3);
            m.fill(0.5);
            e.fill(1);
            assert_eq!(slots.partial(3).sum(), 2.0);
        }
        assert_eq!(arena.get(3, 1).sum(), 2.0);
        assert_eq!(arena.scaling(3, 1).sum(), 2);
        assert_eq!(arena.get(3, 0).sum(), 0.0);
    }

    #[test]
    fn overlay_reads_base_and_writes_local() {
        let mut arena = PartialLikelihoods::new(1, 2, 1, 2, 1);
        arena.get_mut(3, 0).fill(7.0);
        let mut local = Array3::<f64>::zeros((2, 1, 2));
        let mut local_exps = Array2::<u32>::zeros((2, 1));

        let mut overlay =
            OverlaySlots::new(arena.class_view(0), local.view_mut(), local_exps.view_mut(), 10);
        assert_eq!(overlay.partial(3).sum(), 14.0);
        overlay.node_mut(11).0.fill(1.0);
        assert_eq!(overlay.partial(11).sum(), 2.0);
        assert_eq!(overlay.partial(10).sum(), 0.0);
        drop(overlay);
        assert_eq!(local.sum(), 2.0);
    }
}
