//! Tree topology as a post-order edge list.
//!
//! Leaves are numbered `1..=n_tips`, internal nodes `n_tips + 1..=n_nodes`.
//! Edges sharing a parent are contiguous and every child's own edges come
//! before the edge that attaches it, so a single forward pass sees all
//! children of a node before the node is used as a child. The root is the
//! parent of the last edge.

use crate::error::{PmlError, Result};

/// Rooted tree optimized for post-order traversal
#[derive(Clone, Debug)]
pub struct Tree {
    n_tips: usize,
    n_nodes: usize,
    /// (parent, child) in parent-contiguous post-order
    edges: Vec<(usize, usize)>,
    /// Parent of each node, indexed by node number (0 = none)
    ancestors: Vec<usize>,
    /// Edge index leading to each node, indexed by node number
    edge_of: Vec<Option<usize>>,
    root: usize,
}

impl Tree {
    /// Build from an edge list that is already in parent-contiguous
    /// post-order.
    ///
    /// The ordering is a precondition and is not validated; a malformed list
    /// produces meaningless likelihoods.
    pub fn new(edges: Vec<(usize, usize)>, n_tips: usize) -> Result<Self> {
        let root = match edges.last() {
            Some(&(parent, _)) => parent,
            None => return Err(PmlError::Empty { what: "tree edges" }),
        };
        let n_nodes = edges
            .iter()
            .map(|&(p, c)| p.max(c))
            .max()
            .unwrap_or(0);

        let mut ancestors = vec![0; n_nodes + 1];
        let mut edge_of = vec![None; n_nodes + 1];
        for (i, &(parent, child)) in edges.iter().enumerate() {
            ancestors[child] = parent;
            edge_of[child] = Some(i);
        }

        Ok(Self {
            n_tips,
            n_nodes,
            edges,
            ancestors,
            edge_of,
            root,
        })
    }

    /// Build from `(node, parent)` pairs in any order, deriving the
    /// post-order edge list. Nodes follow the usual numbering convention.
    pub fn from_structure(structure: &[(usize, Option<usize>)], n_tips: usize) -> Result<Self> {
        let n_nodes = structure.iter().map(|&(node, _)| node).max().unwrap_or(0);

        let mut children: Vec<Vec<usize>> = vec![Vec::new(); n_nodes + 1];
        let mut root = None;
        for &(node, parent) in structure {
            match parent {
                Some(p) if p > n_nodes || p == 0 => {
                    return Err(PmlError::UnknownNode { node: p, n_nodes });
                }
                Some(p) => children[p].push(node),
                None => root = Some(node),
            }
        }
        let root = root.ok_or(PmlError::MissingRoot)?;

        fn visit(node: usize, children: &[Vec<usize>], edges: &mut Vec<(usize, usize)>) {
            for &child in &children[node] {
                visit(child, children, edges);
            }
            for &child in &children[node] {
                edges.push((node, child));
            }
        }
        let mut edges = Vec::with_capacity(n_nodes.saturating_sub(1));
        visit(root, &children, &mut edges);

        Self::new(edges, n_tips)
    }

    pub fn n_tips(&self) -> usize {
        self.n_tips
    }

    pub fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    pub fn n_internal(&self) -> usize {
        self.n_nodes - self.n_tips
    }

    pub fn edges(&self) -> &[(usize, usize)] {
        &self.edges
    }

    pub fn root(&self) -> usize {
        self.root
    }

    #[inline]
    pub fn is_tip(&self, node: usize) -> bool {
        node <= self.n_tips
    }

    pub fn contains(&self, node: usize) -> bool {
        node >= 1 && node <= self.n_nodes
    }

    pub fn parent_of(&self, node: usize) -> Option<usize> {
        match self.ancestors.get(node) {
            Some(&p) if p > 0 => Some(p),
            _ => None,
        }
    }

    /// Index of the edge whose child is `node`.
    pub fn edge_index(&self, node: usize) -> Option<usize> {
        self.edge_of.get(node).copied().flatten()
    }

    /// Index of edge `(parent, child)`, if it exists.
    pub fn find_edge(&self, parent: usize, child: usize) -> Result<usize> {
        self.edge_index(child)
            .filter(|&i| self.edges[i].0 == parent)
            .ok_or(PmlError::UnknownEdge { parent, child })
    }

    /// `node` followed by each of its ancestors up to the root.
    pub fn path_to_root(&self, node: usize) -> Vec<usize> {
        let mut path = vec![node];
        let mut current = node;
        while let Some(p) = self.parent_of(current) {
            path.push(p);
            current = p;
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_postorder() {
        // ((1,2),3)
        //     5 (root)
        //    / \
        //   4   3
        //  / \
        // 1   2
        let structure = vec![(1, Some(4)), (2, Some(4)), (3, Some(5)), (4, Some(5)), (5, None)];

        let tree = Tree::from_structure(&structure, 3).unwrap();

        assert_eq!(tree.edges(), &[(4, 1), (4, 2), (5, 3), (5, 4)]);
        assert_eq!(tree.root(), 5);
        assert_eq!(tree.n_internal(), 2);
        assert_eq!(tree.parent_of(4), Some(5));
        assert_eq!(tree.parent_of(5), None);
    }

    #[test]
    fn finds_edges_and_paths() {
        let tree = Tree::new(vec![(5, 1), (5, 2), (6, 5), (6, 3), (6, 4)], 4).unwrap();
        assert_eq!(tree.find_edge(6, 5), Ok(2));
        assert_eq!(
            tree.find_edge(5, 3),
            Err(PmlError::UnknownEdge { parent: 5, child: 3 })
        );
        assert_eq!(tree.path_to_root(2), vec![2, 5, 6]);
        assert_eq!(tree.edge_index(6), None);
        assert!(tree.is_tip(4) && !tree.is_tip(5));
    }

    #[test]
    fn structure_without_root_is_rejected() {
        let err = Tree::from_structure(&[(1, Some(2)), (2, Some(1))], 1).unwrap_err();
        assert_eq!(err, PmlError::MissingRoot);
    }

    #[test]
    fn empty_edge_list_is_rejected() {
        let err = Tree::new(Vec::new(), 3).unwrap_err();
        assert_eq!(err, PmlError::Empty { what: "tree edges" });
        let err = Tree::from_structure(&[(1, None)], 1).unwrap_err();
        assert_eq!(err, PmlError::Empty { what: "tree edges" });
    }
}
