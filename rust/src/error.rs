//! Error type for structural input problems and updater protocol misuse.
//!
//! Numerical degeneracy (zero divisors, underflow past rescaling, non-finite
//! Newton steps) is never reported here: it propagates as NaN/infinity.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PmlError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PmlError {
    /// Two inputs disagree on a dimension.
    #[error("{what}: expected {expected}, found {found}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{what} must not be empty")]
    Empty { what: &'static str },

    /// A tip code does not index a row of the contrast matrix.
    #[error("tip {tip}, site {site}: code {code} outside contrast matrix with {n_codes} rows")]
    InvalidTipCode {
        tip: usize,
        site: usize,
        code: usize,
        n_codes: usize,
    },

    #[error("no root node found")]
    MissingRoot,

    #[error("node {node} is not part of a tree with {n_nodes} nodes")]
    UnknownNode { node: usize, n_nodes: usize },

    /// Leaves have no stored conditional and cannot hold the free root.
    #[error("node {node} is a leaf")]
    NotInternal { node: usize },

    #[error("({parent}, {child}) is not an edge of the tree")]
    UnknownEdge { parent: usize, child: usize },

    /// Incremental operations need a filled arena.
    #[error("partial likelihoods have not been computed; run a full pass first")]
    NotEvaluated,

    /// Stored conditionals are complements while the free root is away
    /// from the tree root.
    #[error("free root is at node {node}; move it back to the tree root first")]
    FreeRootMoved { node: usize },

    #[error("edge ({parent}, {child}) is still open; commit it first")]
    EdgeOpen { parent: usize, child: usize },

    #[error("no edge is open for commit")]
    NoOpenEdge,

    #[error("eigendecomposition failed: {0}")]
    Decomposition(String),
}
