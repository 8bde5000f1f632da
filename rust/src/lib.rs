//! pmlcore
//!
//! Phylogenetic likelihood core: Felsenstein pruning with underflow
//! rescaling over a discrete rate mixture, plus incremental branch-length
//! optimization that touches only the path between consecutive edges.
//!
//! ```text
//! Session::new ─▶ log_likelihood (full pass fills the arena)
//!                   │
//!                   ▼
//!   for each edge: move_root_to ─▶ downdate ─▶ rotate ─▶ Newton ─▶ commit
//! ```
//!
//! Transition matrices come from a caller-supplied eigendecomposition of the
//! rate matrix; with the `lapack` feature one can be computed from a
//! reversible Q. The `python` feature builds the `pmlcore_rust` extension
//! module.

pub mod arena;
pub mod error;
pub mod matrix;
pub mod model;
pub mod optimize;
pub mod pruning;
mod quartet;
pub mod scaling;
pub mod session;
pub mod tips;
pub mod tree;
mod update;

#[cfg(feature = "python")]
mod python;

pub use error::{PmlError, Result};
pub use matrix::EigenDecomposition;
pub use model::{Model, RateClasses};
pub use optimize::{EdgeEstimate, EdgeOptimizer, NewtonConfig, RotatedEdge};
pub use pruning::{PruningConfig, ScalingMode, TipStrategy};
pub use session::Session;
pub use tips::TipData;
pub use tree::Tree;
