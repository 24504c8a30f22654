//! Hierarchical matrices with adaptive cross approximation.
//!
//! A [`ClusterTree`] partitions the index range of a matrix. Pairs of
//! clusters are marked dense or low-rank admissible, and an [`HMatrix`]
//! stores one [`SubMatrix`] per admissible pair. Low-rank blocks are built
//! with [`aca`](aca::aca) from row and column samples of the target block.
//! On top of that the crate provides H-matrix arithmetic, inversion and a
//! hierarchical LU decomposition.

pub mod aca;
pub mod cluster_tree;
pub mod dense;
pub mod helpers;
pub mod hmatrix;
pub mod io;
pub mod lu;
pub mod options;
pub mod prelude;
pub mod random_matrix;
pub mod submatrix;
pub mod traits;
pub mod triangular;
pub mod types;

pub use aca::{aca, AcaGenerator, FnGenerator, KernelBlock, LowRankGenerator};
pub use cluster_tree::{Admissibility, ClusterTree};
pub use dense::{DenseBlock, Mask, Op};
pub use helpers::RelDiff;
pub use hmatrix::HMatrix;
pub use lu::{lu, lu_solve, lsolve_lu, rsolve_lu};
pub use options::{Context, Options};
pub use random_matrix::RandomMatrix;
pub use submatrix::{Block, Format, SubMatrix};
pub use traits::BlockSource;
pub use types::{c32, c64, Result, RustyHMatrixError, ScalarType};
