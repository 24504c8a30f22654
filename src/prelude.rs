//! Collect all traits and other exports here.

pub use crate::aca::{aca, AcaGenerator, FnGenerator, KernelBlock, LowRankGenerator};
pub use crate::cluster_tree::{Admissibility, ClusterTree};
pub use crate::dense::{DenseBlock, Mask, Op};
pub use crate::helpers::RelDiff;
pub use crate::hmatrix::{inverse, product, HMatrix};
pub use crate::lu::{lu, lu_solve, lu_solve_vec, lsolve_lu, rsolve_lu};
pub use crate::options::{Context, Options};
pub use crate::random_matrix::RandomMatrix;
pub use crate::submatrix::{Block, Format, SubMatrix};
pub use crate::traits::BlockSource;
pub use crate::triangular::Side;
pub use crate::types::{c32, c64, Result, RustyHMatrixError, ScalarType};
pub use ndarray_linalg::UPLO;
