//! Scalar types, the error type and the crate wide `Result` alias.

use crate::io::BinaryScalar;
use thiserror::Error;

pub use ndarray_linalg::{c32, c64, Lapack, Scalar};

#[derive(Error, Debug)]
pub enum RustyHMatrixError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("Mask {mask} exceeds block of shape ({nrows}, {ncols})")]
    MaskOutOfBounds {
        mask: crate::dense::Mask,
        nrows: usize,
        ncols: usize,
    },
    #[error("Matrix is singular")]
    Singular,
    #[error("No submatrix stored for cluster pair ({row}, {col})")]
    MissingBlock { row: usize, col: usize },
    #[error("Invalid cluster tree: {0}")]
    InvalidTree(String),
    #[error("Invalid options: {0}")]
    InvalidOptions(String),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("Lapack Error")]
    LinalgError(#[from] ndarray_linalg::error::LinalgError),
}

/// Map a failed LAPACK factorization or solve onto the crate error.
///
/// A non-zero `info` from LAPACK is an exactly zero pivot.
#[cfg(any(feature = "lapack", test))]
pub(crate) fn from_lapack(err: ndarray_linalg::error::LinalgError) -> RustyHMatrixError {
    match err {
        ndarray_linalg::error::LinalgError::Lapack(_) => RustyHMatrixError::Singular,
        other => RustyHMatrixError::LinalgError(other),
    }
}

pub type Result<T> = std::result::Result<T, RustyHMatrixError>;

/// Scalar types the H-matrix engine is instantiated for.
///
/// This is `f32`, `f64`, `c32` and `c64`.
pub trait ScalarType: Scalar + Lapack + BinaryScalar {}

impl<A: Scalar + Lapack + BinaryScalar> ScalarType for A {}

/// Convert a real part into `f64` for tolerance checks.
pub(crate) fn real_to_f64<R: num::ToPrimitive>(value: R) -> f64 {
    value.to_f64().unwrap_or(f64::NAN)
}

/// Convert an `f64` into the scalar type `A`.
pub(crate) fn scalar_from_f64<A: Scalar>(value: f64) -> A {
    A::from_real(num::cast::<f64, A::Real>(value).unwrap_or_else(<A::Real as num::Float>::nan))
}
