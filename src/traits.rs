//! This module contains the trait used to look up submatrices by cluster
//! pair, shared by H-matrices and single submatrices.

use crate::submatrix::SubMatrix;
use crate::types::ScalarType;

/// Source of submatrices keyed by `(row cluster, column cluster)`.
///
/// An H-matrix returns its stored entry if there is one. A single
/// submatrix returns itself for every pair, so that the recursive block
/// algorithms can treat a submatrix that has to be subdivided the same way
/// as an H-matrix.
pub trait BlockSource<T>
where
    T: ScalarType,
{
    fn find(&self, row: usize, col: usize) -> Option<&SubMatrix<T>>;
}

impl<T: ScalarType> BlockSource<T> for SubMatrix<T> {
    fn find(&self, _row: usize, _col: usize) -> Option<&SubMatrix<T>> {
        Some(self)
    }
}
