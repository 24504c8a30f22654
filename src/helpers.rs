//! Helper traits used to compare matrices.

use crate::types::ScalarType;
use ndarray::{ArrayBase, Data, Ix2};
use ndarray_linalg::{Norm, Scalar};
use num::Zero;

pub trait RelDiff {
    type A: ScalarType;

    /// Relative Frobenius norm distance `|self - other| / |other|`.
    ///
    /// Falls back to the absolute distance if `other` is zero.
    fn rel_diff(&self, other: Self) -> <Self::A as Scalar>::Real;
}

impl<A, S> RelDiff for ArrayBase<S, Ix2>
where
    A: ScalarType,
    S: Data<Elem = A>,
{
    type A = A;
    fn rel_diff(&self, other: Self) -> <Self::A as Scalar>::Real {
        let diff = self - &other;
        let scale = other.norm_l2();

        if scale.is_zero() {
            diff.norm_l2()
        } else {
            diff.norm_l2() / scale
        }
    }
}
