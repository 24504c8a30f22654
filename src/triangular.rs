//! Pivot-free LU factorization and triangular solves on dense blocks.
//!
//! The LU factors are stored packed in one block as produced by the Crout
//! algorithm: the lower factor $L$ keeps its diagonal, the upper factor $U$
//! has an implicit unit diagonal. Consequently every triangular solve with
//! [`UPLO::Lower`] uses the stored diagonal while every solve with
//! [`UPLO::Upper`] assumes a unit diagonal.

use crate::dense::{DenseBlock, Mask, Op};
use crate::types::{Result, RustyHMatrixError, ScalarType};
use ndarray::{Array2, ArrayView2, ArrayViewMut2, ShapeBuilder};
use ndarray_linalg::UPLO;

/// Side of the triangular factor in a solve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// Solve `op(A) X = B`.
    Left,
    /// Solve `X op(A) = B`.
    Right,
}

/// Crout LU decomposition without row pivoting.
///
/// Returns the packed factors `L` (lower, with diagonal) and `U`
/// (strictly upper, unit diagonal) in a single block.
pub fn lu_crout<A: ScalarType>(mat: &DenseBlock<A>) -> Result<DenseBlock<A>> {
    let n = mat.nrows();
    if n != mat.ncols() {
        return Err(RustyHMatrixError::ShapeMismatch(format!(
            "LU decomposition needs a square block, found {:?}",
            mat.shape()
        )));
    }

    let mut b = mat.clone();

    for j in 0..n {
        // L(i, j) = A(i, j) - L(i, k) U(k, j)
        for i in j..n {
            let mut sum = b[(i, j)];
            for k in 0..j {
                sum -= b[(i, k)] * b[(k, j)];
            }
            b[(i, j)] = sum;
        }

        let pivot = b[(j, j)];
        if pivot == A::zero() {
            return Err(RustyHMatrixError::Singular);
        }

        // U(j, i) = (A(j, i) - L(j, k) U(k, i)) / L(j, j)
        for i in j + 1..n {
            let mut sum = b[(j, i)];
            for k in 0..j {
                sum -= b[(j, k)] * b[(k, i)];
            }
            b[(j, i)] = sum / pivot;
        }
    }

    Ok(b)
}

/// Solve a triangular system with a packed factor.
///
/// For `Side::Left` this solves `op(A[mask_a]) X = B[mask_b]`, for
/// `Side::Right` it solves `X op(A[mask_a]) = B[mask_b]`. `uplo` refers to
/// the stored triangle of `A` before `op` is applied.
pub fn solve_triangular<A: ScalarType>(
    side: Side,
    uplo: UPLO,
    op: Op,
    a: &DenseBlock<A>,
    mask_a: Mask,
    b: &DenseBlock<A>,
    mask_b: Mask,
) -> Result<DenseBlock<A>> {
    let a_view = a.masked(mask_a)?;
    if a_view.nrows() != a_view.ncols() {
        return Err(RustyHMatrixError::ShapeMismatch(format!(
            "triangular factor {} is not square",
            mask_a
        )));
    }

    match side {
        Side::Left => {
            let mut x = b.mask(mask_b)?;
            solve_left_in_place(a_view, uplo, op, x.view_mut())?;
            Ok(x)
        }
        Side::Right => {
            // X op(A) = B  <=>  op(A)^T X^T = B^T
            let flipped = match op {
                Op::NoTrans => Op::Trans,
                Op::Trans => Op::NoTrans,
            };
            let mut xt = DenseBlock::from_array(b.masked(mask_b)?.t().to_owned());
            solve_left_in_place(a_view, uplo, flipped, xt.view_mut())?;
            Ok(xt.transpose())
        }
    }
}

/// Solve `A x = b` in place for the rows `row_begin..row_begin + n` of `b`,
/// where `A` is the full packed `n x n` factor.
pub fn solve_rows_in_place<A: ScalarType>(
    a: &DenseBlock<A>,
    uplo: UPLO,
    b: &mut DenseBlock<A>,
    row_begin: usize,
) -> Result<()> {
    let n = a.nrows();
    let ncols = b.ncols();
    let x = b.masked_mut(Mask::new(row_begin, row_begin + n, 0, ncols))?;
    solve_left_in_place(a.view(), uplo, Op::NoTrans, x)
}

/// Solve `op(A) X = B` with `X` overwriting `B`.
///
/// Goes through LAPACK `trtrs` with the `lapack` feature and through
/// substitution otherwise.
pub(crate) fn solve_left_in_place<A: ScalarType>(
    a: ArrayView2<A>,
    uplo: UPLO,
    op: Op,
    x: ArrayViewMut2<A>,
) -> Result<()> {
    let n = a.nrows();
    if x.nrows() != n {
        return Err(RustyHMatrixError::ShapeMismatch(format!(
            "triangular factor of order {} cannot act on {} rows",
            n,
            x.nrows()
        )));
    }

    #[cfg(feature = "lapack")]
    return lapack::solve_left_in_place(a, uplo, op, x);
    #[cfg(not(feature = "lapack"))]
    substitute_in_place(a, uplo, op, x)
}

/// Forward or backward substitution for `op(A) X = B`.
#[cfg_attr(feature = "lapack", allow(dead_code))]
fn substitute_in_place<A: ScalarType>(
    a: ArrayView2<A>,
    uplo: UPLO,
    op: Op,
    mut x: ArrayViewMut2<A>,
) -> Result<()> {
    let n = a.nrows();
    let unit = uplo == UPLO::Upper;
    let entry = |i: usize, k: usize| match op {
        Op::NoTrans => a[[i, k]],
        Op::Trans => a[[k, i]],
    };
    // Transposition swaps the triangle that is referenced.
    let forward = (uplo == UPLO::Lower) == (op == Op::NoTrans);

    let order: Vec<usize> = if forward {
        (0..n).collect()
    } else {
        (0..n).rev().collect()
    };

    for col in 0..x.ncols() {
        for (pos, &i) in order.iter().enumerate() {
            let mut sum = x[[i, col]];
            for &k in &order[..pos] {
                sum -= entry(i, k) * x[[k, col]];
            }
            if !unit {
                let diag = entry(i, i);
                if diag == A::zero() {
                    return Err(RustyHMatrixError::Singular);
                }
                sum /= diag;
            }
            x[[i, col]] = sum;
        }
    }

    Ok(())
}

/// Inverse by Gauss-Jordan elimination with partial pivoting.
#[cfg_attr(feature = "lapack", allow(dead_code))]
pub(crate) fn inverse_gauss_jordan<A: ScalarType>(mat: ArrayView2<A>) -> Result<Array2<A>> {
    let n = mat.nrows();
    let mut work = Array2::<A>::zeros((n, n).f());
    work.assign(&mat);
    let mut inv = Array2::<A>::zeros((n, n).f());
    inv.diag_mut().fill(A::one());

    for j in 0..n {
        let mut pivot_row = j;
        for i in j + 1..n {
            if work[[i, j]].abs() > work[[pivot_row, j]].abs() {
                pivot_row = i;
            }
        }

        if work[[pivot_row, j]] == A::zero() {
            return Err(RustyHMatrixError::Singular);
        }

        if pivot_row != j {
            for k in 0..n {
                work.swap([j, k], [pivot_row, k]);
                inv.swap([j, k], [pivot_row, k]);
            }
        }

        let scale = A::one() / work[[j, j]];
        for k in 0..n {
            work[[j, k]] *= scale;
            inv[[j, k]] *= scale;
        }

        for i in 0..n {
            if i == j {
                continue;
            }
            let factor = work[[i, j]];
            if factor == A::zero() {
                continue;
            }
            for k in 0..n {
                let w = work[[j, k]];
                let v = inv[[j, k]];
                work[[i, k]] -= factor * w;
                inv[[i, k]] -= factor * v;
            }
        }
    }

    Ok(inv)
}

#[cfg(any(feature = "lapack", test))]
mod lapack {
    use crate::dense::Op;
    use crate::types::{from_lapack, Result, ScalarType};
    use ndarray::{ArrayView2, ArrayViewMut2};
    use ndarray_linalg::{Diag, SolveTriangularInplace, UPLO};

    /// `op(A) X = B` through `trtrs` on contiguous copies of `A` and `B`.
    pub(super) fn solve_left_in_place<A: ScalarType>(
        a: ArrayView2<A>,
        uplo: UPLO,
        op: Op,
        mut x: ArrayViewMut2<A>,
    ) -> Result<()> {
        if a.is_empty() || x.is_empty() {
            return Ok(());
        }

        let diag = match uplo {
            UPLO::Upper => Diag::Unit,
            UPLO::Lower => Diag::NonUnit,
        };
        // The transpose of a lower factor is upper triangular and vice versa.
        let (factor, uplo) = match op {
            Op::NoTrans => (a.to_owned(), uplo),
            Op::Trans => (a.t().to_owned(), uplo.t()),
        };

        let mut rhs = x.to_owned();
        factor
            .solve_triangular_inplace(uplo, diag, &mut rhs)
            .map_err(from_lapack)?;
        x.assign(&rhs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::dense::mul;
    use crate::helpers::RelDiff;
    use crate::random_matrix::RandomMatrix;
    use crate::types::{c32, c64};

    /// Split packed Crout factors into explicit L and U.
    fn unpack<A: ScalarType>(packed: &DenseBlock<A>) -> (DenseBlock<A>, DenseBlock<A>) {
        let n = packed.nrows();
        let lower = DenseBlock::from_shape_fn(n, n, |(i, j)| {
            if i >= j {
                packed[(i, j)]
            } else {
                A::zero()
            }
        });
        let upper = DenseBlock::from_shape_fn(n, n, |(i, j)| {
            if i == j {
                A::one()
            } else if i < j {
                packed[(i, j)]
            } else {
                A::zero()
            }
        });
        (lower, upper)
    }

    macro_rules! lu_tests {

        ($($name:ident: $scalar:ty, $dim:expr, $tol:expr,)*) => {

            $(

        #[test]
        fn $name() {
            let mut rng = rand::thread_rng();
            let mat = DenseBlock::from_array(<$scalar>::random_diagonally_dominant($dim, &mut rng));
            let packed = lu_crout(&mat).unwrap();
            let (lower, upper) = unpack(&packed);

            let prod = &lower * &upper;
            assert!(prod.view().rel_diff(mat.view()) < $tol);

            let rhs = DenseBlock::from_array(<$scalar>::random_gaussian(($dim, 3), &mut rng));

            // L U X = B through two left solves
            let y = solve_triangular(Side::Left, UPLO::Lower, Op::NoTrans, &packed, packed.size(), &rhs, rhs.size()).unwrap();
            let x = solve_triangular(Side::Left, UPLO::Upper, Op::NoTrans, &packed, packed.size(), &y, y.size()).unwrap();
            assert!((&mat * &x).view().rel_diff(rhs.view()) < $tol);

            // X L U = B^T through two right solves
            let rhs_t = rhs.transpose();
            let z = solve_triangular(Side::Right, UPLO::Upper, Op::NoTrans, &packed, packed.size(), &rhs_t, rhs_t.size()).unwrap();
            let x = solve_triangular(Side::Right, UPLO::Lower, Op::NoTrans, &packed, packed.size(), &z, z.size()).unwrap();
            assert!((&x * &mat).view().rel_diff(rhs_t.view()) < $tol);

            // L^T X = B
            let x = solve_triangular(Side::Left, UPLO::Lower, Op::Trans, &packed, packed.size(), &rhs, rhs.size()).unwrap();
            let check = mul(&lower, lower.size(), Op::Trans, &x, x.size(), Op::NoTrans).unwrap();
            assert!(check.view().rel_diff(rhs.view()) < $tol);
        }

            )*

        }
    }

    lu_tests! {
        test_lu_f32: f32, 12, 1E-4,
        test_lu_f64: f64, 25, 1E-11,
        test_lu_c32: c32, 12, 1E-4,
        test_lu_c64: c64, 25, 1E-11,
    }

    macro_rules! backend_agreement_tests {

        ($($name:ident: $scalar:ty, $tol:expr,)*) => {

            $(

        #[test]
        fn $name() {
            let mut rng = rand::thread_rng();
            let mat = DenseBlock::from_array(<$scalar>::random_diagonally_dominant(9, &mut rng));
            let packed = lu_crout(&mat).unwrap();
            let rhs = DenseBlock::from_array(<$scalar>::random_gaussian((13, 4), &mut rng));
            let rows = Mask::new(2, 11, 0, 4);

            for &uplo in &[UPLO::Lower, UPLO::Upper] {
                for &op in &[Op::NoTrans, Op::Trans] {
                    let mut by_substitution = rhs.clone();
                    substitute_in_place(packed.view(), uplo, op, by_substitution.masked_mut(rows).unwrap()).unwrap();
                    let mut by_lapack = rhs.clone();
                    lapack::solve_left_in_place(packed.view(), uplo, op, by_lapack.masked_mut(rows).unwrap()).unwrap();

                    assert!(by_lapack.view().rel_diff(by_substitution.view()) < $tol);
                    assert_eq!(by_lapack[(0, 0)], rhs[(0, 0)]);
                    assert_eq!(by_lapack[(12, 3)], rhs[(12, 3)]);
                }
            }
        }

            )*

        }
    }

    backend_agreement_tests! {
        test_backend_agreement_f32: f32, 1E-5,
        test_backend_agreement_f64: f64, 1E-13,
        test_backend_agreement_c32: c32, 1E-5,
        test_backend_agreement_c64: c64, 1E-13,
    }

    #[test]
    fn test_backends_detect_zero_diagonal() {
        let mut lower = DenseBlock::<f64>::from_elem(3, 3, 1.0);
        lower[(1, 1)] = 0.0;
        let rhs = DenseBlock::<f64>::from_elem(3, 1, 1.0);

        let mut x = rhs.clone();
        assert!(matches!(
            substitute_in_place(lower.view(), UPLO::Lower, Op::NoTrans, x.view_mut()),
            Err(RustyHMatrixError::Singular)
        ));
        let mut x = rhs.clone();
        assert!(matches!(
            lapack::solve_left_in_place(lower.view(), UPLO::Lower, Op::NoTrans, x.view_mut()),
            Err(RustyHMatrixError::Singular)
        ));

        // The upper factor has a unit diagonal, the stored zero is ignored.
        let mut x = rhs.clone();
        lapack::solve_left_in_place(lower.view(), UPLO::Upper, Op::NoTrans, x.view_mut()).unwrap();
        let mut y = rhs;
        substitute_in_place(lower.view(), UPLO::Upper, Op::NoTrans, y.view_mut()).unwrap();
        assert_eq!(x, y);
    }

    #[test]
    fn test_solve_rows_in_place() {
        let mut rng = rand::thread_rng();
        let mat = DenseBlock::from_array(f64::random_diagonally_dominant(4, &mut rng));
        let packed = lu_crout(&mat).unwrap();
        let (lower, _) = unpack(&packed);

        let mut rhs = DenseBlock::<f64>::from_elem(7, 2, 1.0);
        solve_rows_in_place(&packed, UPLO::Lower, &mut rhs, 2).unwrap();

        let x = rhs.mask(Mask::new(2, 6, 0, 2)).unwrap();
        let back = &lower * &x;
        assert!(back.view().rel_diff(DenseBlock::from_elem(4, 2, 1.0).view()) < 1E-12);
        assert_eq!(rhs[(0, 0)], 1.0);
        assert_eq!(rhs[(6, 1)], 1.0);
    }

    #[test]
    fn test_zero_pivot_is_singular() {
        let mat = DenseBlock::<f64>::from_column_major(2, 2, vec![0.0, 1.0, 1.0, 0.0]).unwrap();
        assert!(matches!(lu_crout(&mat), Err(RustyHMatrixError::Singular)));

        // Gauss-Jordan pivots through the zero diagonal.
        let inv = mat.inv().unwrap();
        assert_eq!(inv, mat);
    }
}
