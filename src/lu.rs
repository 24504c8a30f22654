//! Hierarchical LU decomposition without pivoting.
//!
//! The factors are stored packed in one [`HMatrix`]. Diagonal leaf blocks
//! hold the packed Crout factors of [`lu_crout`], blocks below the diagonal
//! belong to `L` and blocks above the diagonal to `U`. As for dense blocks,
//! `L` carries the diagonal and `U` has a unit diagonal, so a solve with
//! [`UPLO::Lower`] always refers to `L` and one with [`UPLO::Upper`] to `U`.
//!
//! For a cluster `i` with sons `i0` and `i1` the recursion is
//! ```text
//! L00 U00 = B00
//! L00 U01 = B01
//! L10 U00 = B10
//! L11 U11 = B11 - L10 U01
//! ```

use crate::cluster_tree::ClusterTree;
use crate::dense::{DenseBlock, Mask, Op};
use crate::hmatrix::{add_mul_block, mul, require, subtract, HMatrix};
use crate::options::Context;
use crate::submatrix::{cat, Block, SubMatrix};
use crate::traits::BlockSource;
use crate::triangular::{lu_crout, solve_rows_in_place, solve_triangular, Side};
use crate::types::{Result, RustyHMatrixError, ScalarType};
use ndarray::{Array1, ArrayView1};
use ndarray_linalg::UPLO;

/// Sons of a diagonal cluster that is subdivided by the factorization.
///
/// Leaves and clusters whose diagonal pair is admissible are handled as
/// one dense block.
fn split(tree: &ClusterTree, i: usize) -> Option<(usize, usize)> {
    if tree.admissibility(i, i).is_admissible() {
        None
    } else {
        tree.children(i)
    }
}

/// Dense copy of a triangular factor block.
fn dense_factor<A: ScalarType>(tree: &ClusterTree, factor: &SubMatrix<A>) -> Result<DenseBlock<A>> {
    match factor.block() {
        Block::Dense(mat) => Ok(mat.clone()),
        Block::Empty => Err(RustyHMatrixError::MissingBlock {
            row: factor.row(),
            col: factor.col(),
        }),
        Block::LowRank { .. } => factor.to_dense(tree),
    }
}

/// Compute the packed LU factors of a complete H-matrix.
pub fn lu<A: ScalarType>(ctx: &Context, b: &HMatrix<A>) -> Result<HMatrix<A>> {
    log::debug!("Computing H-LU of H-matrix with {} blocks.", b.len());
    let mut a = HMatrix::new();
    lu_node(ctx, b, &mut a, 0)?;
    log::debug!("LU factors have maximum rank {}.", a.max_rank());
    Ok(a)
}

/// Factorize the diagonal block `B(i, i)` into `A`.
pub fn lu_node<A: ScalarType>(
    ctx: &Context,
    b: &HMatrix<A>,
    a: &mut HMatrix<A>,
    i: usize,
) -> Result<()> {
    let tree = ctx.tree;
    tree.check_nodes(&[i])?;

    let (i0, i1) = match split(tree, i) {
        Some(sons) => sons,
        None => {
            let block = require(b, i, i)?.to_dense(tree)?;
            a.insert(SubMatrix::dense(i, i, lu_crout(&block)?));
            return Ok(());
        }
    };

    lu_node(ctx, b, a, i0)?;

    let mut upper = HMatrix::new();
    lsolve(ctx, b, a, &mut upper, i0, i1, UPLO::Lower)?;
    a.merge(ctx, upper)?;

    let mut lower = HMatrix::new();
    rsolve(ctx, b, a, &mut lower, i1, i0, UPLO::Upper)?;
    a.merge(ctx, lower)?;

    let schur = subtract(ctx, b, &mul(ctx, &*a, &*a, i1, i1, i0)?, i1, i1)?;
    lu_node(ctx, &schur, a, i1)
}

/// `B(i, j) - A(i, k) X(k, j)` on the pairs below `(i, j)`.
fn sub_mul<A: ScalarType>(
    ctx: &Context,
    b: &HMatrix<A>,
    a: &dyn BlockSource<A>,
    x: &dyn BlockSource<A>,
    i: usize,
    j: usize,
    k: usize,
) -> Result<HMatrix<A>> {
    subtract(ctx, b, &mul(ctx, a, x, i, j, k)?, i, j)
}

/// Solve `op(A(i, i)) X = B` for a single submatrix `B` with a dense factor.
pub fn lsolve_block<A: ScalarType>(
    ctx: &Context,
    a: &SubMatrix<A>,
    b: &SubMatrix<A>,
    i: usize,
    j: usize,
    uplo: UPLO,
) -> Result<SubMatrix<A>> {
    let factor = dense_factor(ctx.tree, a)?;
    let fmask = factor.size();
    Ok(match b.block() {
        Block::Empty => SubMatrix::empty(i, j),
        Block::Dense(mat) => SubMatrix::dense(
            i,
            j,
            solve_triangular(Side::Left, uplo, Op::NoTrans, &factor, fmask, mat, mat.size())?,
        ),
        Block::LowRank { lhs, rhs } => SubMatrix::low_rank(
            i,
            j,
            solve_triangular(Side::Left, uplo, Op::NoTrans, &factor, fmask, lhs, lhs.size())?,
            rhs.clone(),
        ),
    })
}

/// Solve `X op(A(j, j)) = B` for a single submatrix `B` with a dense factor.
pub fn rsolve_block<A: ScalarType>(
    ctx: &Context,
    a: &SubMatrix<A>,
    b: &SubMatrix<A>,
    i: usize,
    j: usize,
    uplo: UPLO,
) -> Result<SubMatrix<A>> {
    let factor = dense_factor(ctx.tree, a)?;
    let fmask = factor.size();
    Ok(match b.block() {
        Block::Empty => SubMatrix::empty(i, j),
        Block::Dense(mat) => SubMatrix::dense(
            i,
            j,
            solve_triangular(Side::Right, uplo, Op::NoTrans, &factor, fmask, mat, mat.size())?,
        ),
        // L R^T A^{-1} = L (A^{-T} R)^T
        Block::LowRank { lhs, rhs } => SubMatrix::low_rank(
            i,
            j,
            lhs.clone(),
            solve_triangular(Side::Left, uplo, Op::Trans, &factor, fmask, rhs, rhs.size())?,
        ),
    })
}

/// Split a submatrix over the sons of `(i, j)` for [`cat`].
fn split_rows<A: ScalarType>(
    tree: &ClusterTree,
    parts: &[&SubMatrix<A>],
    i: usize,
    j: usize,
) -> Result<Vec<Vec<SubMatrix<A>>>> {
    let cols = tree.sons(j);
    tree.sons(i)
        .iter()
        .zip(parts.iter())
        .map(|(&ii, part)| {
            cols.iter()
                .map(|&jj| part.restrict(tree, ii, jj))
                .collect::<Result<Vec<_>>>()
        })
        .collect()
}

/// Solve `op(A(i, i)) X = B` for a single submatrix `B` by subdividing
/// the factor.
pub fn lsolve_sub<A: ScalarType>(
    ctx: &Context,
    b: &SubMatrix<A>,
    a: &HMatrix<A>,
    i: usize,
    j: usize,
    uplo: UPLO,
) -> Result<SubMatrix<A>> {
    let tree = ctx.tree;
    tree.check_nodes(&[i, j])?;
    let format = match b.format() {
        Some(format) => format,
        None => return Ok(SubMatrix::empty(i, j)),
    };

    let (i0, i1) = match split(tree, i) {
        Some(sons) => sons,
        None => return lsolve_block(ctx, require(a, i, i)?, b, i, j, uplo),
    };
    let (first, second) = match uplo {
        UPLO::Lower => (i0, i1),
        UPLO::Upper => (i1, i0),
    };

    let x_first = lsolve_sub(ctx, &b.restrict(tree, first, j)?, a, first, j, uplo)?;
    let update = add_mul_block(ctx, a, &x_first, second, j, first, format)?;
    let rhs = SubMatrix::sub(ctx, &b.restrict(tree, second, j)?, &update)?;
    let x_second = lsolve_sub(ctx, &rhs, a, second, j, uplo)?;

    let parts = match uplo {
        UPLO::Lower => [&x_first, &x_second],
        UPLO::Upper => [&x_second, &x_first],
    };
    let mut x = cat(ctx, &split_rows(tree, &parts, i, j)?, i, j)?;
    x.truncate(ctx)?;
    Ok(x)
}

/// Solve `X op(A(j, j)) = B` for a single submatrix `B` by subdividing
/// the factor.
pub fn rsolve_sub<A: ScalarType>(
    ctx: &Context,
    b: &SubMatrix<A>,
    a: &HMatrix<A>,
    i: usize,
    j: usize,
    uplo: UPLO,
) -> Result<SubMatrix<A>> {
    let tree = ctx.tree;
    tree.check_nodes(&[i, j])?;
    let format = match b.format() {
        Some(format) => format,
        None => return Ok(SubMatrix::empty(i, j)),
    };

    let (j0, j1) = match split(tree, j) {
        Some(sons) => sons,
        None => return rsolve_block(ctx, require(a, j, j)?, b, i, j, uplo),
    };
    let (first, second) = match uplo {
        UPLO::Upper => (j0, j1),
        UPLO::Lower => (j1, j0),
    };

    let x_first = rsolve_sub(ctx, &b.restrict(tree, i, first)?, a, i, first, uplo)?;
    let update = add_mul_block(ctx, &x_first, a, i, second, first, format)?;
    let rhs = SubMatrix::sub(ctx, &b.restrict(tree, i, second)?, &update)?;
    let x_second = rsolve_sub(ctx, &rhs, a, i, second, uplo)?;

    let (x0, x1) = match uplo {
        UPLO::Upper => (&x_first, &x_second),
        UPLO::Lower => (&x_second, &x_first),
    };
    let grid = tree
        .sons(i)
        .iter()
        .map(|&ii| {
            Ok(vec![
                x0.restrict(tree, ii, j0)?,
                x1.restrict(tree, ii, j1)?,
            ])
        })
        .collect::<Result<Vec<_>>>()?;
    let mut x = cat(ctx, &grid, i, j)?;
    x.truncate(ctx)?;
    Ok(x)
}

/// Solve `op(A(i, i)) X(i, j) = B(i, j)` and store the blocks of `X` in `x`.
pub fn lsolve<A: ScalarType>(
    ctx: &Context,
    b: &HMatrix<A>,
    a: &HMatrix<A>,
    x: &mut HMatrix<A>,
    i: usize,
    j: usize,
    uplo: UPLO,
) -> Result<()> {
    let tree = ctx.tree;
    tree.check_nodes(&[i, j])?;

    match (a.find(i, i), b.find(i, j)) {
        (Some(pa), Some(pb)) => {
            x.insert(lsolve_block(ctx, pa, pb, i, j, uplo)?);
        }
        (Some(_), None) => {
            if tree.is_leaf(j) {
                return Err(RustyHMatrixError::MissingBlock { row: i, col: j });
            }
            for &jj in tree.sons(j) {
                lsolve(ctx, b, a, x, i, jj, uplo)?;
            }
        }
        (None, None) => {
            if tree.is_leaf(i) {
                return Err(RustyHMatrixError::MissingBlock { row: i, col: i });
            }
            let mut rows = tree.sons(i).to_vec();
            if uplo == UPLO::Upper {
                rows.reverse();
            }
            let other = rows[0];
            for (num, &ii) in rows.iter().enumerate() {
                for &jj in tree.sons(j) {
                    if num == 0 {
                        lsolve(ctx, b, a, x, ii, jj, uplo)?;
                    } else {
                        let rhs = sub_mul(ctx, b, a, &*x, ii, jj, other)?;
                        lsolve(ctx, &rhs, a, x, ii, jj, uplo)?;
                    }
                }
            }
        }
        (None, Some(pb)) => {
            x.insert(lsolve_sub(ctx, pb, a, i, j, uplo)?);
        }
    }
    Ok(())
}

/// Solve `X(i, j) op(A(j, j)) = B(i, j)` and store the blocks of `X` in `x`.
pub fn rsolve<A: ScalarType>(
    ctx: &Context,
    b: &HMatrix<A>,
    a: &HMatrix<A>,
    x: &mut HMatrix<A>,
    i: usize,
    j: usize,
    uplo: UPLO,
) -> Result<()> {
    let tree = ctx.tree;
    tree.check_nodes(&[i, j])?;

    match (a.find(j, j), b.find(i, j)) {
        (Some(pa), Some(pb)) => {
            x.insert(rsolve_block(ctx, pa, pb, i, j, uplo)?);
        }
        (Some(_), None) => {
            if tree.is_leaf(i) {
                return Err(RustyHMatrixError::MissingBlock { row: i, col: j });
            }
            for &ii in tree.sons(i) {
                rsolve(ctx, b, a, x, ii, j, uplo)?;
            }
        }
        (None, None) => {
            if tree.is_leaf(j) {
                return Err(RustyHMatrixError::MissingBlock { row: j, col: j });
            }
            let mut cols = tree.sons(j).to_vec();
            if uplo == UPLO::Lower {
                cols.reverse();
            }
            let other = cols[0];
            for (num, &jj) in cols.iter().enumerate() {
                for &ii in tree.sons(i) {
                    if num == 0 {
                        rsolve(ctx, b, a, x, ii, jj, uplo)?;
                    } else {
                        let rhs = sub_mul(ctx, b, &*x, a, ii, jj, other)?;
                        rsolve(ctx, &rhs, a, x, ii, jj, uplo)?;
                    }
                }
            }
        }
        (None, Some(pb)) => {
            x.insert(rsolve_sub(ctx, pb, a, i, j, uplo)?);
        }
    }
    Ok(())
}

/// Forward (`Lower`) or backward (`Upper`) substitution on the rows of
/// cluster `i` of `b`, which is indexed by global indices.
pub fn solve<A: ScalarType>(
    ctx: &Context,
    a: &HMatrix<A>,
    b: &mut DenseBlock<A>,
    i: usize,
    uplo: UPLO,
) -> Result<()> {
    let tree = ctx.tree;
    tree.check_nodes(&[i])?;

    let (i0, i1) = match split(tree, i) {
        Some(sons) => sons,
        None => {
            let factor = dense_factor(tree, require(a, i, i)?)?;
            return solve_rows_in_place(&factor, uplo, b, tree.range(i).0);
        }
    };
    let (first, second) = match uplo {
        UPLO::Lower => (i0, i1),
        UPLO::Upper => (i1, i0),
    };

    solve(ctx, a, b, first, uplo)?;
    for (row, col) in tree.admissible_pairs(second, first)? {
        let update = require(a, row, col)?.mul_block(tree, b)?;
        let (r0, r1) = tree.range(row);
        let mut target = b.masked_mut(Mask::new(r0, r1, 0, update.ncols()))?;
        target -= update.as_array();
    }
    solve(ctx, a, b, second, uplo)
}

/// Solve `L U x = b` in place for a block of right-hand sides.
pub fn lu_solve<A: ScalarType>(ctx: &Context, a: &HMatrix<A>, b: &mut DenseBlock<A>) -> Result<()> {
    let n = ctx.tree.num_indices();
    if b.nrows() != n {
        return Err(RustyHMatrixError::ShapeMismatch(format!(
            "right-hand side has {} rows, expected {}",
            b.nrows(),
            n
        )));
    }
    solve(ctx, a, b, 0, UPLO::Lower)?;
    solve(ctx, a, b, 0, UPLO::Upper)
}

/// Solve `L U x = b` for a single right-hand side vector.
pub fn lu_solve_vec<A: ScalarType>(
    ctx: &Context,
    a: &HMatrix<A>,
    b: ArrayView1<A>,
) -> Result<Array1<A>> {
    let mut x = DenseBlock::from_column_major(b.len(), 1, b.to_vec())?;
    lu_solve(ctx, a, &mut x)?;
    Ok(x.column(0).to_owned())
}

/// Solve `X (L U) = B` for an H-matrix `B`.
pub fn rsolve_lu<A: ScalarType>(
    ctx: &Context,
    b: &HMatrix<A>,
    a: &HMatrix<A>,
) -> Result<HMatrix<A>> {
    let mut z = HMatrix::new();
    rsolve(ctx, b, a, &mut z, 0, 0, UPLO::Upper)?;
    let mut x = HMatrix::new();
    rsolve(ctx, &z, a, &mut x, 0, 0, UPLO::Lower)?;
    Ok(x)
}

/// Solve `(L U) X = B` for an H-matrix `B`.
pub fn lsolve_lu<A: ScalarType>(
    ctx: &Context,
    b: &HMatrix<A>,
    a: &HMatrix<A>,
) -> Result<HMatrix<A>> {
    let mut z = HMatrix::new();
    lsolve(ctx, b, a, &mut z, 0, 0, UPLO::Lower)?;
    let mut x = HMatrix::new();
    lsolve(ctx, &z, a, &mut x, 0, 0, UPLO::Upper)?;
    Ok(x)
}
