//! Submatrices of an H-matrix, stored dense or as low-rank factor pair.
//!
//! A [`SubMatrix`] is attached to a pair of clusters `(row, col)`. Its
//! dimensions are those of the clusters and are never stored. A dense
//! block holds all entries, a low-rank block holds factors `lhs` and `rhs`
//! with the block being `lhs * rhs^T`.
//!
//! Many routines operate on a sub-cluster pair `(r, c)` of the stored pair,
//! in which case the factors are masked with the offsets of `r` and `c`
//! relative to `row` and `col`.

use crate::aca::{aca, LowRankGenerator};
use crate::cluster_tree::{Admissibility, ClusterTree};
use crate::dense::{self, add_mul, DenseBlock, Mask, Op};
use crate::options::Context;
use crate::types::{Result, RustyHMatrixError, ScalarType};
use std::ops::Neg;

/// Storage format of a non-empty submatrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Dense,
    LowRank,
}

impl Format {
    /// Storage format implied by an admissibility mark.
    pub fn from_admissibility(admissibility: Admissibility) -> Option<Format> {
        match admissibility {
            Admissibility::Dense => Some(Format::Dense),
            Admissibility::LowRank => Some(Format::LowRank),
            Admissibility::Unset => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Block<A: ScalarType> {
    /// A zero block without storage.
    Empty,
    Dense(DenseBlock<A>),
    LowRank {
        lhs: DenseBlock<A>,
        rhs: DenseBlock<A>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubMatrix<A: ScalarType> {
    row: usize,
    col: usize,
    block: Block<A>,
}

impl<A: ScalarType> SubMatrix<A> {
    pub fn empty(row: usize, col: usize) -> Self {
        SubMatrix {
            row,
            col,
            block: Block::Empty,
        }
    }

    pub fn dense(row: usize, col: usize, mat: DenseBlock<A>) -> Self {
        SubMatrix {
            row,
            col,
            block: Block::Dense(mat),
        }
    }

    pub fn low_rank(row: usize, col: usize, lhs: DenseBlock<A>, rhs: DenseBlock<A>) -> Self {
        SubMatrix {
            row,
            col,
            block: Block::LowRank { lhs, rhs },
        }
    }

    pub fn row(&self) -> usize {
        self.row
    }

    pub fn col(&self) -> usize {
        self.col
    }

    pub fn key(&self) -> (usize, usize) {
        (self.row, self.col)
    }

    pub fn block(&self) -> &Block<A> {
        &self.block
    }

    pub fn into_block(self) -> Block<A> {
        self.block
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.block, Block::Empty)
    }

    /// Storage format, `None` for an empty submatrix.
    pub fn format(&self) -> Option<Format> {
        match self.block {
            Block::Empty => None,
            Block::Dense(_) => Some(Format::Dense),
            Block::LowRank { .. } => Some(Format::LowRank),
        }
    }

    /// Rank of a low-rank submatrix.
    pub fn rank(&self) -> Option<usize> {
        match &self.block {
            Block::LowRank { lhs, .. } => Some(lhs.ncols()),
            _ => None,
        }
    }

    /// Number of stored scalars.
    pub fn storage(&self) -> usize {
        match &self.block {
            Block::Empty => 0,
            Block::Dense(mat) => mat.len(),
            Block::LowRank { lhs, rhs } => lhs.len() + rhs.len(),
        }
    }

    pub fn nrows(&self, tree: &ClusterTree) -> usize {
        tree.size(self.row)
    }

    pub fn ncols(&self, tree: &ClusterTree) -> usize {
        tree.size(self.col)
    }

    /// Mask of the sub-cluster pair `(r, c)` within the dense block.
    pub fn size(&self, tree: &ClusterTree, r: usize, c: usize) -> Result<Mask> {
        Ok(Mask::from_ranges(
            tree.range_relative(r, self.row)?,
            tree.range_relative(c, self.col)?,
        ))
    }

    /// Mask of the rows of sub-cluster `r` within the left factor.
    pub fn lsize(&self, tree: &ClusterTree, r: usize) -> Result<Mask> {
        let rank = self.rank().unwrap_or(0);
        Ok(Mask::from_ranges(tree.range_relative(r, self.row)?, (0, rank)))
    }

    /// Mask of the rows of sub-cluster `c` within the right factor.
    pub fn rsize(&self, tree: &ClusterTree, c: usize) -> Result<Mask> {
        let rank = self.rank().unwrap_or(0);
        Ok(Mask::from_ranges(tree.range_relative(c, self.col)?, (0, rank)))
    }

    /// Check that the stored blocks match the cluster sizes.
    pub fn check_shape(&self, tree: &ClusterTree) -> Result<()> {
        tree.check_nodes(&[self.row, self.col])?;
        let (m, n) = (self.nrows(tree), self.ncols(tree));
        let ok = match &self.block {
            Block::Empty => true,
            Block::Dense(mat) => mat.shape() == (m, n),
            Block::LowRank { lhs, rhs } => {
                lhs.nrows() == m && rhs.nrows() == n && lhs.ncols() == rhs.ncols()
            }
        };
        if ok {
            Ok(())
        } else {
            Err(RustyHMatrixError::ShapeMismatch(format!(
                "submatrix ({}, {}) does not match cluster sizes ({}, {})",
                self.row, self.col, m, n
            )))
        }
    }

    /// Restriction to the sub-cluster pair `(r, c)`.
    pub fn restrict(&self, tree: &ClusterTree, r: usize, c: usize) -> Result<SubMatrix<A>> {
        Ok(match &self.block {
            Block::Empty => SubMatrix::empty(r, c),
            Block::Dense(mat) => SubMatrix::dense(r, c, mat.mask(self.size(tree, r, c)?)?),
            Block::LowRank { lhs, rhs } => SubMatrix::low_rank(
                r,
                c,
                lhs.mask(self.lsize(tree, r)?)?,
                rhs.mask(self.rsize(tree, c)?)?,
            ),
        })
    }

    /// Expand to a dense block.
    pub fn to_dense(&self, tree: &ClusterTree) -> Result<DenseBlock<A>> {
        tree.check_nodes(&[self.row, self.col])?;
        match &self.block {
            Block::Empty => Ok(DenseBlock::zeros(self.nrows(tree), self.ncols(tree))),
            Block::Dense(mat) => Ok(mat.clone()),
            Block::LowRank { lhs, rhs } => {
                dense::mul(lhs, lhs.size(), Op::NoTrans, rhs, rhs.size(), Op::Trans)
            }
        }
    }

    /// Copy in the requested storage format.
    ///
    /// Dense blocks are compressed with ACA at the context tolerance,
    /// low-rank blocks are expanded. Empty submatrices become zero blocks
    /// or rank zero factors.
    pub fn convert(&self, ctx: &Context, format: Format) -> Result<SubMatrix<A>> {
        let tree = ctx.tree;
        match (&self.block, format) {
            (Block::Dense(_), Format::Dense) | (Block::LowRank { .. }, Format::LowRank) => {
                Ok(self.clone())
            }
            (Block::Empty, Format::Dense) => Ok(SubMatrix::dense(
                self.row,
                self.col,
                DenseBlock::zeros(self.nrows(tree), self.ncols(tree)),
            )),
            (Block::Empty, Format::LowRank) => Ok(SubMatrix::low_rank(
                self.row,
                self.col,
                DenseBlock::zeros(self.nrows(tree), 0),
                DenseBlock::zeros(self.ncols(tree), 0),
            )),
            (Block::LowRank { .. }, Format::Dense) => {
                Ok(SubMatrix::dense(self.row, self.col, self.to_dense(tree)?))
            }
            (Block::Dense(mat), Format::LowRank) => {
                let (lhs, rhs) = aca(mat, ctx.tol(), ctx.max_rank())?;
                Ok(SubMatrix::low_rank(self.row, self.col, lhs, rhs))
            }
        }
    }

    /// Consume and convert into the format given by an admissibility mark.
    pub(crate) fn into_admissibility(self, ctx: &Context, ad: Admissibility) -> Result<Self> {
        match Format::from_admissibility(ad) {
            Some(format) if self.format() != Some(format) => self.convert(ctx, format),
            _ => Ok(self),
        }
    }

    /// Recompress a low-rank submatrix with ACA at the context tolerance.
    pub fn truncate(&mut self, ctx: &Context) -> Result<()> {
        if let Block::LowRank { lhs, rhs } = &self.block {
            let old_rank = lhs.ncols();
            let (l, r) = aca(
                &LowRankGenerator::new(lhs, rhs)?,
                ctx.tol(),
                ctx.max_rank(),
            )?;
            log::trace!(
                "Truncated ({}, {}) from rank {} to {}.",
                self.row,
                self.col,
                old_rank,
                l.ncols()
            );
            self.block = Block::LowRank { lhs: l, rhs: r };
        }
        Ok(())
    }

    /// Compressing accumulation `self += other`.
    ///
    /// `other` is converted to the format of `self`. Low-rank sums are
    /// recompressed so that the rank stays bounded.
    pub fn add_assign(&mut self, ctx: &Context, other: &SubMatrix<A>) -> Result<()> {
        let tree = ctx.tree;
        tree.check_nodes(&[self.row, self.col, other.row, other.col])?;
        if tree.size(self.row) != tree.size(other.row) || tree.size(self.col) != tree.size(other.col)
        {
            return Err(RustyHMatrixError::ShapeMismatch(format!(
                "cannot add submatrix ({}, {}) to ({}, {})",
                other.row, other.col, self.row, self.col
            )));
        }

        match self.format() {
            _ if other.is_empty() => (),
            None => self.block = other.block.clone(),
            Some(Format::Dense) => {
                let rhs = other.convert(ctx, Format::Dense)?;
                if let (Block::Dense(mat), Block::Dense(add)) = (&mut self.block, &rhs.block) {
                    mat.add_scaled(A::one(), add)?;
                }
            }
            Some(Format::LowRank) => {
                let rhs = other.convert(ctx, Format::LowRank)?;
                if let (Block::LowRank { lhs, rhs: r }, Block::LowRank { lhs: l2, rhs: r2 }) =
                    (&self.block, &rhs.block)
                {
                    self.block = Block::LowRank {
                        lhs: dense::cat(lhs, l2)?,
                        rhs: dense::cat(r, r2)?,
                    };
                }
                self.truncate(ctx)?;
            }
        }
        Ok(())
    }

    /// `a + b` with compressing accumulation.
    pub fn add(ctx: &Context, a: &SubMatrix<A>, b: &SubMatrix<A>) -> Result<SubMatrix<A>> {
        let mut sum = a.clone();
        sum.add_assign(ctx, b)?;
        Ok(sum)
    }

    /// `a - b` with compressing accumulation.
    pub fn sub(ctx: &Context, a: &SubMatrix<A>, b: &SubMatrix<A>) -> Result<SubMatrix<A>> {
        let mut diff = a.clone();
        diff.add_assign(ctx, &-b)?;
        Ok(diff)
    }

    /// Product with the rows of `x` belonging to the column cluster.
    ///
    /// `x` is indexed by global indices. The result has the rows of the row
    /// cluster and the columns of `x`.
    pub fn mul_block(&self, tree: &ClusterTree, x: &DenseBlock<A>) -> Result<DenseBlock<A>> {
        tree.check_nodes(&[self.row, self.col])?;
        let (c0, c1) = tree.range(self.col);
        let xmask = Mask::new(c0, c1, 0, x.ncols());
        let mut y = DenseBlock::zeros(self.nrows(tree), x.ncols());
        let ymask = y.size();

        match &self.block {
            Block::Empty => (),
            Block::Dense(mat) => {
                add_mul(mat, mat.size(), Op::NoTrans, x, xmask, Op::NoTrans, &mut y, ymask)?;
            }
            Block::LowRank { lhs, rhs } => {
                let s = dense::mul(rhs, rhs.size(), Op::Trans, x, xmask, Op::NoTrans)?;
                add_mul(lhs, lhs.size(), Op::NoTrans, &s, s.size(), Op::NoTrans, &mut y, ymask)?;
            }
        }
        Ok(y)
    }

    /// Accumulate `y += A x` on global indices.
    pub fn apply(&self, tree: &ClusterTree, x: &DenseBlock<A>, y: &mut DenseBlock<A>) -> Result<()> {
        tree.check_nodes(&[self.row, self.col])?;
        let (r0, r1) = tree.range(self.row);
        let (c0, c1) = tree.range(self.col);
        let ymask = Mask::new(r0, r1, 0, y.ncols());
        let xmask = Mask::new(c0, c1, 0, x.ncols());

        match &self.block {
            Block::Empty => Ok(()),
            Block::Dense(mat) => add_mul(mat, mat.size(), Op::NoTrans, x, xmask, Op::NoTrans, y, ymask),
            Block::LowRank { lhs, rhs } => {
                let s = dense::mul(rhs, rhs.size(), Op::Trans, x, xmask, Op::NoTrans)?;
                add_mul(lhs, lhs.size(), Op::NoTrans, &s, s.size(), Op::NoTrans, y, ymask)
            }
        }
    }
}

impl<A: ScalarType> Neg for &SubMatrix<A> {
    type Output = SubMatrix<A>;

    fn neg(self) -> SubMatrix<A> {
        let block = match &self.block {
            Block::Empty => Block::Empty,
            Block::Dense(mat) => Block::Dense(-mat),
            Block::LowRank { lhs, rhs } => Block::LowRank {
                lhs: -lhs,
                rhs: rhs.clone(),
            },
        };
        SubMatrix {
            row: self.row,
            col: self.col,
            block,
        }
    }
}

impl<A: ScalarType> Neg for SubMatrix<A> {
    type Output = SubMatrix<A>;

    fn neg(self) -> SubMatrix<A> {
        -&self
    }
}

/// Product `C(i, j) = A(i, k) * B(k, j)` of two submatrices.
///
/// `i`, `j`, `k` are sub-clusters of the clusters the operands are stored
/// for. For two low-rank operands the inner factor is merged into the side
/// that keeps the smaller rank.
pub fn mul<A: ScalarType>(
    tree: &ClusterTree,
    a: &SubMatrix<A>,
    b: &SubMatrix<A>,
    i: usize,
    j: usize,
    k: usize,
) -> Result<SubMatrix<A>> {
    match (&a.block, &b.block) {
        (Block::Empty, _) | (_, Block::Empty) => Ok(SubMatrix::empty(i, j)),
        (Block::Dense(da), Block::Dense(db)) => Ok(SubMatrix::dense(
            i,
            j,
            dense::mul(
                da,
                a.size(tree, i, k)?,
                Op::NoTrans,
                db,
                b.size(tree, k, j)?,
                Op::NoTrans,
            )?,
        )),
        (Block::Dense(da), Block::LowRank { lhs, rhs }) => Ok(SubMatrix::low_rank(
            i,
            j,
            dense::mul(
                da,
                a.size(tree, i, k)?,
                Op::NoTrans,
                lhs,
                b.lsize(tree, k)?,
                Op::NoTrans,
            )?,
            rhs.mask(b.rsize(tree, j)?)?,
        )),
        (Block::LowRank { lhs, rhs }, Block::Dense(db)) => Ok(SubMatrix::low_rank(
            i,
            j,
            lhs.mask(a.lsize(tree, i)?)?,
            dense::mul(
                db,
                b.size(tree, k, j)?,
                Op::Trans,
                rhs,
                a.rsize(tree, k)?,
                Op::NoTrans,
            )?,
        )),
        (Block::LowRank { lhs: la, rhs: ra }, Block::LowRank { lhs: lb, rhs: rb }) => {
            let s = dense::mul(
                ra,
                a.rsize(tree, k)?,
                Op::Trans,
                lb,
                b.lsize(tree, k)?,
                Op::NoTrans,
            )?;
            if s.nrows() > s.ncols() {
                Ok(SubMatrix::low_rank(
                    i,
                    j,
                    dense::mul(la, a.lsize(tree, i)?, Op::NoTrans, &s, s.size(), Op::NoTrans)?,
                    rb.mask(b.rsize(tree, j)?)?,
                ))
            } else {
                Ok(SubMatrix::low_rank(
                    i,
                    j,
                    la.mask(a.lsize(tree, i)?)?,
                    dense::mul(rb, b.rsize(tree, j)?, Op::NoTrans, &s, s.size(), Op::Trans)?,
                ))
            }
        }
    }
}

/// Assemble a grid of submatrices into one submatrix for `(row, col)`.
///
/// `grid[p][q]` belongs to the `p`-th son of `row` and the `q`-th son of
/// `col` (the cluster itself for a leaf). All cells take the format of the
/// first non-empty cell. Low-rank factors are padded block diagonally, so
/// the rank of the result is the sum of the cell ranks.
pub fn cat<A: ScalarType>(
    ctx: &Context,
    grid: &[Vec<SubMatrix<A>>],
    row: usize,
    col: usize,
) -> Result<SubMatrix<A>> {
    let tree = ctx.tree;
    tree.check_nodes(&[row, col])?;
    let rows = tree.sons(row);
    let cols = tree.sons(col);

    if grid.len() != rows.len() || grid.iter().any(|cells| cells.len() != cols.len()) {
        return Err(RustyHMatrixError::ShapeMismatch(format!(
            "grid does not match the sons of ({}, {})",
            row, col
        )));
    }

    let format = match grid.iter().flatten().find_map(|cell| cell.format()) {
        Some(format) => format,
        None => return Ok(SubMatrix::empty(row, col)),
    };

    let mut cells = Vec::with_capacity(rows.len());
    for (p, grid_row) in grid.iter().enumerate() {
        let mut converted = Vec::with_capacity(cols.len());
        for (q, cell) in grid_row.iter().enumerate() {
            if cell.key() != (rows[p], cols[q]) {
                return Err(RustyHMatrixError::ShapeMismatch(format!(
                    "cell ({}, {}) of grid for ({}, {}) holds pair {:?}",
                    p,
                    q,
                    row,
                    col,
                    cell.key()
                )));
            }
            converted.push(cell.convert(ctx, format)?);
        }
        cells.push(converted);
    }

    match format {
        Format::Dense => {
            let blocks: Vec<Vec<&DenseBlock<A>>> = cells
                .iter()
                .map(|cells_row| {
                    cells_row
                        .iter()
                        .filter_map(|cell| match &cell.block {
                            Block::Dense(mat) => Some(mat),
                            _ => None,
                        })
                        .collect()
                })
                .collect();
            Ok(SubMatrix::dense(row, col, dense::cat_grid(&blocks)?))
        }
        Format::LowRank => {
            let total_rank: usize = cells.iter().flatten().filter_map(|cell| cell.rank()).sum();
            let mut lhs = DenseBlock::zeros(tree.size(row), total_rank);
            let mut rhs = DenseBlock::zeros(tree.size(col), total_rank);

            let mut offset = 0;
            for (p, cells_row) in cells.iter().enumerate() {
                let (r0, r1) = tree.range_relative(rows[p], row)?;
                for (q, cell) in cells_row.iter().enumerate() {
                    let (c0, c1) = tree.range_relative(cols[q], col)?;
                    if let Block::LowRank { lhs: l, rhs: r } = &cell.block {
                        let rank = l.ncols();
                        lhs.copy_masked(Mask::new(r0, r1, offset, offset + rank), l, l.size())?;
                        rhs.copy_masked(Mask::new(c0, c1, offset, offset + rank), r, r.size())?;
                        offset += rank;
                    }
                }
            }
            Ok(SubMatrix::low_rank(row, col, lhs, rhs))
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::cluster_tree::test_trees::{cauchy_tree, line_tree};
    use crate::helpers::RelDiff;
    use crate::options::Options;
    use crate::random_matrix::RandomMatrix;
    use crate::types::{c32, c64};

    fn random_low_rank<A: ScalarType + RandomMatrix>(
        row: usize,
        col: usize,
        tree: &ClusterTree,
        rank: usize,
    ) -> SubMatrix<A> {
        let mut rng = rand::thread_rng();
        SubMatrix::low_rank(
            row,
            col,
            DenseBlock::from_array(A::random_gaussian((tree.size(row), rank), &mut rng)),
            DenseBlock::from_array(A::random_gaussian((tree.size(col), rank), &mut rng)),
        )
    }

    fn random_dense<A: ScalarType + RandomMatrix>(
        row: usize,
        col: usize,
        tree: &ClusterTree,
    ) -> SubMatrix<A> {
        let mut rng = rand::thread_rng();
        SubMatrix::dense(
            row,
            col,
            DenseBlock::from_array(A::random_gaussian(
                (tree.size(row), tree.size(col)),
                &mut rng,
            )),
        )
    }

    macro_rules! mul_tests {

        ($($name:ident: $scalar:ty, $tol:expr,)*) => {

            $(

        #[test]
        fn $name() {
            // Sub-cluster products of all four format combinations on the root pair.
            let tree = cauchy_tree();
            let (i, j, k) = (1, 2, 2);

            let operands = vec![
                random_dense::<$scalar>(0, 0, &tree),
                random_low_rank::<$scalar>(0, 0, &tree, 2),
                random_low_rank::<$scalar>(0, 0, &tree, 5),
            ];

            for a in operands.iter() {
                for b in operands.iter() {
                    let expected = {
                        let da = a.to_dense(&tree).unwrap();
                        let db = b.to_dense(&tree).unwrap();
                        dense::mul(
                            &da, a.size(&tree, i, k).unwrap(), Op::NoTrans,
                            &db, b.size(&tree, k, j).unwrap(), Op::NoTrans,
                        ).unwrap()
                    };
                    let prod = mul(&tree, a, b, i, j, k).unwrap();
                    assert_eq!(prod.key(), (i, j));
                    assert!(prod.to_dense(&tree).unwrap().view().rel_diff(expected.view()) < $tol);

                    if let (Some(ra), Some(rb)) = (a.rank(), b.rank()) {
                        assert_eq!(prod.rank(), Some(std::cmp::min(ra, rb)));
                    }
                }
            }
        }

            )*

        }
    }

    mul_tests! {
        test_mul_f32: f32, 1E-5,
        test_mul_f64: f64, 1E-12,
        test_mul_c32: c32, 1E-5,
        test_mul_c64: c64, 1E-12,
    }

    #[test]
    fn test_convert_round_trip() {
        let tree = line_tree(16, 4);
        let ctx = Context::new(&tree, Options::default());
        let kernel = |i: usize, j: usize| 1.0 / (1.0 + (i as f64 - j as f64).abs());
        // Clusters 3 = [0, 4) and 6 = [12, 16) are separated.
        let block = crate::aca::KernelBlock::new(&kernel, tree.range(3), tree.range(6)).to_dense();
        let sub = SubMatrix::dense(3, 6, block.clone());

        let low = sub.convert(&ctx, Format::LowRank).unwrap();
        assert_eq!(low.format(), Some(Format::LowRank));
        let back = low.convert(&ctx, Format::Dense).unwrap();
        assert!(back.to_dense(&tree).unwrap().view().rel_diff(block.view()) < 1E-5);
        let again = back.convert(&ctx, Format::LowRank).unwrap();
        assert!(again.rank() <= Some(4));
        assert!(again
            .to_dense(&tree)
            .unwrap()
            .view()
            .rel_diff(low.to_dense(&tree).unwrap().view())
            < 1E-5);

        let empty = SubMatrix::<f64>::empty(3, 6).convert(&ctx, Format::LowRank).unwrap();
        assert_eq!(empty.rank(), Some(0));
    }

    #[test]
    fn test_compressing_accumulation() {
        let tree = cauchy_tree();
        let ctx = Context::new(&tree, Options::new(1E-10, 50).unwrap());

        let a = random_low_rank::<f64>(1, 2, &tree, 1);
        let b = random_low_rank::<f64>(1, 2, &tree, 1);
        let expected = {
            let mut sum = a.to_dense(&tree).unwrap();
            sum += &b.to_dense(&tree).unwrap();
            sum
        };

        let sum = SubMatrix::add(&ctx, &a, &b).unwrap();
        assert_eq!(sum.rank(), Some(2));
        assert!(sum.to_dense(&tree).unwrap().view().rel_diff(expected.view()) < 1E-10);

        // a + a keeps rank one after recompression
        let twice = SubMatrix::add(&ctx, &a, &a).unwrap();
        assert_eq!(twice.rank(), Some(1));

        // a - a vanishes
        let zero = SubMatrix::sub(&ctx, &a, &a).unwrap();
        assert_eq!(zero.rank(), Some(0));

        // dense += low-rank
        let mut d = random_dense::<f64>(1, 2, &tree);
        let mut expected = d.to_dense(&tree).unwrap();
        expected += &a.to_dense(&tree).unwrap();
        d.add_assign(&ctx, &a).unwrap();
        assert!(d.to_dense(&tree).unwrap().view().rel_diff(expected.view()) < 1E-12);

        // empty += x becomes x
        let mut e = SubMatrix::empty(1, 2);
        e.add_assign(&ctx, &a).unwrap();
        assert_eq!(e, a);

        // mismatched cluster sizes
        let mut root = random_dense::<f64>(0, 0, &tree);
        assert!(root.add_assign(&ctx, &a).is_err());
    }

    #[test]
    fn test_restrict_and_cat() {
        let tree = cauchy_tree();
        let ctx = Context::new(&tree, Options::default());

        for a in vec![
            random_dense::<c64>(0, 0, &tree),
            random_low_rank::<c64>(0, 0, &tree, 3),
        ] {
            let grid: Vec<Vec<SubMatrix<c64>>> = tree
                .sons(0)
                .iter()
                .map(|&r| {
                    tree.sons(0)
                        .iter()
                        .map(|&c| a.restrict(&tree, r, c).unwrap())
                        .collect()
                })
                .collect();
            let whole = cat(&ctx, &grid, 0, 0).unwrap();
            assert_eq!(whole.format(), a.format());
            assert!(
                whole.to_dense(&tree).unwrap().view().rel_diff(a.to_dense(&tree).unwrap().view())
                    < 1E-12
            );
            if let Some(rank) = a.rank() {
                assert_eq!(whole.rank(), Some(4 * rank));
            }
        }

        // Column grid for a leaf row cluster.
        let left = random_dense::<f64>(1, 1, &tree);
        let right = SubMatrix::empty(1, 2);
        let joined = cat(&ctx, &[vec![left.clone(), right]], 1, 0).unwrap();
        let dense = joined.to_dense(&tree).unwrap();
        assert_eq!(dense.shape(), (4, 8));
        assert_eq!(dense[(2, 3)], left.to_dense(&tree).unwrap()[(2, 3)]);
        assert_eq!(dense[(2, 7)], 0.0);

        assert!(cat(&ctx, &[vec![left]], 1, 0).is_err());
    }

    #[test]
    fn test_apply() {
        let tree = cauchy_tree();
        let a = random_low_rank::<f64>(2, 1, &tree, 2);
        let x = DenseBlock::<f64>::from_elem(8, 2, 1.0);
        let mut y = DenseBlock::<f64>::zeros(8, 2);
        a.apply(&tree, &x, &mut y).unwrap();

        let dense = a.to_dense(&tree).unwrap();
        let local = a.mul_block(&tree, &x).unwrap();
        for i in 0..4 {
            let row_sum: f64 = (0..4).map(|j| dense[(i, j)]).sum();
            approx::assert_relative_eq!(y[(4 + i, 0)], row_sum, epsilon = 1E-12);
            approx::assert_relative_eq!(local[(i, 1)], row_sum, epsilon = 1E-12);
            assert_eq!(y[(i, 1)], 0.0);
        }

        let neg = -&a;
        let mut z = y.clone();
        neg.apply(&tree, &x, &mut z).unwrap();
        assert!(z.view().iter().all(|v| v.abs() < 1E-12));
    }
}
