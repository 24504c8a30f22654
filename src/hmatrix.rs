//! Hierarchical matrices.
//!
//! An [`HMatrix`] maps pairs of clusters to [`SubMatrix`] entries. In a
//! complete H-matrix the keys are exactly the admissible pairs reached from
//! `(0, 0)` by [`ClusterTree::admissible_pairs`], so that their index
//! ranges tile the full matrix.
//!
//! The block algorithms walk the cluster tree. Addition works pair by pair,
//! multiplication subdivides every operand that has no entry for the
//! requested pair, and inversion uses the recursive $2\times 2$ Schur
//! complement
//! $$
//! A^{-1} = \begin{bmatrix} Y + Y A_{01} S^{-1} A_{10} Y & -Y A_{01} S^{-1}\\\\
//! -S^{-1} A_{10} Y & S^{-1}\end{bmatrix},\quad Y = A_{00}^{-1},\ S = A_{11} - A_{10} Y A_{01}.
//! $$

use crate::aca::{aca, KernelBlock};
use crate::cluster_tree::{Admissibility, ClusterTree};
use crate::dense::{DenseBlock, Mask};
use crate::io::{read_block, read_index_table, write_block, write_index_table};
use crate::options::Context;
use crate::submatrix::{self, cat, Block, Format, SubMatrix};
use crate::traits::BlockSource;
use crate::types::{Result, RustyHMatrixError, ScalarType};
use itertools::iproduct;
use ndarray::{Array1, ArrayView1};
use std::collections::BTreeMap;
use std::io::{Read, Write};

#[derive(Clone, Debug, PartialEq)]
pub struct HMatrix<A: ScalarType> {
    blocks: BTreeMap<(usize, usize), SubMatrix<A>>,
}

impl<A: ScalarType> Default for HMatrix<A> {
    fn default() -> Self {
        HMatrix::new()
    }
}

impl<A: ScalarType> BlockSource<A> for HMatrix<A> {
    fn find(&self, row: usize, col: usize) -> Option<&SubMatrix<A>> {
        self.blocks.get(&(row, col))
    }
}

/// Entry `(row, col)` of a block source, or a structural error.
pub(crate) fn require<'a, A: ScalarType>(
    source: &'a dyn BlockSource<A>,
    row: usize,
    col: usize,
) -> Result<&'a SubMatrix<A>> {
    source
        .find(row, col)
        .ok_or(RustyHMatrixError::MissingBlock { row, col })
}

impl<A: ScalarType> HMatrix<A> {
    pub fn new() -> Self {
        HMatrix {
            blocks: BTreeMap::new(),
        }
    }

    /// Number of stored submatrices.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn find(&self, row: usize, col: usize) -> Option<&SubMatrix<A>> {
        self.blocks.get(&(row, col))
    }

    pub fn find_mut(&mut self, row: usize, col: usize) -> Option<&mut SubMatrix<A>> {
        self.blocks.get_mut(&(row, col))
    }

    /// Store a submatrix under its own key, returning the entry it replaces.
    pub fn insert(&mut self, sub: SubMatrix<A>) -> Option<SubMatrix<A>> {
        self.blocks.insert(sub.key(), sub)
    }

    pub fn remove(&mut self, row: usize, col: usize) -> Option<SubMatrix<A>> {
        self.blocks.remove(&(row, col))
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Submatrices in key order.
    pub fn iter(&self) -> impl Iterator<Item = &SubMatrix<A>> {
        self.blocks.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &(usize, usize)> {
        self.blocks.keys()
    }

    /// Compressing accumulation of `sub` into the entry with the same key.
    pub fn accumulate(&mut self, ctx: &Context, sub: SubMatrix<A>) -> Result<()> {
        match self.blocks.get_mut(&sub.key()) {
            Some(entry) => entry.add_assign(ctx, &sub),
            None => {
                self.blocks.insert(sub.key(), sub);
                Ok(())
            }
        }
    }

    /// Accumulate all entries of `other`.
    pub fn merge(&mut self, ctx: &Context, other: HMatrix<A>) -> Result<()> {
        for (_, sub) in other.blocks {
            self.accumulate(ctx, sub)?;
        }
        Ok(())
    }

    /// H-matrix from lists of dense blocks and low-rank factor pairs.
    pub fn from_blocks(
        tree: &ClusterTree,
        dense: Vec<((usize, usize), DenseBlock<A>)>,
        low_rank: Vec<((usize, usize), (DenseBlock<A>, DenseBlock<A>))>,
    ) -> Result<Self> {
        let mut hmat = HMatrix::new();
        let subs = dense
            .into_iter()
            .map(|((row, col), mat)| SubMatrix::dense(row, col, mat))
            .chain(
                low_rank
                    .into_iter()
                    .map(|((row, col), (lhs, rhs))| SubMatrix::low_rank(row, col, lhs, rhs)),
            );

        for sub in subs {
            if sub.row() >= tree.len() || sub.col() >= tree.len() {
                return Err(RustyHMatrixError::InvalidTree(format!(
                    "pair {:?} refers to unknown clusters",
                    sub.key()
                )));
            }
            sub.check_shape(tree)?;
            if let Some(old) = hmat.insert(sub) {
                return Err(RustyHMatrixError::InvalidTree(format!(
                    "pair {:?} given twice",
                    old.key()
                )));
            }
        }
        Ok(hmat)
    }

    /// Assemble an H-matrix from a kernel `k(i, j)` on global indices.
    ///
    /// Dense pairs are evaluated entry by entry, low-rank pairs are
    /// compressed with ACA. A low-rank pair whose factors would need at
    /// least as many scalars as the dense block is stored dense.
    pub fn from_kernel<K>(ctx: &Context, kernel: &K) -> Result<Self>
    where
        K: Fn(usize, usize) -> A,
    {
        let tree = ctx.tree;
        let mut hmat = HMatrix::new();

        for (row, col) in tree.admissible_pairs(0, 0)? {
            let gen = KernelBlock::new(kernel, tree.range(row), tree.range(col));
            let sub = match tree.admissibility(row, col) {
                Admissibility::Dense => SubMatrix::dense(row, col, gen.to_dense()),
                Admissibility::LowRank => {
                    let (lhs, rhs) = aca(&gen, ctx.tol(), ctx.max_rank())?;
                    let (m, n) = (tree.size(row), tree.size(col));
                    if lhs.ncols() * (m + n) < m * n {
                        SubMatrix::low_rank(row, col, lhs, rhs)
                    } else {
                        SubMatrix::dense(row, col, gen.to_dense())
                    }
                }
                Admissibility::Unset => {
                    return Err(RustyHMatrixError::InvalidTree(format!(
                        "pair ({}, {}) is not admissible",
                        row, col
                    )))
                }
            };
            hmat.insert(sub);
        }

        log::debug!(
            "Assembled H-matrix with {} blocks, maximum rank {}.",
            hmat.len(),
            hmat.max_rank()
        );
        Ok(hmat)
    }

    /// Check that the keys are exactly the admissible pairs of the tree and
    /// that all blocks have the cluster sizes.
    pub fn validate(&self, tree: &ClusterTree) -> Result<()> {
        let pairs = tree.admissible_pairs(0, 0)?;
        for &(row, col) in pairs.iter() {
            require(self, row, col)?.check_shape(tree)?;
        }
        if self.len() != pairs.len() {
            let expected: std::collections::HashSet<_> = pairs.into_iter().collect();
            if let Some(key) = self.keys().find(|&key| !expected.contains(key)) {
                return Err(RustyHMatrixError::InvalidTree(format!(
                    "pair {:?} is not part of the partition",
                    key
                )));
            }
        }
        Ok(())
    }

    /// Expand into a dense matrix.
    pub fn to_dense(&self, tree: &ClusterTree) -> Result<DenseBlock<A>> {
        let n = tree.num_indices();
        let mut full = DenseBlock::zeros(n, n);
        for sub in self.iter() {
            let block = sub.to_dense(tree)?;
            let mask = Mask::from_ranges(tree.range(sub.row()), tree.range(sub.col()));
            full.copy_masked(mask, &block, block.size())?;
        }
        Ok(full)
    }

    /// Product `y = A x` with a block of right-hand sides.
    pub fn apply(&self, tree: &ClusterTree, x: &DenseBlock<A>) -> Result<DenseBlock<A>> {
        let n = tree.num_indices();
        if x.nrows() != n {
            return Err(RustyHMatrixError::ShapeMismatch(format!(
                "cannot apply H-matrix of order {} to {} rows",
                n,
                x.nrows()
            )));
        }
        let mut y = DenseBlock::zeros(n, x.ncols());
        for sub in self.iter() {
            sub.apply(tree, x, &mut y)?;
        }
        Ok(y)
    }

    /// Product `y = A x` with a vector.
    pub fn apply_vec(&self, tree: &ClusterTree, x: ArrayView1<A>) -> Result<Array1<A>> {
        let x = DenseBlock::from_column_major(x.len(), 1, x.to_vec())?;
        let y = self.apply(tree, &x)?;
        Ok(y.column(0).to_owned())
    }

    /// Largest rank of the low-rank entries.
    pub fn max_rank(&self) -> usize {
        self.iter().filter_map(|sub| sub.rank()).max().unwrap_or(0)
    }

    /// Number of stored scalars.
    pub fn storage(&self) -> usize {
        self.iter().map(|sub| sub.storage()).sum()
    }

    /// Stored scalars relative to the dense matrix.
    pub fn compression_ratio(&self, tree: &ClusterTree) -> f64 {
        let n = tree.num_indices();
        if n == 0 {
            return 0.0;
        }
        self.storage() as f64 / (n * n) as f64
    }

    /// Write the dense entries (keys, then blocks) followed by the low-rank
    /// entries (keys, then `lhs` and `rhs` per entry).
    pub fn write<W: Write>(&self, tree: &ClusterTree, writer: &mut W) -> Result<()> {
        let mut dense = Vec::new();
        let mut low_rank = Vec::new();

        for sub in self.iter() {
            let format = sub
                .format()
                .or_else(|| Format::from_admissibility(tree.admissibility(sub.row(), sub.col())))
                .ok_or_else(|| {
                    RustyHMatrixError::InvalidTree(format!(
                        "empty entry {:?} has no admissibility",
                        sub.key()
                    ))
                })?;
            let ctx = Context::new(tree, Default::default());
            let stored = sub.convert(&ctx, format)?;
            match format {
                Format::Dense => dense.push(stored),
                Format::LowRank => low_rank.push(stored),
            }
        }

        let keys: Vec<_> = dense.iter().map(|sub| sub.key()).collect();
        write_index_table(writer, &keys)?;
        for sub in dense.iter() {
            if let Block::Dense(mat) = sub.block() {
                write_block(writer, mat)?;
            }
        }

        let keys: Vec<_> = low_rank.iter().map(|sub| sub.key()).collect();
        write_index_table(writer, &keys)?;
        for sub in low_rank.iter() {
            if let Block::LowRank { lhs, rhs } = sub.block() {
                write_block(writer, lhs)?;
                write_block(writer, rhs)?;
            }
        }
        Ok(())
    }

    /// Read an H-matrix written by [`HMatrix::write`] for the given tree.
    ///
    /// Dense entries may sit on low-rank pairs, low-rank entries only on
    /// low-rank pairs.
    pub fn read<R: Read>(tree: &ClusterTree, reader: &mut R) -> Result<Self> {
        let check = |row: usize, col: usize, format: Format| {
            let adm = if row < tree.len() && col < tree.len() {
                tree.admissibility(row, col)
            } else {
                Admissibility::Unset
            };
            let ok = match format {
                Format::Dense => adm != Admissibility::Unset,
                Format::LowRank => adm == Admissibility::LowRank,
            };
            if ok {
                Ok(())
            } else {
                Err(RustyHMatrixError::InvalidTree(format!(
                    "stored {:?} pair ({}, {}) has admissibility {:?}",
                    format, row, col, adm
                )))
            }
        };

        let mut dense = Vec::new();
        for (row, col) in read_index_table(reader)? {
            check(row, col, Format::Dense)?;
            dense.push(((row, col), read_block(reader)?));
        }

        let mut low_rank = Vec::new();
        for (row, col) in read_index_table(reader)? {
            check(row, col, Format::LowRank)?;
            let lhs = read_block(reader)?;
            let rhs = read_block(reader)?;
            low_rank.push(((row, col), (lhs, rhs)));
        }

        let hmat = HMatrix::from_blocks(tree, dense, low_rank)?;
        hmat.validate(tree)?;
        Ok(hmat)
    }
}

/// Copy of the entries below `(i, j)`.
pub fn copy<A: ScalarType>(ctx: &Context, a: &HMatrix<A>, i: usize, j: usize) -> Result<HMatrix<A>> {
    let mut b = HMatrix::new();
    for (row, col) in ctx.tree.admissible_pairs(i, j)? {
        b.insert(require(a, row, col)?.clone());
    }
    Ok(b)
}

/// Negated entries below `(i, j)`.
pub fn uminus<A: ScalarType>(
    ctx: &Context,
    a: &HMatrix<A>,
    i: usize,
    j: usize,
) -> Result<HMatrix<A>> {
    let mut b = HMatrix::new();
    for (row, col) in ctx.tree.admissible_pairs(i, j)? {
        let sub: &SubMatrix<A> = require(a, row, col)?;
        b.insert(-sub);
    }
    Ok(b)
}

/// `A + B` on the entries below `(i, j)`.
pub fn add<A: ScalarType>(
    ctx: &Context,
    a: &HMatrix<A>,
    b: &HMatrix<A>,
    i: usize,
    j: usize,
) -> Result<HMatrix<A>> {
    let mut c = HMatrix::new();
    for (row, col) in ctx.tree.admissible_pairs(i, j)? {
        c.insert(SubMatrix::add(ctx, require(a, row, col)?, require(b, row, col)?)?);
    }
    Ok(c)
}

/// `C += A + B` on the entries below `(i, j)`.
pub fn add_to<A: ScalarType>(
    ctx: &Context,
    a: &HMatrix<A>,
    b: &HMatrix<A>,
    c: &mut HMatrix<A>,
    i: usize,
    j: usize,
) -> Result<()> {
    for (row, col) in ctx.tree.admissible_pairs(i, j)? {
        let sum = SubMatrix::add(ctx, require(a, row, col)?, require(b, row, col)?)?;
        c.accumulate(ctx, sum)?;
    }
    Ok(())
}

/// `C += A` on the entries below `(i, j)`.
pub fn add_into<A: ScalarType>(
    ctx: &Context,
    a: &HMatrix<A>,
    c: &mut HMatrix<A>,
    i: usize,
    j: usize,
) -> Result<()> {
    for (row, col) in ctx.tree.admissible_pairs(i, j)? {
        c.accumulate(ctx, require(a, row, col)?.clone())?;
    }
    Ok(())
}

/// `A - B` on the entries below `(i, j)`.
pub fn subtract<A: ScalarType>(
    ctx: &Context,
    a: &HMatrix<A>,
    b: &HMatrix<A>,
    i: usize,
    j: usize,
) -> Result<HMatrix<A>> {
    let mut c = HMatrix::new();
    for (row, col) in ctx.tree.admissible_pairs(i, j)? {
        c.insert(SubMatrix::sub(ctx, require(a, row, col)?, require(b, row, col)?)?);
    }
    Ok(c)
}

/// Product `C(i, j) = A(i, k) B(k, j)` as new H-matrix.
pub fn mul<A: ScalarType>(
    ctx: &Context,
    a: &dyn BlockSource<A>,
    b: &dyn BlockSource<A>,
    i: usize,
    j: usize,
    k: usize,
) -> Result<HMatrix<A>> {
    let mut c = HMatrix::new();
    add_mul(ctx, a, b, &mut c, i, j, k)?;
    Ok(c)
}

/// Accumulate `C(i, j) += A(i, k) B(k, j)` into the H-matrix `C`.
///
/// `C` is subdivided until its pairs are admissible. Operands without an
/// entry for the requested pair are subdivided alongside, a stored entry
/// that covers the pair is masked instead.
pub fn add_mul<A: ScalarType>(
    ctx: &Context,
    a: &dyn BlockSource<A>,
    b: &dyn BlockSource<A>,
    c: &mut HMatrix<A>,
    i: usize,
    j: usize,
    k: usize,
) -> Result<()> {
    let tree = ctx.tree;
    tree.check_nodes(&[i, j, k])?;
    let pa = a.find(i, k);
    let pb = b.find(k, j);
    let ad = tree.admissibility(i, j);

    if !ad.is_admissible() {
        if tree.is_leaf(i) && tree.is_leaf(j) {
            return Err(RustyHMatrixError::InvalidTree(format!(
                "leaf pair ({}, {}) has no admissibility",
                i, j
            )));
        }
        let a_next: &dyn BlockSource<A> = match pa {
            Some(sub) => sub,
            None => a,
        };
        let b_next: &dyn BlockSource<A> = match pb {
            Some(sub) => sub,
            None => b,
        };
        for (&ii, &jj, &kk) in iproduct!(tree.sons(i), tree.sons(j), tree.sons(k)) {
            add_mul(ctx, a_next, b_next, c, ii, jj, kk)?;
        }
        Ok(())
    } else if let (Some(sa), Some(sb)) = (pa, pb) {
        let prod = submatrix::mul(tree, sa, sb, i, j, k)?.into_admissibility(ctx, ad)?;
        c.accumulate(ctx, prod)
    } else {
        let format = Format::from_admissibility(ad).unwrap_or(Format::Dense);
        let prod = add_mul_block(ctx, a, b, i, j, k, format)?;
        c.accumulate(ctx, prod)
    }
}

/// Product `A(i, k) B(k, j)` assembled into a single submatrix of the
/// given format.
pub fn add_mul_block<A: ScalarType>(
    ctx: &Context,
    a: &dyn BlockSource<A>,
    b: &dyn BlockSource<A>,
    i: usize,
    j: usize,
    k: usize,
    format: Format,
) -> Result<SubMatrix<A>> {
    let tree = ctx.tree;
    tree.check_nodes(&[i, j, k])?;
    let pa = a.find(i, k);
    let pb = b.find(k, j);

    if let (Some(sa), Some(sb)) = (pa, pb) {
        let prod = submatrix::mul(tree, sa, sb, i, j, k)?;
        return if prod.is_empty() {
            Ok(prod)
        } else {
            prod.convert(ctx, format)
        };
    }

    if tree.is_leaf(i) && tree.is_leaf(j) && tree.is_leaf(k) {
        let (row, col) = if pa.is_none() { (i, k) } else { (k, j) };
        return Err(RustyHMatrixError::MissingBlock { row, col });
    }

    let a_next: &dyn BlockSource<A> = match pa {
        Some(sub) => sub,
        None => a,
    };
    let b_next: &dyn BlockSource<A> = match pb {
        Some(sub) => sub,
        None => b,
    };

    let rows = tree.sons(i);
    let cols = tree.sons(j);
    let mut grid: Vec<Vec<SubMatrix<A>>> = rows
        .iter()
        .map(|&ii| cols.iter().map(|&jj| SubMatrix::empty(ii, jj)).collect())
        .collect();

    for (p, &ii) in rows.iter().enumerate() {
        for (q, &jj) in cols.iter().enumerate() {
            for &kk in tree.sons(k) {
                let prod = add_mul_block(ctx, a_next, b_next, ii, jj, kk, format)?;
                grid[p][q].add_assign(ctx, &prod)?;
            }
        }
    }

    let mut result = cat(ctx, &grid, i, j)?;
    result.truncate(ctx)?;
    Ok(result)
}

/// Inverse of the diagonal block `A(i, i)` by recursive Schur complements.
pub fn inv<A: ScalarType>(ctx: &Context, a: &HMatrix<A>, i: usize) -> Result<HMatrix<A>> {
    let tree = ctx.tree;
    tree.check_nodes(&[i])?;

    let (i0, i1) = match tree.children(i) {
        Some(sons) if !tree.admissibility(i, i).is_admissible() => sons,
        _ => {
            let block = require(a, i, i)?.to_dense(tree)?;
            let mut c = HMatrix::new();
            c.insert(SubMatrix::dense(i, i, block.inv()?));
            return Ok(c);
        }
    };

    // Y = inv(A00)
    let y = inv(ctx, a, i0)?;
    // S = A11 - A10 Y A01
    let ya = mul(ctx, &y, a, i0, i1, i0)?;
    let s = subtract(ctx, a, &mul(ctx, a, &ya, i1, i1, i0)?, i1, i1)?;
    // C11 = inv(S)
    let mut c = inv(ctx, &s, i1)?;

    // C00 = Y + Y A01 C11 A10 Y
    let ay = mul(ctx, a, &y, i1, i0, i0)?;
    let cay = mul(ctx, &c, &ay, i1, i0, i1)?;
    let acay = mul(ctx, a, &cay, i0, i0, i1)?;
    let t = mul(ctx, &y, &acay, i0, i0, i0)?;
    add_to(ctx, &y, &t, &mut c, i0, i0)?;

    // C01 = -Y A01 C11
    let neg_y = uminus(ctx, &y, i0, i0)?;
    let ac = mul(ctx, a, &c, i0, i1, i1)?;
    add_mul(ctx, &neg_y, &ac, &mut c, i0, i1, i0)?;

    // C10 = -C11 A10 Y
    let any = mul(ctx, a, &neg_y, i1, i0, i0)?;
    let c10 = mul(ctx, &c, &any, i1, i0, i1)?;
    c.merge(ctx, c10)?;

    Ok(c)
}

/// Inverse of a complete H-matrix.
pub fn inverse<A: ScalarType>(ctx: &Context, a: &HMatrix<A>) -> Result<HMatrix<A>> {
    log::debug!("Inverting H-matrix with {} blocks.", a.len());
    let c = inv(ctx, a, 0)?;
    log::debug!("Inverse has maximum rank {}.", c.max_rank());
    Ok(c)
}

/// Product of two complete H-matrices.
pub fn product<A: ScalarType>(ctx: &Context, a: &HMatrix<A>, b: &HMatrix<A>) -> Result<HMatrix<A>> {
    log::debug!("Multiplying H-matrices with {} and {} blocks.", a.len(), b.len());
    mul(ctx, a, b, 0, 0, 0)
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::cluster_tree::test_trees::{cauchy_tree, line_tree};
    use crate::dense::Op;
    use crate::helpers::RelDiff;
    use crate::options::Options;
    use crate::types::{c32, c64, scalar_from_f64};

    fn cauchy<A: ScalarType>(i: usize, j: usize) -> A {
        scalar_from_f64(1.0 / (1.0 + (i as f64 - j as f64).abs()))
    }

    /// Diagonally dominant kernel for inversion and LU.
    pub(crate) fn dominant_kernel<A: ScalarType>(n: usize) -> impl Fn(usize, usize) -> A {
        move |i, j| {
            if i == j {
                scalar_from_f64(n as f64)
            } else {
                cauchy(i, j)
            }
        }
    }

    #[test]
    fn test_cauchy_scenario() {
        let tree = cauchy_tree();
        let ctx = Context::new(&tree, Options::new(1E-6, 100).unwrap());
        let hmat = HMatrix::<f64>::from_kernel(&ctx, &cauchy::<f64>).unwrap();
        hmat.validate(&tree).unwrap();

        assert_eq!(hmat.len(), 4);
        assert!(hmat.max_rank() <= 4);
        assert!(hmat.storage() <= 64);
        assert!(hmat.find(1, 1).unwrap().rank().is_none());

        let ones = Array1::<f64>::ones(8);
        let y = hmat.apply_vec(&tree, ones.view()).unwrap();
        let expected = Array1::from_shape_fn(8, |i| (0..8).map(|j| cauchy::<f64>(i, j)).sum::<f64>());
        let err = (&y - &expected).iter().map(|v| v * v).sum::<f64>().sqrt()
            / expected.iter().map(|v| v * v).sum::<f64>().sqrt();
        assert!(err < 1E-6);
    }

    macro_rules! apply_tests {

        ($($name:ident: $scalar:ty, $tol:expr,)*) => {

            $(

        #[test]
        fn $name() {
            // Trees of depth one to four.
            for &n in &[8, 16, 32, 64] {
                let tree = line_tree(n, 4);
                let ctx = Context::new(&tree, Options::new(1E-6, 50).unwrap());
                let hmat = HMatrix::<$scalar>::from_kernel(&ctx, &cauchy::<$scalar>).unwrap();
                hmat.validate(&tree).unwrap();

                let x = DenseBlock::from_shape_fn(n, 3, |(i, j)| cauchy::<$scalar>(i, 2 * j));
                let y = hmat.apply(&tree, &x).unwrap();

                let full = hmat.to_dense(&tree).unwrap();
                let expected = crate::dense::mul(&full, full.size(), Op::NoTrans, &x, x.size(), Op::NoTrans).unwrap();
                assert!(y.view().rel_diff(expected.view()) < $tol);

                let exact = DenseBlock::from_shape_fn(n, n, |(i, j)| cauchy::<$scalar>(i, j));
                assert!(full.view().rel_diff(exact.view()) < 1E-4);
                assert!(hmat.compression_ratio(&tree) <= 1.0);
            }
        }

            )*

        }
    }

    apply_tests! {
        test_apply_f32: f32, 1E-5,
        test_apply_f64: f64, 1E-12,
        test_apply_c32: c32, 1E-5,
        test_apply_c64: c64, 1E-12,
    }

    #[test]
    fn test_assembly_stores_no_more_than_dense() {
        for &(n, leaf) in &[(8, 4), (16, 4), (64, 4), (64, 16)] {
            let tree = line_tree(n, leaf);
            let ctx = Context::new(&tree, Options::new(1E-10, 50).unwrap());
            let hmat = HMatrix::<f64>::from_kernel(&ctx, &cauchy::<f64>).unwrap();
            hmat.validate(&tree).unwrap();
            assert!(hmat.storage() <= n * n);

            for sub in hmat.iter() {
                let (m, k) = (tree.size(sub.row()), tree.size(sub.col()));
                if let Some(rank) = sub.rank() {
                    assert!(rank * (m + k) < m * k);
                }
            }
        }

        // Small admissible blocks at a tight tolerance fall back to dense
        // storage and survive a write/read cycle.
        let tree = cauchy_tree();
        let ctx = Context::new(&tree, Options::new(1E-12, 100).unwrap());
        let hmat = HMatrix::<f64>::from_kernel(&ctx, &cauchy::<f64>).unwrap();
        assert_eq!(tree.admissibility(1, 2), Admissibility::LowRank);
        assert!(hmat.find(1, 2).unwrap().rank().is_none());

        let mut buffer = Vec::<u8>::new();
        hmat.write(&tree, &mut buffer).unwrap();
        let restored = HMatrix::<f64>::read(&tree, &mut buffer.as_slice()).unwrap();
        assert_eq!(restored, hmat);
    }

    /// Clusters that do not overlap.
    fn disjoint(row: (usize, usize), col: (usize, usize)) -> bool {
        row.1 <= col.0 || col.1 <= row.0
    }

    /// `min(diam) <= eta * dist` with index distances.
    fn eta_admissible(eta: f64) -> impl Fn((usize, usize), (usize, usize)) -> bool {
        move |row, col| {
            let gap = if row.1 <= col.0 {
                col.0 - row.1
            } else if col.1 <= row.0 {
                row.0 - col.1
            } else {
                return false;
            };
            let diam = std::cmp::min(row.1 - row.0, col.1 - col.0);
            gap > 0 && diam as f64 <= eta * gap as f64
        }
    }

    #[test]
    fn test_apply_on_random_bisection_trees() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        for _ in 0..8 {
            let depth: u32 = rng.gen_range(1..=4);
            let leaf_size: usize = rng.gen_range(24..=32);
            let full = leaf_size * 2usize.pow(depth);
            let n = rng.gen_range(3 * full / 4..=full);
            let tree = if depth <= 2 {
                ClusterTree::bisection(n, leaf_size, disjoint)
            } else {
                ClusterTree::bisection(n, leaf_size, eta_admissible(rng.gen_range(0.5..2.0)))
            }
            .unwrap();

            let kernel = |i: usize, j: usize| 1.0 / (1.0 + (i as f64 - j as f64).abs() / n as f64);
            let ctx = Context::new(&tree, Options::new(1E-6, 50).unwrap());
            let hmat = HMatrix::<f64>::from_kernel(&ctx, &kernel).unwrap();
            hmat.validate(&tree).unwrap();

            let compressed = hmat.iter().any(|sub| match sub.rank() {
                Some(rank) => rank < std::cmp::min(tree.size(sub.row()), tree.size(sub.col())),
                None => false,
            });
            assert!(compressed);
            assert!(hmat.compression_ratio(&tree) < 1.0);

            let x = DenseBlock::from_shape_fn(n, 2, |(i, j)| ((i + 3 * j) % 7) as f64 - 3.0);
            let y = hmat.apply(&tree, &x).unwrap();
            let exact = DenseBlock::from_shape_fn(n, n, |(i, j)| kernel(i, j));
            let expected = &exact * &x;
            assert!(y.view().rel_diff(expected.view()) < 1E-4);
        }
    }

    #[test]
    fn test_add_subtract_uminus() {
        let tree = line_tree(32, 4);
        let ctx = Context::new(&tree, Options::new(1E-8, 50).unwrap());
        let a = HMatrix::<f64>::from_kernel(&ctx, &cauchy::<f64>).unwrap();
        let b = HMatrix::<f64>::from_kernel(&ctx, &dominant_kernel::<f64>(32)).unwrap();

        let dense_a = a.to_dense(&tree).unwrap();
        let dense_b = b.to_dense(&tree).unwrap();

        let sum = add(&ctx, &a, &b, 0, 0).unwrap();
        sum.validate(&tree).unwrap();
        let mut expected = dense_a.clone();
        expected += &dense_b;
        assert!(sum.to_dense(&tree).unwrap().view().rel_diff(expected.view()) < 1E-7);

        let diff = subtract(&ctx, &b, &a, 0, 0).unwrap();
        let mut expected = dense_b.clone();
        expected -= &dense_a;
        assert!(diff.to_dense(&tree).unwrap().view().rel_diff(expected.view()) < 1E-7);

        let neg = uminus(&ctx, &a, 0, 0).unwrap();
        assert_eq!(neg.to_dense(&tree).unwrap(), -&dense_a);

        let mut acc = copy(&ctx, &a, 0, 0).unwrap();
        add_to(&ctx, &a, &neg, &mut acc, 0, 0).unwrap();
        assert!(acc.to_dense(&tree).unwrap().view().rel_diff(dense_a.view()) < 1E-7);

        add_into(&ctx, &b, &mut acc, 0, 0).unwrap();
        let mut expected = dense_a.clone();
        expected += &dense_b;
        assert!(acc.to_dense(&tree).unwrap().view().rel_diff(expected.view()) < 1E-7);

        // Restricted to a sub-pair.
        let part = copy(&ctx, &a, 1, 2).unwrap();
        assert_eq!(part.len(), tree.admissible_pairs(1, 2).unwrap().len());
    }

    macro_rules! mul_tests {

        ($($name:ident: $scalar:ty, $opts_tol:expr, $tol:expr,)*) => {

            $(

        #[test]
        fn $name() {
            let n = 32;
            let tree = line_tree(n, 4);
            let ctx = Context::new(&tree, Options::new($opts_tol, 50).unwrap());
            let a = HMatrix::<$scalar>::from_kernel(&ctx, &cauchy::<$scalar>).unwrap();
            let b = HMatrix::<$scalar>::from_kernel(&ctx, &dominant_kernel::<$scalar>(n)).unwrap();

            let c = product(&ctx, &a, &b).unwrap();
            c.validate(&tree).unwrap();

            let da = a.to_dense(&tree).unwrap();
            let db = b.to_dense(&tree).unwrap();
            let expected = &da * &db;
            assert!(c.to_dense(&tree).unwrap().view().rel_diff(expected.view()) < $tol);
        }

            )*

        }
    }

    mul_tests! {
        test_mul_f32: f32, 1E-4, 1E-2,
        test_mul_f64: f64, 1E-8, 1E-6,
        test_mul_c32: c32, 1E-4, 1E-2,
        test_mul_c64: c64, 1E-8, 1E-6,
    }

    macro_rules! inverse_tests {

        ($($name:ident: $scalar:ty, $opts_tol:expr, $tol:expr,)*) => {

            $(

        #[test]
        fn $name() {
            for &n in &[16, 64] {
                let tree = line_tree(n, 4);
                let ctx = Context::new(&tree, Options::new($opts_tol, 50).unwrap());
                let a = HMatrix::<$scalar>::from_kernel(&ctx, &dominant_kernel::<$scalar>(n)).unwrap();

                let c = inverse(&ctx, &a).unwrap();
                c.validate(&tree).unwrap();

                let prod = &c.to_dense(&tree).unwrap() * &a.to_dense(&tree).unwrap();
                assert!(prod.view().rel_diff(DenseBlock::<$scalar>::eye(n).view()) < $tol);
            }
        }

            )*

        }
    }

    inverse_tests! {
        test_inverse_f32: f32, 1E-4, 1E-2,
        test_inverse_f64: f64, 1E-8, 1E-6,
        test_inverse_c32: c32, 1E-4, 1E-2,
        test_inverse_c64: c64, 1E-8, 1E-6,
    }

    #[test]
    fn test_complex_kernel_inverse() {
        let n = 32;
        let tree = line_tree(n, 4);
        let ctx = Context::new(&tree, Options::new(1E-8, 50).unwrap());
        let kernel = |i: usize, j: usize| {
            let d = (i as f64 - j as f64).abs();
            if i == j {
                c64::new(n as f64, 1.0)
            } else {
                c64::new(1.0 / (1.0 + d), 0.5 / (1.0 + d * d))
            }
        };
        let a = HMatrix::from_kernel(&ctx, &kernel).unwrap();
        let c = inverse(&ctx, &a).unwrap();
        let prod = &a.to_dense(&tree).unwrap() * &c.to_dense(&tree).unwrap();
        assert!(prod.view().rel_diff(DenseBlock::<c64>::eye(n).view()) < 1E-6);
    }

    #[test]
    fn test_structural_errors() {
        let tree = cauchy_tree();
        let ctx = Context::new(&tree, Options::default());
        let mut a = HMatrix::<f64>::from_kernel(&ctx, &cauchy::<f64>).unwrap();
        let b = a.clone();

        a.remove(2, 1);
        assert!(matches!(
            a.validate(&tree),
            Err(RustyHMatrixError::MissingBlock { row: 2, col: 1 })
        ));
        assert!(matches!(
            add(&ctx, &a, &b, 0, 0),
            Err(RustyHMatrixError::MissingBlock { row: 2, col: 1 })
        ));
        assert!(product(&ctx, &a, &b).is_err());
        assert!(inverse(&ctx, &a).is_err());

        let mut extra = b.clone();
        extra.insert(SubMatrix::dense(0, 0, DenseBlock::zeros(8, 8)));
        assert!(extra.validate(&tree).is_err());

        assert!(b.apply(&tree, &DenseBlock::zeros(7, 1)).is_err());

        // Unknown cluster ids are errors, not panics.
        assert!(matches!(
            copy(&ctx, &b, 99, 0),
            Err(RustyHMatrixError::InvalidTree(_))
        ));
        assert!(uminus(&ctx, &b, 0, 3).is_err());
        assert!(mul(&ctx, &b, &b, 0, 0, 7).is_err());
        assert!(add_mul_block(&ctx, &b, &b, 1, 2, 5, Format::LowRank).is_err());
        assert!(inv(&ctx, &b, 3).is_err());
        let mut stray = b.clone();
        stray.insert(SubMatrix::dense(5, 0, DenseBlock::zeros(1, 8)));
        assert!(stray.validate(&tree).is_err());
        assert!(stray.to_dense(&tree).is_err());
        assert!(stray.apply(&tree, &DenseBlock::zeros(8, 1)).is_err());
        assert!(HMatrix::<f64>::from_blocks(
            &tree,
            vec![((1, 1), DenseBlock::zeros(3, 4))],
            vec![]
        )
        .is_err());
    }

    #[test]
    fn test_persistence() {
        let tree = line_tree(32, 4);
        let ctx = Context::new(&tree, Options::default());
        let a = HMatrix::<c64>::from_kernel(&ctx, &cauchy::<c64>).unwrap();

        let mut buffer = Vec::<u8>::new();
        tree.write(&mut buffer).unwrap();
        a.write(&tree, &mut buffer).unwrap();

        let mut reader = buffer.as_slice();
        let restored_tree = ClusterTree::read(&mut reader).unwrap();
        let restored = HMatrix::<c64>::read(&restored_tree, &mut reader).unwrap();
        assert_eq!(restored, a);

        // Keys must match the admissibility of the tree.
        let mut buffer = Vec::<u8>::new();
        a.write(&tree, &mut buffer).unwrap();
        let other = line_tree(32, 8);
        assert!(HMatrix::<c64>::read(&other, &mut buffer.as_slice()).is_err());
    }
}
