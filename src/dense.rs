//! Dense column-major blocks with masked views.
//!
//! A [`DenseBlock`] owns a column-major $m\times n$ buffer. A [`Mask`] is a
//! non-owning rectangle `[row_begin, row_end) x [col_begin, col_end)`
//! inside a block. All block arithmetic takes masks so that products and
//! copies can act on sub-ranges in place, e.g.
//! $C[\text{mask}_C] \mathrel{+}= \text{op}(A[\text{mask}_A])\,\text{op}(B[\text{mask}_B])$.
//!
//! Matrix products go through `ndarray::linalg::general_mat_mul`, which
//! dispatches to BLAS. The inverse uses LAPACK with the `lapack` feature
//! and Gauss-Jordan elimination otherwise.

use crate::types::{Result, RustyHMatrixError, ScalarType};
use ndarray::linalg::general_mat_mul;
use ndarray::{s, Array2, ArrayView1, ArrayView2, ArrayViewMut2, ShapeBuilder};
use std::fmt;
use std::ops::{AddAssign, Index, IndexMut, Mul, Neg, SubAssign};

/// Rectangular sub-range of a dense block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mask {
    pub row_begin: usize,
    pub row_end: usize,
    pub col_begin: usize,
    pub col_end: usize,
}

impl Mask {
    pub fn new(row_begin: usize, row_end: usize, col_begin: usize, col_end: usize) -> Self {
        Mask {
            row_begin,
            row_end,
            col_begin,
            col_end,
        }
    }

    /// Mask from a row range and a column range.
    pub fn from_ranges(rows: (usize, usize), cols: (usize, usize)) -> Self {
        Mask::new(rows.0, rows.1, cols.0, cols.1)
    }

    /// Mask covering a whole block of the given shape.
    pub fn full(nrows: usize, ncols: usize) -> Self {
        Mask::new(0, nrows, 0, ncols)
    }

    pub fn nrows(&self) -> usize {
        self.row_end.saturating_sub(self.row_begin)
    }

    pub fn ncols(&self) -> usize {
        self.col_end.saturating_sub(self.col_begin)
    }

    /// Check that the mask lies inside a block of shape `(nrows, ncols)`.
    pub fn check(&self, nrows: usize, ncols: usize) -> Result<()> {
        if self.row_begin <= self.row_end
            && self.col_begin <= self.col_end
            && self.row_end <= nrows
            && self.col_end <= ncols
        {
            Ok(())
        } else {
            Err(RustyHMatrixError::MaskOutOfBounds {
                mask: *self,
                nrows,
                ncols,
            })
        }
    }
}

impl fmt::Display for Mask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{}..{}, {}..{}]",
            self.row_begin, self.row_end, self.col_begin, self.col_end
        )
    }
}

/// Transposition flag for masked products.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    NoTrans,
    Trans,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DenseBlock<A: ScalarType> {
    data: Array2<A>,
}

impl<A: ScalarType> DenseBlock<A> {
    /// Zero initialised block.
    pub fn zeros(nrows: usize, ncols: usize) -> Self {
        DenseBlock {
            data: Array2::<A>::zeros((nrows, ncols).f()),
        }
    }

    /// Block filled with a constant value.
    pub fn from_elem(nrows: usize, ncols: usize, value: A) -> Self {
        DenseBlock {
            data: Array2::<A>::from_elem((nrows, ncols).f(), value),
        }
    }

    pub fn eye(n: usize) -> Self {
        let mut block = DenseBlock::zeros(n, n);
        block.data.diag_mut().fill(A::one());
        block
    }

    /// Wrap an existing array. The data is copied into column-major
    /// storage if necessary.
    pub fn from_array(arr: Array2<A>) -> Self {
        if arr.t().is_standard_layout() {
            DenseBlock { data: arr }
        } else {
            let mut data = Array2::<A>::zeros(arr.raw_dim().f());
            data.assign(&arr);
            DenseBlock { data }
        }
    }

    /// Block from `nrows * ncols` values in column-major order.
    pub fn from_column_major(nrows: usize, ncols: usize, values: Vec<A>) -> Result<Self> {
        let len = values.len();
        Array2::from_shape_vec((nrows, ncols).f(), values)
            .map(|data| DenseBlock { data })
            .map_err(|_| {
                RustyHMatrixError::ShapeMismatch(format!(
                    "{} values cannot fill a ({}, {}) block",
                    len, nrows, ncols
                ))
            })
    }

    /// Block with entries `f(i, j)`.
    pub fn from_shape_fn<F: FnMut((usize, usize)) -> A>(nrows: usize, ncols: usize, f: F) -> Self {
        DenseBlock {
            data: Array2::from_shape_fn((nrows, ncols).f(), f),
        }
    }

    pub fn nrows(&self) -> usize {
        self.data.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.data.ncols()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Mask covering the whole block.
    pub fn size(&self) -> Mask {
        Mask::full(self.nrows(), self.ncols())
    }

    /// Element `(i, j)`, `None` if out of range.
    pub fn get(&self, i: usize, j: usize) -> Option<&A> {
        self.data.get((i, j))
    }

    pub fn get_mut(&mut self, i: usize, j: usize) -> Option<&mut A> {
        self.data.get_mut((i, j))
    }

    /// Element at column-major linear position `index`.
    pub fn get_linear(&self, index: usize) -> Option<&A> {
        let nrows = self.nrows();
        if nrows == 0 || index >= self.len() {
            return None;
        }
        self.data.get((index % nrows, index / nrows))
    }

    pub fn view(&self) -> ArrayView2<A> {
        self.data.view()
    }

    pub fn view_mut(&mut self) -> ArrayViewMut2<A> {
        self.data.view_mut()
    }

    pub fn as_array(&self) -> &Array2<A> {
        &self.data
    }

    pub fn into_array(self) -> Array2<A> {
        self.data
    }

    pub fn column(&self, j: usize) -> ArrayView1<A> {
        self.data.column(j)
    }

    pub fn row(&self, i: usize) -> ArrayView1<A> {
        self.data.row(i)
    }

    /// View of the masked region.
    pub fn masked(&self, mask: Mask) -> Result<ArrayView2<A>> {
        mask.check(self.nrows(), self.ncols())?;
        Ok(self
            .data
            .slice(s![mask.row_begin..mask.row_end, mask.col_begin..mask.col_end]))
    }

    /// Mutable view of the masked region.
    pub fn masked_mut(&mut self, mask: Mask) -> Result<ArrayViewMut2<A>> {
        mask.check(self.nrows(), self.ncols())?;
        Ok(self
            .data
            .slice_mut(s![mask.row_begin..mask.row_end, mask.col_begin..mask.col_end]))
    }

    /// Copy of the masked region.
    pub fn mask(&self, mask: Mask) -> Result<Self> {
        Ok(DenseBlock::from_array(self.masked(mask)?.to_owned()))
    }

    /// Copy `src[src_mask]` into `self[mask]`.
    pub fn copy_masked(&mut self, mask: Mask, src: &DenseBlock<A>, src_mask: Mask) -> Result<()> {
        let source = src.masked(src_mask)?;
        let mut target = self.masked_mut(mask)?;
        if source.dim() != target.dim() {
            return Err(RustyHMatrixError::ShapeMismatch(format!(
                "cannot copy {} into {}",
                src_mask, mask
            )));
        }
        target.assign(&source);
        Ok(())
    }

    /// `self += alpha * other`.
    pub fn add_scaled(&mut self, alpha: A, other: &DenseBlock<A>) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(RustyHMatrixError::ShapeMismatch(format!(
                "cannot add block of shape {:?} to block of shape {:?}",
                other.shape(),
                self.shape()
            )));
        }
        self.data.scaled_add(alpha, &other.data);
        Ok(())
    }

    pub fn scale(&mut self, alpha: A) {
        self.data.map_inplace(|item| *item *= alpha);
    }

    pub fn transpose(&self) -> Self {
        DenseBlock::from_array(self.data.t().to_owned())
    }

    /// Inverse of a square block.
    pub fn inv(&self) -> Result<Self> {
        if self.nrows() != self.ncols() {
            return Err(RustyHMatrixError::ShapeMismatch(format!(
                "cannot invert non-square block of shape {:?}",
                self.shape()
            )));
        }
        imp::inverse(&self.data).map(DenseBlock::from_array)
    }
}

impl<A: ScalarType> Index<(usize, usize)> for DenseBlock<A> {
    type Output = A;

    fn index(&self, index: (usize, usize)) -> &A {
        &self.data[index]
    }
}

impl<A: ScalarType> IndexMut<(usize, usize)> for DenseBlock<A> {
    fn index_mut(&mut self, index: (usize, usize)) -> &mut A {
        &mut self.data[index]
    }
}

impl<A: ScalarType> Index<usize> for DenseBlock<A> {
    type Output = A;

    fn index(&self, index: usize) -> &A {
        let nrows = self.nrows().max(1);
        &self.data[(index % nrows, index / nrows)]
    }
}

/// Elementwise `+=`.
///
/// # Panics
///
/// Panics if the shapes differ. Use [`DenseBlock::add_scaled`] for a
/// checked version. Shapes are never broadcast.
impl<A: ScalarType> AddAssign<&DenseBlock<A>> for DenseBlock<A> {
    fn add_assign(&mut self, other: &DenseBlock<A>) {
        assert_eq!(self.shape(), other.shape(), "shape mismatch in `+=`");
        self.data += &other.data;
    }
}

/// Elementwise `-=`.
///
/// # Panics
///
/// Panics if the shapes differ. Use [`DenseBlock::add_scaled`] for a
/// checked version. Shapes are never broadcast.
impl<A: ScalarType> SubAssign<&DenseBlock<A>> for DenseBlock<A> {
    fn sub_assign(&mut self, other: &DenseBlock<A>) {
        assert_eq!(self.shape(), other.shape(), "shape mismatch in `-=`");
        self.data -= &other.data;
    }
}

impl<A: ScalarType> Neg for DenseBlock<A> {
    type Output = DenseBlock<A>;

    fn neg(mut self) -> DenseBlock<A> {
        self.data.map_inplace(|item| *item = -*item);
        self
    }
}

impl<A: ScalarType> Neg for &DenseBlock<A> {
    type Output = DenseBlock<A>;

    fn neg(self) -> DenseBlock<A> {
        -self.clone()
    }
}

/// Matrix product.
///
/// # Panics
///
/// Panics if the inner dimensions differ. [`mul`] returns an error instead.
impl<A: ScalarType> Mul<&DenseBlock<A>> for &DenseBlock<A> {
    type Output = DenseBlock<A>;

    fn mul(self, other: &DenseBlock<A>) -> DenseBlock<A> {
        DenseBlock::from_array(self.data.dot(&other.data))
    }
}

fn apply_op<A>(view: ArrayView2<A>, op: Op) -> ArrayView2<A> {
    match op {
        Op::NoTrans => view,
        Op::Trans => view.reversed_axes(),
    }
}

/// Shape of `op(A[mask])`.
fn op_shape(mask: Mask, op: Op) -> (usize, usize) {
    match op {
        Op::NoTrans => (mask.nrows(), mask.ncols()),
        Op::Trans => (mask.ncols(), mask.nrows()),
    }
}

/// Masked product accumulation, `C[mask_c] += op(A[mask_a]) * op(B[mask_b])`.
#[allow(clippy::too_many_arguments)]
pub fn add_mul<A: ScalarType>(
    a: &DenseBlock<A>,
    mask_a: Mask,
    op_a: Op,
    b: &DenseBlock<A>,
    mask_b: Mask,
    op_b: Op,
    c: &mut DenseBlock<A>,
    mask_c: Mask,
) -> Result<()> {
    let (m, ka) = op_shape(mask_a, op_a);
    let (kb, n) = op_shape(mask_b, op_b);

    if ka != kb || mask_c.nrows() != m || mask_c.ncols() != n {
        return Err(RustyHMatrixError::ShapeMismatch(format!(
            "cannot accumulate ({}, {}) x ({}, {}) product into {}",
            m, ka, kb, n, mask_c
        )));
    }

    let a_view = apply_op(a.masked(mask_a)?, op_a);
    let b_view = apply_op(b.masked(mask_b)?, op_b);
    let mut c_view = c.masked_mut(mask_c)?;

    if m == 0 || n == 0 || ka == 0 {
        return Ok(());
    }

    general_mat_mul(A::one(), &a_view, &b_view, A::one(), &mut c_view);
    Ok(())
}

/// Masked product, `op(A[mask_a]) * op(B[mask_b])`.
pub fn mul<A: ScalarType>(
    a: &DenseBlock<A>,
    mask_a: Mask,
    op_a: Op,
    b: &DenseBlock<A>,
    mask_b: Mask,
    op_b: Op,
) -> Result<DenseBlock<A>> {
    let (m, _) = op_shape(mask_a, op_a);
    let (_, n) = op_shape(mask_b, op_b);

    let mut c = DenseBlock::zeros(m, n);
    let mask_c = c.size();
    add_mul(a, mask_a, op_a, b, mask_b, op_b, &mut c, mask_c)?;
    Ok(c)
}

/// Horizontal concatenation `[A, B]` of blocks with equal row count.
pub fn cat<A: ScalarType>(a: &DenseBlock<A>, b: &DenseBlock<A>) -> Result<DenseBlock<A>> {
    cat_grid(&[vec![a, b]])
}

/// Concatenate a grid of blocks into one block.
///
/// All blocks in a grid row must share the row count and all blocks in a
/// grid column the column count.
pub fn cat_grid<A: ScalarType>(grid: &[Vec<&DenseBlock<A>>]) -> Result<DenseBlock<A>> {
    if grid.is_empty() {
        return Ok(DenseBlock::zeros(0, 0));
    }

    let ncols_grid = grid[0].len();
    if grid.iter().any(|row| row.len() != ncols_grid) {
        return Err(RustyHMatrixError::ShapeMismatch(
            "ragged grid in block concatenation".to_string(),
        ));
    }

    let mut row_offsets = vec![0];
    for row in grid.iter() {
        let height = row.first().map_or(0, |block| block.nrows());
        row_offsets.push(row_offsets[row_offsets.len() - 1] + height);
    }
    let mut col_offsets = vec![0];
    for j in 0..ncols_grid {
        col_offsets.push(col_offsets[j] + grid[0][j].ncols());
    }

    let mut result = DenseBlock::zeros(row_offsets[grid.len()], col_offsets[ncols_grid]);
    for (i, row) in grid.iter().enumerate() {
        for (j, block) in row.iter().enumerate() {
            let mask = Mask::new(
                row_offsets[i],
                row_offsets[i + 1],
                col_offsets[j],
                col_offsets[j + 1],
            );
            result.copy_masked(mask, block, block.size())?;
        }
    }

    Ok(result)
}

#[cfg(not(feature = "lapack"))]
mod imp {
    use crate::triangular::inverse_gauss_jordan;
    use crate::types::{Result, ScalarType};
    use ndarray::Array2;

    pub(super) fn inverse<A: ScalarType>(mat: &Array2<A>) -> Result<Array2<A>> {
        inverse_gauss_jordan(mat.view())
    }
}

#[cfg(feature = "lapack")]
mod imp {
    pub(super) use super::lapack::inverse;
}

#[cfg(any(feature = "lapack", test))]
mod lapack {
    use crate::types::{from_lapack, Result, ScalarType};
    use ndarray::Array2;
    use ndarray_linalg::Inverse;

    pub(crate) fn inverse<A: ScalarType>(mat: &Array2<A>) -> Result<Array2<A>> {
        if mat.is_empty() {
            return Ok(mat.clone());
        }
        mat.inv().map_err(from_lapack)
    }
}
