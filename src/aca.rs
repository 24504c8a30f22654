//! Adaptive cross approximation with partial pivoting.
//!
//! Given a generator that can evaluate single rows and columns of an
//! $m\times n$ block $A$, [`aca`] builds factors $L\in\mathbb{C}^{m\times k}$
//! and $R\in\mathbb{C}^{n\times k}$ with $A\approx LR^T$ without ever
//! forming $A$. Step $k$ samples the residual row at the current pivot row,
//! takes the largest residual entry as pivot column, samples the residual
//! column and picks the next pivot row among the unused rows. The loop
//! stops once $\|l_k\|\,\|r_k\| < \text{tol}\cdot\|LR^T\|_F$ (estimated),
//! when the residual row vanishes, or when the rank cap is reached.

use crate::dense::DenseBlock;
use crate::types::{real_to_f64, Result, RustyHMatrixError, ScalarType};
use ndarray::{s, Array1, Array2, ArrayBase, Data, Ix2, ShapeBuilder};
use ndarray_linalg::Norm;
use std::marker::PhantomData;

/// Residual rows with a smaller norm end the approximation.
pub const ACA_TOL: f64 = 1E-10;

/// Row and column oracle of a block that is never formed explicitly.
pub trait AcaGenerator {
    type A: ScalarType;

    fn nrows(&self) -> usize;

    fn ncols(&self) -> usize;

    /// Largest rank the generator should be approximated with.
    fn max_rank(&self) -> usize {
        std::cmp::min(self.nrows(), self.ncols())
    }

    /// Row `row` of the block, of length `ncols()`.
    fn get_row(&self, row: usize) -> Array1<Self::A>;

    /// Column `col` of the block, of length `nrows()`.
    fn get_column(&self, col: usize) -> Array1<Self::A>;
}

impl<A, S> AcaGenerator for ArrayBase<S, Ix2>
where
    A: ScalarType,
    S: Data<Elem = A>,
{
    type A = A;

    fn nrows(&self) -> usize {
        self.len_of(ndarray::Axis(0))
    }

    fn ncols(&self) -> usize {
        self.len_of(ndarray::Axis(1))
    }

    fn get_row(&self, row: usize) -> Array1<A> {
        self.row(row).to_owned()
    }

    fn get_column(&self, col: usize) -> Array1<A> {
        self.column(col).to_owned()
    }
}

impl<A: ScalarType> AcaGenerator for DenseBlock<A> {
    type A = A;

    fn nrows(&self) -> usize {
        DenseBlock::nrows(self)
    }

    fn ncols(&self) -> usize {
        DenseBlock::ncols(self)
    }

    fn get_row(&self, row: usize) -> Array1<A> {
        self.row(row).to_owned()
    }

    fn get_column(&self, col: usize) -> Array1<A> {
        self.column(col).to_owned()
    }
}

/// Generator for a block given as low-rank product `lhs * rhs^T`.
///
/// Used to truncate factor pairs whose rank grew through summation.
pub struct LowRankGenerator<'a, A: ScalarType> {
    lhs: &'a DenseBlock<A>,
    rhs: &'a DenseBlock<A>,
}

impl<'a, A: ScalarType> LowRankGenerator<'a, A> {
    pub fn new(lhs: &'a DenseBlock<A>, rhs: &'a DenseBlock<A>) -> Result<Self> {
        if lhs.ncols() != rhs.ncols() {
            return Err(RustyHMatrixError::ShapeMismatch(format!(
                "factors of rank {} and {} do not match",
                lhs.ncols(),
                rhs.ncols()
            )));
        }
        Ok(LowRankGenerator { lhs, rhs })
    }
}

impl<'a, A: ScalarType> AcaGenerator for LowRankGenerator<'a, A> {
    type A = A;

    fn nrows(&self) -> usize {
        self.lhs.nrows()
    }

    fn ncols(&self) -> usize {
        self.rhs.nrows()
    }

    fn max_rank(&self) -> usize {
        self.lhs.ncols()
    }

    fn get_row(&self, row: usize) -> Array1<A> {
        self.rhs.view().dot(&self.lhs.row(row))
    }

    fn get_column(&self, col: usize) -> Array1<A> {
        self.lhs.view().dot(&self.rhs.row(col))
    }
}

/// Generator from a pair of row and column closures.
pub struct FnGenerator<A, R, C> {
    nrows: usize,
    ncols: usize,
    row: R,
    column: C,
    _marker: PhantomData<A>,
}

impl<A, R, C> FnGenerator<A, R, C>
where
    A: ScalarType,
    R: Fn(usize) -> Array1<A>,
    C: Fn(usize) -> Array1<A>,
{
    pub fn new(nrows: usize, ncols: usize, row: R, column: C) -> Self {
        FnGenerator {
            nrows,
            ncols,
            row,
            column,
            _marker: PhantomData,
        }
    }
}

impl<A, R, C> AcaGenerator for FnGenerator<A, R, C>
where
    A: ScalarType,
    R: Fn(usize) -> Array1<A>,
    C: Fn(usize) -> Array1<A>,
{
    type A = A;

    fn nrows(&self) -> usize {
        self.nrows
    }

    fn ncols(&self) -> usize {
        self.ncols
    }

    fn get_row(&self, row: usize) -> Array1<A> {
        (self.row)(row)
    }

    fn get_column(&self, col: usize) -> Array1<A> {
        (self.column)(col)
    }
}

/// A kernel `k(i, j)` on global indices restricted to a pair of index ranges.
pub struct KernelBlock<'a, A, K> {
    kernel: &'a K,
    rows: (usize, usize),
    cols: (usize, usize),
    _marker: PhantomData<A>,
}

impl<'a, A, K> KernelBlock<'a, A, K>
where
    A: ScalarType,
    K: Fn(usize, usize) -> A,
{
    pub fn new(kernel: &'a K, rows: (usize, usize), cols: (usize, usize)) -> Self {
        KernelBlock {
            kernel,
            rows,
            cols,
            _marker: PhantomData,
        }
    }

    /// Evaluate the whole block.
    pub fn to_dense(&self) -> DenseBlock<A> {
        let (r0, c0) = (self.rows.0, self.cols.0);
        DenseBlock::from_shape_fn(self.nrows(), self.ncols(), |(i, j)| {
            (self.kernel)(r0 + i, c0 + j)
        })
    }
}

impl<'a, A, K> AcaGenerator for KernelBlock<'a, A, K>
where
    A: ScalarType,
    K: Fn(usize, usize) -> A,
{
    type A = A;

    fn nrows(&self) -> usize {
        self.rows.1 - self.rows.0
    }

    fn ncols(&self) -> usize {
        self.cols.1 - self.cols.0
    }

    fn get_row(&self, row: usize) -> Array1<A> {
        let i = self.rows.0 + row;
        (self.cols.0..self.cols.1)
            .map(|j| (self.kernel)(i, j))
            .collect()
    }

    fn get_column(&self, col: usize) -> Array1<A> {
        let j = self.cols.0 + col;
        (self.rows.0..self.rows.1)
            .map(|i| (self.kernel)(i, j))
            .collect()
    }
}

fn check_len(len: usize, expected: usize, what: &str) -> Result<()> {
    if len == expected {
        Ok(())
    } else {
        Err(RustyHMatrixError::ShapeMismatch(format!(
            "generator returned {} of length {}, expected {}",
            what, len, expected
        )))
    }
}

/// Index of the entry with largest modulus among `candidates`.
fn argmax_abs<A: ScalarType, I: IntoIterator<Item = usize>>(
    values: &Array1<A>,
    candidates: I,
) -> Option<usize> {
    let mut best: Option<(usize, A::Real)> = None;
    for index in candidates {
        let value = values[index].abs();
        match best {
            Some((_, current)) if current >= value => (),
            _ => best = Some((index, value)),
        }
    }
    best.map(|(index, _)| index)
}

/// Low-rank approximation `lhs * rhs^T` of the block described by `gen`.
///
/// The rank is capped by `max_rank`, by the generator's own cap and by
/// the block dimensions.
pub fn aca<G: AcaGenerator>(
    gen: &G,
    tol: f64,
    max_rank: usize,
) -> Result<(DenseBlock<G::A>, DenseBlock<G::A>)> {
    let m = gen.nrows();
    let n = gen.ncols();
    let kmax = *[gen.max_rank(), max_rank, m, n]
        .iter()
        .min()
        .unwrap_or(&0);

    let mut lhs = Array2::<G::A>::zeros((m, kmax).f());
    let mut rhs = Array2::<G::A>::zeros((n, kmax).f());

    let mut available: Vec<usize> = (0..m).collect();
    let mut pivot_row = 0;
    let mut nsum = 0.0;
    let mut rank = 0;
    let mut converged = kmax == 0;

    while rank < kmax {
        let k = rank;

        let mut row = gen.get_row(pivot_row);
        check_len(row.len(), n, "row")?;
        if k > 0 {
            row -= &rhs
                .slice(s![.., ..k])
                .dot(&lhs.slice(s![pivot_row, ..k]));
        }

        if real_to_f64(row.norm_l2()) < ACA_TOL {
            converged = true;
            break;
        }

        let pivot_col = match argmax_abs(&row, 0..n) {
            Some(index) => index,
            None => break,
        };
        let pivot = row[pivot_col];
        if pivot == <G::A as num::Zero>::zero() {
            converged = true;
            break;
        }
        row.mapv_inplace(|item| item / pivot);

        let mut column = gen.get_column(pivot_col);
        check_len(column.len(), m, "column")?;
        if k > 0 {
            column -= &lhs
                .slice(s![.., ..k])
                .dot(&rhs.slice(s![pivot_col, ..k]));
        }

        lhs.column_mut(k).assign(&column);
        rhs.column_mut(k).assign(&row);
        rank += 1;

        available.retain(|&index| index != pivot_row);
        if let Some(next) = argmax_abs(&column, available.iter().copied()) {
            pivot_row = next;
        }

        let nk = real_to_f64(column.norm_l2()) * real_to_f64(row.norm_l2());
        if nk < tol * nsum || available.is_empty() {
            converged = true;
            break;
        }
        nsum = nsum.hypot(nk);
    }

    if !converged && kmax < std::cmp::min(m, n) {
        log::warn!(
            "ACA on ({}, {}) block reached rank cap {} before converging.",
            m,
            n,
            kmax
        );
    }
    log::debug!("ACA on ({}, {}) block finished with rank {}.", m, n, rank);

    Ok((
        DenseBlock::from_array(lhs.slice(s![.., ..rank]).to_owned()),
        DenseBlock::from_array(rhs.slice(s![.., ..rank]).to_owned()),
    ))
}
