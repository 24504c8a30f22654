//! Generation of random matrices for various types

use ndarray::Array2;
use ndarray_linalg::{Lapack, Scalar};
use num::complex::Complex;
use num::traits::cast::cast;
use num::{Float, One, Zero};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

pub trait RandomMatrix
where
    Self: Scalar + Lapack,
{
    /// Generate a random Gaussian matrix.
    ///
    /// # Arguments
    ///
    /// * `dimension`: Tuple (rows, cols) specifying the number of rows and columns.
    /// * `rng`: The random number generator to use.
    fn random_gaussian<R: Rng>(dimension: (usize, usize), rng: &mut R) -> Array2<Self>;

    /// Generate a random square matrix whose diagonal dominates each row.
    ///
    /// The off-diagonal entries are standard normal, the diagonal is shifted
    /// by the row sum of their absolute values plus one. Such matrices are
    /// invertible and admit an LU decomposition without pivoting.
    fn random_diagonally_dominant<R: Rng>(n: usize, rng: &mut R) -> Array2<Self> {
        let mut mat = Self::random_gaussian((n, n), rng);
        for i in 0..n {
            let off: Self::Real = mat
                .row(i)
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(_, item)| item.abs())
                .fold(<Self::Real as Zero>::zero(), |acc, item| acc + item);
            mat[[i, i]] = Self::from_real(off + <Self::Real as One>::one());
        }
        mat
    }
}

impl RandomMatrix for f64 {
    fn random_gaussian<R: Rng>(dimension: (usize, usize), rng: &mut R) -> Array2<f64> {
        random_gaussian_real::<f64, R>(dimension, rng)
    }
}

impl RandomMatrix for f32 {
    fn random_gaussian<R: Rng>(dimension: (usize, usize), rng: &mut R) -> Array2<f32> {
        random_gaussian_real::<f32, R>(dimension, rng)
    }
}

impl RandomMatrix for Complex<f64> {
    fn random_gaussian<R: Rng>(dimension: (usize, usize), rng: &mut R) -> Array2<Complex<f64>> {
        random_gaussian_complex::<f64, R>(dimension, rng)
    }
}

impl RandomMatrix for Complex<f32> {
    fn random_gaussian<R: Rng>(dimension: (usize, usize), rng: &mut R) -> Array2<Complex<f32>> {
        random_gaussian_complex::<f32, R>(dimension, rng)
    }
}

fn random_gaussian_real<T: Float, R: Rng>(dimension: (usize, usize), rng: &mut R) -> Array2<T> {
    let mut mat = Array2::<T>::zeros(dimension);
    mat.map_inplace(|item| *item = sample(rng));
    mat
}

fn random_gaussian_complex<T: Float, R: Rng>(
    dimension: (usize, usize),
    rng: &mut R,
) -> Array2<Complex<T>> {
    let mut mat = Array2::<Complex<T>>::zeros(dimension);
    mat.map_inplace(|item| {
        let re = sample(rng);
        let im = sample(rng);
        *item = Complex::new(re, im);
    });
    mat
}

/// One standard normal sample in the target precision.
fn sample<T: Float, R: Rng>(rng: &mut R) -> T {
    let value: f64 = StandardNormal.sample(rng);
    cast::<f64, T>(value).unwrap_or_else(T::zero)
}
