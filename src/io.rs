//! Binary persistence of dense blocks and index tables.
//!
//! A block is stored as two `u64` header fields (number of rows and
//! number of columns) followed by `rows * cols` scalars in column-major
//! order. All values are little endian. Complex scalars are written as
//! real part followed by imaginary part.

use crate::dense::DenseBlock;
use crate::types::{Result, RustyHMatrixError, ScalarType};
use num::complex::Complex;
use std::convert::TryFrom;
use std::io::{Read, Write};

/// Largest number of values reserved up front when reading.
///
/// Headers are untrusted, so larger buffers grow as values arrive.
const MAX_PREALLOC: usize = 1 << 16;

/// Scalars with a fixed little endian binary representation.
pub trait BinaryScalar: Sized {
    fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()>;

    fn read_from<R: Read>(reader: &mut R) -> std::io::Result<Self>;
}

macro_rules! binary_real_impl {
    ($scalar:ty, $nbytes:expr) => {
        impl BinaryScalar for $scalar {
            fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
                writer.write_all(&self.to_le_bytes())
            }

            fn read_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
                let mut buf = [0u8; $nbytes];
                reader.read_exact(&mut buf)?;
                Ok(<$scalar>::from_le_bytes(buf))
            }
        }
    };
}

macro_rules! binary_complex_impl {
    ($real:ty) => {
        impl BinaryScalar for Complex<$real> {
            fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
                self.re.write_to(writer)?;
                self.im.write_to(writer)
            }

            fn read_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
                let re = <$real>::read_from(reader)?;
                let im = <$real>::read_from(reader)?;
                Ok(Complex::new(re, im))
            }
        }
    };
}

binary_real_impl!(f32, 4);
binary_real_impl!(f64, 8);
binary_complex_impl!(f32);
binary_complex_impl!(f64);

fn write_size<W: Write>(writer: &mut W, value: usize) -> Result<()> {
    writer.write_all(&(value as u64).to_le_bytes())?;
    Ok(())
}

fn read_size<R: Read>(reader: &mut R) -> Result<usize> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    let value = u64::from_le_bytes(buf);
    usize::try_from(value).map_err(|_| {
        RustyHMatrixError::ShapeMismatch(format!("stored size {} does not fit in memory", value))
    })
}

/// Number of values announced by a `nrows x ncols` header.
fn stored_len(nrows: usize, ncols: usize) -> Result<usize> {
    nrows.checked_mul(ncols).ok_or_else(|| {
        RustyHMatrixError::ShapeMismatch(format!("stored shape {} x {} overflows", nrows, ncols))
    })
}

/// Write a dense block (header plus column-major values).
pub fn write_block<A: ScalarType, W: Write>(writer: &mut W, block: &DenseBlock<A>) -> Result<()> {
    write_size(writer, block.nrows())?;
    write_size(writer, block.ncols())?;
    // The transposed view iterates in column-major order of the block.
    for value in block.view().t().iter() {
        value.write_to(writer)?;
    }
    Ok(())
}

/// Read a dense block written by [`write_block`].
pub fn read_block<A: ScalarType, R: Read>(reader: &mut R) -> Result<DenseBlock<A>> {
    let nrows = read_size(reader)?;
    let ncols = read_size(reader)?;

    let len = stored_len(nrows, ncols)?;

    let mut values = Vec::with_capacity(len.min(MAX_PREALLOC));
    for _ in 0..len {
        values.push(A::read_from(reader)?);
    }

    DenseBlock::from_column_major(nrows, ncols, values)
}

/// Write a table of index pairs as a `k x 2` column-major block of `u64`.
pub fn write_index_table<W: Write>(writer: &mut W, pairs: &[(usize, usize)]) -> Result<()> {
    write_size(writer, pairs.len())?;
    write_size(writer, 2)?;
    for &(first, _) in pairs {
        write_size(writer, first)?;
    }
    for &(_, second) in pairs {
        write_size(writer, second)?;
    }
    Ok(())
}

/// Read a table of index pairs written by [`write_index_table`].
pub fn read_index_table<R: Read>(reader: &mut R) -> Result<Vec<(usize, usize)>> {
    let nrows = read_size(reader)?;
    let ncols = read_size(reader)?;

    if nrows > 0 && ncols != 2 {
        return Err(RustyHMatrixError::ShapeMismatch(format!(
            "index table must have two columns, found {}",
            ncols
        )));
    }

    let mut first = Vec::with_capacity(nrows.min(MAX_PREALLOC));
    for _ in 0..nrows {
        first.push(read_size(reader)?);
    }
    let mut second = Vec::with_capacity(nrows.min(MAX_PREALLOC));
    for _ in 0..nrows {
        second.push(read_size(reader)?);
    }

    Ok(first.into_iter().zip(second).collect())
}
