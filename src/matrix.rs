use core::fmt;
use core::ops::{Index, IndexMut};

use dyn_stack::{GlobalPodBuffer, StackReq};
use faer_core::mat;
use faer_core::{MatMut, MatRef};

/// Errors raised by the dense linear-algebra kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinalgError {
    /// A buffer could not be allocated (or its size overflowed).
    OutOfMemory,
    /// A vector or matrix argument has the wrong length.
    DimensionMismatch { expected: usize, actual: usize },
    /// Rank detection found no usable pivot.
    SingularMatrix { rank: usize, ncols: usize },
}

impl fmt::Display for LinalgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::DimensionMismatch { expected, actual } => {
                write!(f, "length {actual} does not match expected {expected}")
            }
            Self::SingularMatrix { rank, ncols } => {
                write!(f, "singular matrix: rank {rank} of {ncols} columns")
            }
        }
    }
}

impl std::error::Error for LinalgError {}

pub(crate) fn check_len(actual: usize, expected: usize) -> Result<(), LinalgError> {
    if actual == expected {
        Ok(())
    } else {
        Err(LinalgError::DimensionMismatch { expected, actual })
    }
}

/// Allocates a filled vector, reporting allocation failure instead of aborting.
pub(crate) fn try_filled<T: Clone>(len: usize, value: T) -> Result<Vec<T>, LinalgError> {
    let mut values = Vec::new();
    values
        .try_reserve_exact(len)
        .map_err(|_| LinalgError::OutOfMemory)?;
    values.resize(len, value);
    Ok(values)
}

pub(crate) fn try_zeroed(len: usize) -> Result<Vec<f64>, LinalgError> {
    try_filled(len, 0.0)
}

/// Stack requirement for one `f64` slice per entry of `lens`.
pub(crate) fn scratch_req(lens: &[usize]) -> Result<StackReq, LinalgError> {
    let mut req = StackReq::empty();
    for &len in lens {
        let part = StackReq::try_new::<f64>(len).map_err(|_| LinalgError::OutOfMemory)?;
        req = req.try_and(part).map_err(|_| LinalgError::OutOfMemory)?;
    }
    Ok(req)
}

/// Scratch buffer holding one `f64` slice per entry of `lens`.
pub(crate) fn scratch(lens: &[usize]) -> Result<GlobalPodBuffer, LinalgError> {
    GlobalPodBuffer::try_new(scratch_req(lens)?).map_err(|_| LinalgError::OutOfMemory)
}

/// Owned dense matrix stored column by column.
///
/// The shape is fixed at construction. Constructors either return a fully
/// allocated matrix or `LinalgError::OutOfMemory`.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    nrows: usize,
    ncols: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// Creates a zero matrix with `nrows` rows and `ncols` columns.
    pub fn zeros(nrows: usize, ncols: usize) -> Result<Self, LinalgError> {
        let len = nrows.checked_mul(ncols).ok_or(LinalgError::OutOfMemory)?;
        Ok(Self {
            nrows,
            ncols,
            data: try_zeroed(len)?,
        })
    }

    /// Creates a matrix whose entry `(i, j)` is `f(i, j)`.
    pub fn from_fn(
        nrows: usize,
        ncols: usize,
        mut f: impl FnMut(usize, usize) -> f64,
    ) -> Result<Self, LinalgError> {
        let mut out = Self::zeros(nrows, ncols)?;
        for j in 0..ncols {
            for i in 0..nrows {
                out[(i, j)] = f(i, j);
            }
        }
        Ok(out)
    }

    /// Creates a matrix from a list of equally long rows.
    pub fn from_rows(rows: &[&[f64]]) -> Result<Self, LinalgError> {
        let ncols = rows.first().map_or(0, |row| row.len());
        for row in rows {
            check_len(row.len(), ncols)?;
        }
        Self::from_fn(rows.len(), ncols, |i, j| rows[i][j])
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// Entries of column `j`, top to bottom.
    pub fn col(&self, j: usize) -> &[f64] {
        &self.data[j * self.nrows..(j + 1) * self.nrows]
    }

    pub fn col_mut(&mut self, j: usize) -> &mut [f64] {
        &mut self.data[j * self.nrows..(j + 1) * self.nrows]
    }

    pub fn fill(&mut self, value: f64) {
        self.data.fill(value);
    }

    pub fn swap_cols(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        let nrows = self.nrows;
        for i in 0..nrows {
            self.data.swap(a * nrows + i, b * nrows + i);
        }
    }

    /// Borrow as a faer view for the dense products.
    pub fn as_faer(&self) -> MatRef<'_, f64> {
        mat::from_column_major_slice::<f64>(&self.data, self.nrows, self.ncols)
    }

    pub fn as_faer_mut(&mut self) -> MatMut<'_, f64> {
        mat::from_column_major_slice_mut::<f64>(&mut self.data, self.nrows, self.ncols)
    }
}

impl Index<(usize, usize)> for Matrix {
    type Output = f64;

    fn index(&self, (i, j): (usize, usize)) -> &f64 {
        debug_assert!(i < self.nrows && j < self.ncols);
        &self.data[j * self.nrows + i]
    }
}

impl IndexMut<(usize, usize)> for Matrix {
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut f64 {
        debug_assert!(i < self.nrows && j < self.ncols);
        &mut self.data[j * self.nrows + i]
    }
}

/// Column permutation chosen by pivoting.
///
/// Position `k` of the factored matrix holds original column `get(k)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permutation {
    indices: Vec<usize>,
}

impl Permutation {
    pub fn identity(len: usize) -> Result<Self, LinalgError> {
        let mut indices = Vec::new();
        indices
            .try_reserve_exact(len)
            .map_err(|_| LinalgError::OutOfMemory)?;
        indices.extend(0..len);
        Ok(Self { indices })
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn reset(&mut self) {
        for (pos, index) in self.indices.iter_mut().enumerate() {
            *index = pos;
        }
    }

    pub fn swap(&mut self, a: usize, b: usize) {
        self.indices.swap(a, b);
    }

    /// Original column stored at position `pos`.
    pub fn get(&self, pos: usize) -> usize {
        self.indices[pos]
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.indices
    }

    /// Reorders `original` (caller's column order) into pivot order.
    pub fn gather(&self, original: &[f64], permuted: &mut [f64]) {
        for (slot, &index) in permuted.iter_mut().zip(self.indices.iter()) {
            *slot = original[index];
        }
    }

    /// Moves `permuted` (pivot order) back into the caller's column order.
    pub fn scatter(&self, permuted: &[f64], original: &mut [f64]) {
        for (&value, &index) in permuted.iter().zip(self.indices.iter()) {
            original[index] = value;
        }
    }
}
