//! Householder QR with column pivoting, and the triangular solves built on it.
//!
//! A factored `m x n` matrix keeps R strictly above its diagonal, the
//! diagonal of R in a separate vector, and the Householder vectors in and
//! below the diagonal. Each stored vector is normalized so that its first
//! entry is `1 + |u_0|`, which is enough to rebuild the reflector
//! `H = I - v v' / v_0` without storing its norm.

use core::fmt;

use dyn_stack::{GlobalPodBuffer, PodStack, StackReq};

use crate::matrix::{
    check_len, scratch, scratch_req, try_zeroed, LinalgError, Matrix, Permutation,
};

/// Stack space `qr` needs for a matrix with `ncols` columns.
pub fn qr_req(ncols: usize) -> Result<StackReq, LinalgError> {
    scratch_req(&[ncols, ncols, ncols])
}

/// Factorizes `a` in place and returns its numeric rank.
///
/// Columns are pivoted by largest remaining norm. Factorization stops at the
/// first pivot whose remaining norm is at most `2 * max(m, n) * eps` times
/// its original norm; `diag[j]` is zero for every `j >= rank`. `perm` is
/// reset to the identity before pivoting. When given, `norms` receives the
/// original column norms in the caller's column order.
///
/// `stack` must hold at least `qr_req(a.ncols())`.
pub fn qr(
    a: &mut Matrix,
    diag: &mut [f64],
    perm: &mut Permutation,
    norms: Option<&mut [f64]>,
    stack: PodStack<'_>,
) -> Result<usize, LinalgError> {
    let m = a.nrows();
    let n = a.ncols();
    check_len(diag.len(), n)?;
    check_len(perm.len(), n)?;

    let (original, stack) = stack.make_with(n, |_| 0.0f64);
    let (remaining, stack) = stack.make_with(n, |_| 0.0f64);
    let (reference, _) = stack.make_with(n, |_| 0.0f64);

    for j in 0..n {
        let sq = sum_sq(a.col(j));
        original[j] = sq.sqrt();
        remaining[j] = sq;
        reference[j] = sq;
    }
    if let Some(norms) = norms {
        check_len(norms.len(), n)?;
        norms.copy_from_slice(original);
    }

    perm.reset();
    diag.fill(0.0);
    let threshold = 2.0 * m.max(n) as f64 * f64::EPSILON;
    let steps = m.min(n);

    for k in 0..steps {
        let mut pivot = k;
        for j in k + 1..n {
            if remaining[j] > remaining[pivot] {
                pivot = j;
            }
        }
        if pivot != k {
            a.swap_cols(k, pivot);
            perm.swap(k, pivot);
            original.swap(k, pivot);
            remaining.swap(k, pivot);
            reference.swap(k, pivot);
        }

        let mut norm = sum_sq(&a.col(k)[k..]).sqrt();
        if norm == 0.0 || norm <= threshold * original[k] {
            return Ok(k);
        }
        if a[(k, k)] < 0.0 {
            norm = -norm;
        }
        for value in &mut a.col_mut(k)[k..] {
            *value /= norm;
        }
        a[(k, k)] += 1.0;

        for j in k + 1..n {
            let v0 = a[(k, k)];
            let mut sum = 0.0;
            for i in k..m {
                sum += a[(i, k)] * a[(i, j)];
            }
            let scale = sum / v0;
            for i in k..m {
                let v = a[(i, k)];
                a[(i, j)] -= scale * v;
            }

            // Drop row k from the remaining norm; recompute when cancellation
            // has eaten most of the significant digits.
            if reference[j] > 0.0 {
                let top = a[(k, j)];
                remaining[j] = (remaining[j] - top * top).max(0.0);
                if 0.05 * (remaining[j] / reference[j]) <= f64::EPSILON {
                    remaining[j] = sum_sq(&a.col(j)[k + 1..]);
                    reference[j] = remaining[j];
                }
            }
        }
        diag[k] = -norm;
    }
    Ok(steps)
}

fn sum_sq(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum()
}

/// Solves the least-squares problem `min ||a x - b||` through a pivoted QR.
///
/// Rank-deficient and underdetermined systems yield the minimum-norm
/// solution.
///
/// Every call allocates a fresh factorization and workspace. Fits that solve
/// repeatedly keep a `QrFactorization` and a `QrWorkspace` instead.
pub fn qr_solve(a: &Matrix, b: &[f64]) -> Result<Vec<f64>, LinalgError> {
    check_len(b.len(), a.nrows())?;
    let copy = Matrix::from_fn(a.nrows(), a.ncols(), |i, j| a[(i, j)])?;
    let factor = QrFactorization::new(copy)?;
    let mut ws = QrWorkspace::new(a.ncols())?;
    let mut c = try_zeroed(b.len())?;
    c.copy_from_slice(b);
    let mut x = try_zeroed(a.ncols())?;
    factor.solve(&mut c, &mut x, &mut ws)?;
    Ok(x)
}

/// A pivoted Householder QR factorization and the solves that reuse it.
///
/// The scratch space for refactorizing is allocated with the factorization.
pub struct QrFactorization {
    qr: Matrix,
    diag: Vec<f64>,
    perm: Permutation,
    norms: Vec<f64>,
    rank: usize,
    stack: GlobalPodBuffer,
}

impl fmt::Debug for QrFactorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QrFactorization")
            .field("nrows", &self.nrows())
            .field("ncols", &self.ncols())
            .field("rank", &self.rank)
            .field("diag", &self.diag)
            .field("perm", &self.perm)
            .finish_non_exhaustive()
    }
}

impl QrFactorization {
    /// Factorizes `a`, taking ownership of its storage.
    pub fn new(a: Matrix) -> Result<Self, LinalgError> {
        let n = a.ncols();
        let mut factor = Self {
            qr: a,
            diag: try_zeroed(n)?,
            perm: Permutation::identity(n)?,
            norms: try_zeroed(n)?,
            rank: 0,
            stack: scratch(&[n, n, n])?,
        };
        factor.factorize()?;
        Ok(factor)
    }

    /// Allocates storage for an `nrows x ncols` factorization of the zero matrix.
    pub fn with_shape(nrows: usize, ncols: usize) -> Result<Self, LinalgError> {
        Ok(Self {
            qr: Matrix::zeros(nrows, ncols)?,
            diag: try_zeroed(ncols)?,
            perm: Permutation::identity(ncols)?,
            norms: try_zeroed(ncols)?,
            rank: 0,
            stack: scratch(&[ncols, ncols, ncols])?,
        })
    }

    fn factorize(&mut self) -> Result<usize, LinalgError> {
        self.rank = 0;
        self.rank = qr(
            &mut self.qr,
            &mut self.diag,
            &mut self.perm,
            Some(&mut self.norms),
            PodStack::new(&mut self.stack),
        )?;
        Ok(self.rank)
    }

    /// Refills the matrix storage through `fill` and factorizes it again.
    ///
    /// `fill` must keep the shape. Returns the new rank.
    pub fn refactor_with(&mut self, fill: impl FnOnce(&mut Matrix)) -> Result<usize, LinalgError> {
        let (nrows, ncols) = (self.qr.nrows(), self.qr.ncols());
        fill(&mut self.qr);
        check_len(self.qr.nrows(), nrows)?;
        check_len(self.qr.ncols(), ncols)?;
        self.factorize()
    }

    pub fn nrows(&self) -> usize {
        self.qr.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.qr.ncols()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Diagonal of R, in pivot order.
    pub fn diag(&self) -> &[f64] {
        &self.diag
    }

    pub fn perm(&self) -> &Permutation {
        &self.perm
    }

    /// Original column norms, in the caller's column order.
    pub fn norms(&self) -> &[f64] {
        &self.norms
    }

    /// Entry `(i, j)` of R in pivot order. Rows at or beyond the rank are zero.
    pub fn r(&self, i: usize, j: usize) -> f64 {
        if i >= self.rank || i > j {
            0.0
        } else if i == j {
            self.diag[j]
        } else {
            self.qr[(i, j)]
        }
    }

    /// Overwrites `b` with `Q' b`.
    pub fn qt_b(&self, b: &mut [f64]) -> Result<(), LinalgError> {
        check_len(b.len(), self.nrows())?;
        for k in 0..self.rank {
            self.reflect(k, b);
        }
        Ok(())
    }

    /// Overwrites `b` with `Q b`.
    pub fn q_b(&self, b: &mut [f64]) -> Result<(), LinalgError> {
        check_len(b.len(), self.nrows())?;
        for k in (0..self.rank).rev() {
            self.reflect(k, b);
        }
        Ok(())
    }

    fn reflect(&self, k: usize, b: &mut [f64]) {
        let v = &self.qr.col(k)[k..];
        let tail = &mut b[k..];
        let dot: f64 = v.iter().zip(tail.iter()).map(|(vi, bi)| vi * bi).sum();
        let scale = dot / v[0];
        for (bi, vi) in tail.iter_mut().zip(v.iter()) {
            *bi -= scale * vi;
        }
    }

    /// Back substitution on the leading `rank x rank` block of R.
    ///
    /// `c` is in pivot order (typically `Q' b`); `x` receives the solution in
    /// the caller's column order, with zeros for columns beyond the rank.
    pub fn r_solve(&self, c: &[f64], x: &mut [f64]) -> Result<(), LinalgError> {
        check_len(x.len(), self.ncols())?;
        if c.len() < self.rank {
            return Err(LinalgError::DimensionMismatch {
                expected: self.rank,
                actual: c.len(),
            });
        }
        if self.rank == 0 {
            return Err(LinalgError::SingularMatrix {
                rank: 0,
                ncols: self.ncols(),
            });
        }
        x.fill(0.0);
        for j in (0..self.rank).rev() {
            let mut sum = c[j];
            for i in j + 1..self.rank {
                sum -= self.qr[(j, i)] * x[self.perm.get(i)];
            }
            x[self.perm.get(j)] = sum / self.diag[j];
        }
        Ok(())
    }

    /// Forward substitution with R' on the leading `rank` entries.
    ///
    /// Both `c` and `y` are in pivot order; entries of `y` beyond the rank are
    /// set to zero.
    pub fn rt_solve(&self, c: &[f64], y: &mut [f64]) -> Result<(), LinalgError> {
        if y.len() < self.rank || c.len() < self.rank {
            return Err(LinalgError::DimensionMismatch {
                expected: self.rank,
                actual: y.len().min(c.len()),
            });
        }
        y.fill(0.0);
        for j in 0..self.rank {
            let mut sum = c[j];
            for i in 0..j {
                sum -= self.qr[(i, j)] * y[i];
            }
            y[j] = sum / self.diag[j];
        }
        Ok(())
    }

    /// Minimum-norm solution of `R x = c` when R has fewer independent rows
    /// than columns.
    ///
    /// R' is factorized in turn (`R' P2 = Q2 R2`), so that `R2' z = P2' c`
    /// is solved by forward substitution and `x = Q2 [z; 0]`. The inner
    /// factorization lives in `ws`.
    pub fn rank_deficient_r_solve(
        &self,
        c: &[f64],
        x: &mut [f64],
        ws: &mut QrWorkspace,
    ) -> Result<(), LinalgError> {
        let n = self.ncols();
        let rank = self.rank;
        check_len(x.len(), n)?;
        check_len(ws.ncols(), n)?;
        if c.len() < rank {
            return Err(LinalgError::DimensionMismatch {
                expected: rank,
                actual: c.len(),
            });
        }
        x.fill(0.0);
        if rank == 0 {
            return Ok(());
        }

        // R' padded with zero columns; pivoting reaches them only after the
        // first `rank` columns.
        ws.transposed.refactor_with(|t| {
            for i in 0..n {
                for j in 0..n {
                    t[(j, i)] = if i < rank { self.r(i, j) } else { 0.0 };
                }
            }
        })?;
        let inner = &ws.transposed;

        let stack = PodStack::new(&mut ws.buffer);
        let (rhs, stack) = stack.make_with(rank, |k| {
            let p = inner.perm.get(k);
            if p < rank {
                c[p]
            } else {
                0.0
            }
        });
        let (z, _) = stack.make_with(n, |_| 0.0f64);
        inner.rt_solve(rhs, &mut z[..rank])?;
        inner.q_b(z)?;
        self.perm.scatter(z, x);
        Ok(())
    }

    /// Least-squares solve of `A x = b` for the factorized `A`.
    ///
    /// `b` is overwritten with `Q' b`.
    pub fn solve(
        &self,
        b: &mut [f64],
        x: &mut [f64],
        ws: &mut QrWorkspace,
    ) -> Result<(), LinalgError> {
        self.qt_b(b)?;
        let full_rank = self.ncols() > 0 && self.diag[self.ncols() - 1] != 0.0;
        if full_rank {
            self.r_solve(b, x)
        } else {
            self.rank_deficient_r_solve(b, x, ws)
        }
    }

    /// `out = R P' x` for `x` in the caller's column order.
    pub fn r_mul(&self, x: &[f64], out: &mut [f64]) -> Result<(), LinalgError> {
        check_len(x.len(), self.ncols())?;
        if out.len() < self.rank {
            return Err(LinalgError::DimensionMismatch {
                expected: self.rank,
                actual: out.len(),
            });
        }
        out.fill(0.0);
        for (i, slot) in out.iter_mut().enumerate().take(self.rank) {
            let mut sum = 0.0;
            for j in i..self.ncols() {
                sum += self.r(i, j) * x[self.perm.get(j)];
            }
            *slot = sum;
        }
        Ok(())
    }

    /// Solves `[R; D] x = [c; 0]` in the least-squares sense without
    /// refactorizing.
    ///
    /// `d` is the diagonal of D in the caller's column order. Each nonzero
    /// `d[perm[j]]` is folded into R by Givens rotations, carrying the
    /// right-hand side along. On return `s` (`n x n`) holds the updated upper
    /// triangle S with `S' S = R' R + (P' D P)^2`, and `x` the solution in
    /// the caller's column order. R, the diagonal and `c` are left untouched.
    pub fn r_solve_with_update(
        &self,
        c: &[f64],
        d: &[f64],
        s: &mut Matrix,
        x: &mut [f64],
        ws: &mut QrWorkspace,
    ) -> Result<(), LinalgError> {
        let n = self.ncols();
        check_len(d.len(), n)?;
        check_len(x.len(), n)?;
        check_len(s.nrows(), n)?;
        check_len(s.ncols(), n)?;
        check_len(ws.ncols(), n)?;
        if c.len() < self.rank {
            return Err(LinalgError::DimensionMismatch {
                expected: self.rank,
                actual: c.len(),
            });
        }

        let stack = PodStack::new(&mut ws.buffer);
        let (row, stack) = stack.make_with(n, |_| 0.0f64);
        let (rhs, _) = stack.make_with(n, |i| if i < self.rank { c[i] } else { 0.0 });

        for j in 0..n {
            for i in 0..n {
                s[(i, j)] = self.r(i, j);
            }
        }

        for j in 0..n {
            let dj = d[self.perm.get(j)];
            if dj == 0.0 {
                continue;
            }
            row[j..].fill(0.0);
            row[j] = dj;
            let mut carried = 0.0;
            for k in j..n {
                if row[k] == 0.0 {
                    continue;
                }
                let (cos, sin) = givens(s[(k, k)], row[k]);
                s[(k, k)] = cos * s[(k, k)] + sin * row[k];
                let temp = cos * rhs[k] + sin * carried;
                carried = -sin * rhs[k] + cos * carried;
                rhs[k] = temp;
                for i in k + 1..n {
                    let temp = cos * s[(k, i)] + sin * row[i];
                    row[i] = -sin * s[(k, i)] + cos * row[i];
                    s[(k, i)] = temp;
                }
            }
        }

        let nsing = (0..n).position(|j| s[(j, j)] == 0.0).unwrap_or(n);
        x.fill(0.0);
        for j in (0..nsing).rev() {
            let mut sum = rhs[j];
            for i in j + 1..nsing {
                sum -= s[(j, i)] * x[self.perm.get(i)];
            }
            x[self.perm.get(j)] = sum / s[(j, j)];
        }
        Ok(())
    }
}

/// Reusable scratch for `rank_deficient_r_solve`, `r_solve_with_update` and
/// `solve`, sized for factorizations with a given number of columns.
pub struct QrWorkspace {
    transposed: QrFactorization,
    buffer: GlobalPodBuffer,
}

impl QrWorkspace {
    pub fn new(ncols: usize) -> Result<Self, LinalgError> {
        Ok(Self {
            transposed: QrFactorization::with_shape(ncols, ncols)?,
            buffer: scratch(&[ncols, ncols])?,
        })
    }

    pub fn ncols(&self) -> usize {
        self.transposed.ncols()
    }
}

/// Rotation `(cos, sin)` that zeroes `b` against `a`.
fn givens(a: f64, b: f64) -> (f64, f64) {
    if a.abs() < b.abs() {
        let cotan = a / b;
        let sin = 0.5 / (0.25 + 0.25 * cotan * cotan).sqrt();
        (sin * cotan, sin)
    } else {
        let tan = b / a;
        let cos = 0.5 / (0.25 + 0.25 * tan * tan).sqrt();
        (cos, cos * tan)
    }
}
