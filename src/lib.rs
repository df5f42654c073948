//! Weighted nonlinear least-squares fitting with a trust-region
//! Levenberg-Marquardt (LM) method.
//!
//! The fit minimizes `chi2(a) = sum_i ((Yi - Y(a)_i) / sigma_i)^2` over the
//! parameters `a`, where each target `Yi` can also be a one-sided bound on
//! the model value. Parameters may carry lower and upper limits.
//!
//! How it works (high level):
//! - Factor the weighted Jacobian with a column-pivoted Householder QR that
//!   detects numerical rank.
//! - Search the damping parameter so that the scaled step fits the trust
//!   radius, folding the damping into R with Givens rotations.
//! - Clamp the step into the limits, then grow or shrink the radius from the
//!   ratio of actual to predicted chi-square reduction.
//!
//! The dense kernel (`qr`, `QrFactorization`, `qr_solve`) is usable on its own.
//! Scratch space is sized up front: `qr` borrows a `PodStack` holding
//! `qr_req(ncols)`, and the solves that need more than R borrow a
//! `QrWorkspace`.
//!
//! Example:
//! ```rust,no_run
//! use lm_fit_rs::{JacobianMut, LevenbergMarquardt, Model, StopCriteria};
//!
//! /// y = a0 * x + a1
//! struct Line {
//!     x: Vec<f64>,
//! }
//!
//! impl Model for Line {
//!     type Error = std::convert::Infallible;
//!
//!     fn values(&mut self, a: &[f64], values: &mut [f64]) -> Result<(), Self::Error> {
//!         for (y, x) in values.iter_mut().zip(&self.x) {
//!             *y = a[0] * x + a[1];
//!         }
//!         Ok(())
//!     }
//!
//!     fn jacobian(&mut self, _a: &[f64], jac: &mut JacobianMut<'_>) -> Result<(), Self::Error> {
//!         jac.par_mut(0).copy_from_slice(&self.x);
//!         jac.par_mut(1).fill(1.0);
//!         Ok(())
//!     }
//! }
//!
//! let model = Line { x: vec![0.0, 1.0, 2.0] };
//! let mut fit = LevenbergMarquardt::new(model, vec![0.0, 0.0], vec![1.0, 3.0, 5.0], vec![1.0; 3]).unwrap();
//! fit.set_stop_criteria(StopCriteria { acceptable_chi_2: 1e-12, ..StopCriteria::default() });
//! let summary = fit.fit(100).unwrap();
//! assert!(summary.status.is_terminal());
//! ```

mod damping;
mod matrix;
mod qr;
mod report;
mod solver;

pub use matrix::{LinalgError, Matrix, Permutation};
pub use qr::{qr, qr_req, qr_solve, QrFactorization, QrWorkspace};
pub use report::{FitStats, FitSummary, IterationReport, Reporter, Status, StdoutReporter};
pub use solver::{
    FitError, Inequality, JacobianMut, LevenbergMarquardt, Model, SetupError, StopCriteria,
};
