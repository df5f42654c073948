//! Trust-region bookkeeping and the search for the Levenberg parameter.

use crate::matrix::{try_zeroed, LinalgError, Matrix};
use crate::qr::{QrFactorization, QrWorkspace};

/// Initial radius as a fraction of `||D a||`.
const INITIAL_DELTA_FACTOR: f64 = 0.1;
/// Relative tolerance on `||D x|| - Delta`.
const DELTA_TOLERANCE: f64 = 0.1;
const MAX_SEARCH_STEPS: usize = 10;

/// Trust-region state that survives between iterations.
#[derive(Debug, Clone)]
pub(crate) struct TrustRegion {
    pub(crate) delta: f64,
    pub(crate) alpha: f64,
    /// Per-parameter scaling, never decreasing.
    pub(crate) d: Vec<f64>,
    initialized: bool,
}

impl TrustRegion {
    pub(crate) fn new(nb_par: usize) -> Result<Self, LinalgError> {
        Ok(Self {
            delta: 0.0,
            alpha: 0.0,
            d: try_zeroed(nb_par)?,
            initialized: false,
        })
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Folds the latest column norms into D. The first call also sets Delta.
    pub(crate) fn rescale(&mut self, norms: &[f64], a: &[f64]) {
        if !self.initialized {
            for (d, &norm) in self.d.iter_mut().zip(norms) {
                *d = if norm == 0.0 { 1.0 } else { norm };
            }
            let xnorm = self.scaled_norm(a);
            self.delta = if xnorm == 0.0 {
                INITIAL_DELTA_FACTOR
            } else {
                INITIAL_DELTA_FACTOR * xnorm
            };
            self.initialized = true;
        } else {
            for (d, &norm) in self.d.iter_mut().zip(norms) {
                *d = d.max(norm);
            }
        }
    }

    /// `||D v||`.
    pub(crate) fn scaled_norm(&self, v: &[f64]) -> f64 {
        self.d
            .iter()
            .zip(v)
            .map(|(d, x)| (d * x) * (d * x))
            .sum::<f64>()
            .sqrt()
    }

    /// Adjusts Delta and alpha from the outcome of a trial step and returns
    /// the agreement ratio rho.
    pub(crate) fn adapt(&mut self, trial: &TrialOutcome) -> f64 {
        let rho = if trial.predicted > 0.0 {
            trial.actual / trial.predicted
        } else {
            0.0
        };
        if rho <= 0.25 {
            let mut mu = if trial.actual >= 0.0 {
                0.5
            } else {
                0.5 * trial.dirder / (trial.dirder + 0.5 * trial.actual)
            };
            if trial.blew_up || mu.is_nan() || mu < 0.1 {
                mu = 0.1;
            }
            self.delta = mu * self.delta.min(trial.step_norm / 0.1);
            self.alpha /= mu;
        } else if self.alpha == 0.0 || rho >= 0.75 {
            self.delta = trial.step_norm / 0.5;
            self.alpha *= 0.5;
        }
        rho
    }
}

/// Outcome of one trial step, as seen by the radius update.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TrialOutcome {
    /// Actual reduction, relative to the current chi-square.
    pub(crate) actual: f64,
    /// Reduction predicted by the linear model, same scale.
    pub(crate) predicted: f64,
    /// Directional derivative of the normalized chi-square along the step.
    pub(crate) dirder: f64,
    /// `||D da||`.
    pub(crate) step_norm: f64,
    /// The trial chi-square exceeds a hundred times the current one.
    pub(crate) blew_up: bool,
}

/// Buffers for the parameter search, sized once per fit.
pub(crate) struct DampingWorkspace {
    scaled: Vec<f64>,
    work: Vec<f64>,
    damping: Vec<f64>,
    s: Matrix,
    qr: QrWorkspace,
}

impl DampingWorkspace {
    pub(crate) fn new(nb_par: usize) -> Result<Self, LinalgError> {
        Ok(Self {
            scaled: try_zeroed(nb_par)?,
            work: try_zeroed(nb_par)?,
            damping: try_zeroed(nb_par)?,
            s: Matrix::zeros(nb_par, nb_par)?,
            qr: QrWorkspace::new(nb_par)?,
        })
    }
}

/// Bounds on alpha, scoped to one search.
#[derive(Debug, Clone, Copy, PartialEq)]
struct DampingSearch {
    lower: f64,
    upper: f64,
}

impl DampingSearch {
    /// Clamps the previous alpha into the bounds; falls back to
    /// `gnorm / dxnorm` when that leaves zero.
    fn starting_alpha(&self, previous: f64, gnorm: f64, dxnorm: f64) -> f64 {
        let alpha = previous.max(self.lower).min(self.upper);
        if alpha == 0.0 {
            gnorm / dxnorm
        } else {
            alpha
        }
    }

    /// Keeps alpha away from exactly zero inside the loop.
    fn nonzero(&self, alpha: f64) -> f64 {
        if alpha == 0.0 {
            f64::MIN_POSITIVE.max(0.001 * self.upper)
        } else {
            alpha
        }
    }

    fn narrow(&mut self, alpha: f64, fp: f64) {
        if fp > 0.0 {
            self.lower = self.lower.max(alpha);
        }
        if fp < 0.0 {
            self.upper = self.upper.min(alpha);
        }
    }
}

/// Finds `alpha >= 0` such that the step `x` solving
/// `min ||[R; sqrt(alpha) D] x - [c; 0]||` has `||D x||` within 10% of Delta,
/// or `alpha = 0` when the Gauss-Newton step already fits.
///
/// `full_rank` selects back substitution over the minimum-norm solve for the
/// Gauss-Newton step. Updates `trust.alpha`; writes the step into `x` in the
/// caller's parameter order.
pub(crate) fn levenberg_step(
    factor: &QrFactorization,
    c: &[f64],
    full_rank: bool,
    trust: &mut TrustRegion,
    ws: &mut DampingWorkspace,
    x: &mut [f64],
) -> Result<(), LinalgError> {
    let n = factor.ncols();
    let rank = factor.rank();
    let perm = factor.perm();
    let delta = trust.delta;

    if rank == 0 {
        x.fill(0.0);
    } else if full_rank {
        factor.r_solve(c, x)?;
    } else {
        factor.rank_deficient_r_solve(c, x, &mut ws.qr)?;
    }

    let mut dxnorm = scale_into(&trust.d, x, &mut ws.scaled);
    let mut fp = dxnorm - delta;
    if fp <= DELTA_TOLERANCE * delta {
        log::trace!("gauss-newton step fits the trust region: |Dx| = {dxnorm:.3e}");
        trust.alpha = 0.0;
        return Ok(());
    }

    // Newton step on the secular equation at alpha = 0 gives a lower bound,
    // available only when R is invertible on the free columns.
    let mut lower = 0.0;
    if full_rank {
        for j in 0..rank {
            let l = perm.get(j);
            ws.work[j] = trust.d[l] * (ws.scaled[l] / dxnorm);
        }
        factor.rt_solve(&ws.work[..rank], &mut ws.damping[..rank])?;
        let temp = norm(&ws.damping[..rank]);
        if temp > 0.0 {
            lower = ((fp / delta) / temp) / temp;
        }
    }

    for j in 0..n {
        let mut sum = 0.0;
        for i in 0..rank.min(j + 1) {
            sum += factor.r(i, j) * c[i];
        }
        ws.work[j] = sum / trust.d[perm.get(j)];
    }
    let gnorm = norm(&ws.work);
    let mut upper = gnorm / delta;
    if upper == 0.0 {
        upper = f64::MIN_POSITIVE / delta.min(DELTA_TOLERANCE);
    }

    let mut search = DampingSearch { lower, upper };
    let mut alpha = search.starting_alpha(trust.alpha, gnorm, dxnorm);

    for step in 1..=MAX_SEARCH_STEPS {
        alpha = search.nonzero(alpha);
        let root = alpha.sqrt();
        for (slot, &d) in ws.damping.iter_mut().zip(&trust.d) {
            *slot = root * d;
        }
        factor.r_solve_with_update(c, &ws.damping, &mut ws.s, x, &mut ws.qr)?;

        dxnorm = scale_into(&trust.d, x, &mut ws.scaled);
        let previous = fp;
        fp = dxnorm - delta;
        log::trace!(
            "damping search {step}: alpha = {alpha:.3e}, |Dx| = {dxnorm:.3e}, delta = {delta:.3e}"
        );

        if fp.abs() <= DELTA_TOLERANCE * delta
            || (search.lower == 0.0 && fp <= previous && previous < 0.0)
            || step == MAX_SEARCH_STEPS
            || dxnorm == 0.0
        {
            break;
        }

        // Newton correction, with the derivative obtained from S' z = D' D x / |Dx|.
        for j in 0..n {
            let l = perm.get(j);
            ws.work[j] = trust.d[l] * (ws.scaled[l] / dxnorm);
        }
        for j in 0..n {
            ws.work[j] /= ws.s[(j, j)];
            let temp = ws.work[j];
            for i in j + 1..n {
                ws.work[i] -= ws.s[(j, i)] * temp;
            }
        }
        let temp = norm(&ws.work);
        let correction = ((fp / delta) / temp) / temp;

        search.narrow(alpha, fp);
        alpha = search.lower.max(alpha + correction);
    }

    trust.alpha = alpha;
    Ok(())
}

fn scale_into(d: &[f64], x: &[f64], out: &mut [f64]) -> f64 {
    for ((slot, &di), &xi) in out.iter_mut().zip(d).zip(x) {
        *slot = di * xi;
    }
    norm(out)
}

fn norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}
