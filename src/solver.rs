use core::fmt;

use std::time::{Duration, Instant};

use faer_core::mul::matmul;
use faer_core::{mat, Parallelism};

use crate::damping::{levenberg_step, DampingWorkspace, TrialOutcome, TrustRegion};
use crate::matrix::{try_filled, try_zeroed, LinalgError, Matrix};
use crate::qr::QrFactorization;
use crate::report::{
    emit_line, FitStats, FitSummary, IterationReport, Reporter, Status, StdoutReporter,
};

/// Errors while constructing or configuring a fit.
#[derive(Debug, Clone, PartialEq)]
pub enum SetupError {
    /// There must be at least one parameter and one point.
    InvalidDimensions { nb_par: usize, nb_points: usize },
    /// A per-parameter or per-point vector has the wrong length.
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    /// `sigma[index]` is zero.
    ZeroSigma { index: usize },
    /// `a_min[index] > a_max[index]`.
    InvalidLimits { index: usize, min: f64, max: f64 },
    /// Buffer allocation failed.
    Linalg(LinalgError),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDimensions { nb_par, nb_points } => {
                write!(f, "invalid dimensions: nb_par={nb_par}, nb_points={nb_points}")
            }
            Self::DimensionMismatch {
                what,
                expected,
                actual,
            } => write!(f, "{what} length {actual} does not match expected {expected}"),
            Self::ZeroSigma { index } => write!(f, "sigma[{index}] is zero"),
            Self::InvalidLimits { index, min, max } => {
                write!(f, "limits of parameter {index} are inverted: {min} > {max}")
            }
            Self::Linalg(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Linalg(err) => Some(err),
            _ => None,
        }
    }
}

impl From<LinalgError> for SetupError {
    fn from(err: LinalgError) -> Self {
        Self::Linalg(err)
    }
}

/// Errors from `prepare`, `iterate` and the other evaluating calls.
#[derive(Debug)]
pub enum FitError<E> {
    /// The model callback failed; the error is passed through unchanged.
    Model(E),
    /// The linear-algebra kernel failed.
    Linalg(LinalgError),
    /// `prepare` has not been called.
    NotPrepared,
    /// `prepare` was called twice.
    AlreadyPrepared,
}

impl<E: fmt::Display> fmt::Display for FitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Model(err) => write!(f, "model evaluation failed: {err}"),
            Self::Linalg(err) => write!(f, "linear algebra failure: {err}"),
            Self::NotPrepared => write!(f, "prepare() must be called before iterating"),
            Self::AlreadyPrepared => write!(f, "prepare() was already called"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for FitError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Model(err) => Some(err),
            Self::Linalg(err) => Some(err),
            _ => None,
        }
    }
}

impl<E> From<LinalgError> for FitError<E> {
    fn from(err: LinalgError) -> Self {
        Self::Linalg(err)
    }
}

/// How a target is compared with the model value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Inequality {
    /// The model should not exceed the target.
    Smaller,
    #[default]
    Equal,
    /// The model should not fall below the target.
    Larger,
}

impl Inequality {
    /// Whether a point contributes to chi-square for the given model value.
    pub fn is_active(self, value: f64, target: f64) -> bool {
        match self {
            Self::Smaller => value > target,
            Self::Equal => true,
            Self::Larger => value < target,
        }
    }
}

/// Stop criteria checked by `iterate`. A zero value disables a criterion.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StopCriteria {
    /// Stop when the gradient norm over free parameters is at most this.
    pub min_gradient: f64,
    /// Stop when chi-square is at most this.
    pub acceptable_chi_2: f64,
    /// Stop when an unbounded step reduces chi-square by a smaller fraction.
    pub min_chi_2_change: f64,
}

/// The model being fitted: values `Y = f(a)` and their derivatives.
pub trait Model {
    type Error;

    /// Fill `values` (one per point) for parameters `a`.
    fn values(&mut self, a: &[f64], values: &mut [f64]) -> Result<(), Self::Error>;

    /// Fill the derivative of every value with respect to every parameter.
    fn jacobian(&mut self, a: &[f64], jacobian: &mut JacobianMut<'_>) -> Result<(), Self::Error>;
}

/// Mutable view of the Jacobian, one slice of `nb_points` values per parameter.
///
/// The view is zeroed before each call to `Model::jacobian`.
pub struct JacobianMut<'a> {
    values: &'a mut Matrix,
}

impl<'a> JacobianMut<'a> {
    pub(crate) fn new(values: &'a mut Matrix) -> Self {
        Self { values }
    }

    pub fn nb_par(&self) -> usize {
        self.values.ncols()
    }

    pub fn nb_points(&self) -> usize {
        self.values.nrows()
    }

    /// Derivatives of all values with respect to parameter `par`.
    pub fn par_mut(&mut self, par: usize) -> &mut [f64] {
        self.values.col_mut(par)
    }

    pub fn set(&mut self, point: usize, par: usize, value: f64) {
        self.values[(point, par)] = value;
    }
}

enum ReporterSlot {
    External(Box<dyn Reporter>),
    Local(StdoutReporter),
    None,
}

impl ReporterSlot {
    fn as_mut(&mut self) -> Option<&mut dyn Reporter> {
        match self {
            Self::External(r) => Some(&mut **r),
            Self::Local(r) => Some(r),
            Self::None => None,
        }
    }
}

/// Trust-region Levenberg-Marquardt fit of a `Model` to weighted targets.
///
/// Call `prepare` once, then `iterate` until it returns a terminal `Status`
/// (or use `fit`). All buffers are sized at construction.
pub struct LevenbergMarquardt<M: Model> {
    model: M,
    nb_par: usize,
    nb_points: usize,
    a: Vec<f64>,
    trial_a: Vec<f64>,
    a_min: Vec<f64>,
    a_max: Vec<f64>,
    targets: Vec<f64>,
    sigma: Vec<f64>,
    inequalities: Vec<Inequality>,
    criteria: StopCriteria,
    values: Vec<f64>,
    trial_values: Vec<f64>,
    active: Vec<bool>,
    trial_active: Vec<bool>,
    jacobian: Matrix,
    weights: Vec<f64>,
    beta: Vec<f64>,
    free: Vec<bool>,
    nb_free: usize,
    rhs: Vec<f64>,
    fitted: Vec<f64>,
    factor: QrFactorization,
    trust: TrustRegion,
    damping: DampingWorkspace,
    da: Vec<f64>,
    chi_2: f64,
    norm_gradient: f64,
    prepared: bool,
    iteration: usize,
    stats: FitStats,
    reporter: ReporterSlot,
}

impl<M: Model> LevenbergMarquardt<M> {
    /// Create a fit of `model` starting from `a`, with one target and one
    /// non-zero weight `sigma` per point.
    pub fn new(
        model: M,
        a: Vec<f64>,
        targets: Vec<f64>,
        sigma: Vec<f64>,
    ) -> Result<Self, SetupError> {
        let nb_par = a.len();
        let nb_points = targets.len();
        if nb_par == 0 || nb_points == 0 {
            return Err(SetupError::InvalidDimensions { nb_par, nb_points });
        }
        if sigma.len() != nb_points {
            return Err(SetupError::DimensionMismatch {
                what: "sigma",
                expected: nb_points,
                actual: sigma.len(),
            });
        }
        if let Some(index) = sigma.iter().position(|&s| s == 0.0) {
            return Err(SetupError::ZeroSigma { index });
        }

        let nrows = nb_par.max(nb_points);
        Ok(Self {
            model,
            nb_par,
            nb_points,
            a,
            trial_a: try_zeroed(nb_par)?,
            a_min: try_filled(nb_par, f64::NEG_INFINITY)?,
            a_max: try_filled(nb_par, f64::INFINITY)?,
            targets,
            sigma,
            inequalities: try_filled(nb_points, Inequality::Equal)?,
            criteria: StopCriteria::default(),
            values: try_zeroed(nb_points)?,
            trial_values: try_zeroed(nb_points)?,
            active: try_filled(nb_points, true)?,
            trial_active: try_filled(nb_points, true)?,
            jacobian: Matrix::zeros(nb_points, nb_par)?,
            weights: try_zeroed(nb_points)?,
            beta: try_zeroed(nb_par)?,
            free: try_filled(nb_par, true)?,
            nb_free: nb_par,
            rhs: try_zeroed(nrows)?,
            fitted: try_zeroed(nb_par)?,
            factor: QrFactorization::with_shape(nrows, nb_par)?,
            trust: TrustRegion::new(nb_par)?,
            damping: DampingWorkspace::new(nb_par)?,
            da: try_zeroed(nb_par)?,
            chi_2: 0.0,
            norm_gradient: 0.0,
            prepared: false,
            iteration: 0,
            stats: FitStats::default(),
            reporter: ReporterSlot::None,
        })
    }

    pub fn set_stop_criteria(&mut self, criteria: StopCriteria) {
        self.criteria = criteria;
    }

    /// Set lower and upper limits; `None` leaves that side unbounded.
    pub fn set_limits(
        &mut self,
        a_min: Option<&[f64]>,
        a_max: Option<&[f64]>,
    ) -> Result<(), SetupError> {
        for (what, limits) in [("a_min", a_min), ("a_max", a_max)] {
            if let Some(limits) = limits {
                if limits.len() != self.nb_par {
                    return Err(SetupError::DimensionMismatch {
                        what,
                        expected: self.nb_par,
                        actual: limits.len(),
                    });
                }
            }
        }
        for par in 0..self.nb_par {
            let min = a_min.map_or(f64::NEG_INFINITY, |v| v[par]);
            let max = a_max.map_or(f64::INFINITY, |v| v[par]);
            if !(min <= max) {
                return Err(SetupError::InvalidLimits {
                    index: par,
                    min,
                    max,
                });
            }
        }
        match a_min {
            Some(v) => self.a_min.copy_from_slice(v),
            None => self.a_min.fill(f64::NEG_INFINITY),
        }
        match a_max {
            Some(v) => self.a_max.copy_from_slice(v),
            None => self.a_max.fill(f64::INFINITY),
        }
        Ok(())
    }

    /// Tag each target; `None` makes every target an equality.
    pub fn set_inequalities(&mut self, tags: Option<&[Inequality]>) -> Result<(), SetupError> {
        match tags {
            Some(tags) if tags.len() != self.nb_points => Err(SetupError::DimensionMismatch {
                what: "inequalities",
                expected: self.nb_points,
                actual: tags.len(),
            }),
            Some(tags) => {
                self.inequalities.copy_from_slice(tags);
                self.refresh_chi_2();
                Ok(())
            }
            None => {
                self.inequalities.fill(Inequality::Equal);
                self.refresh_chi_2();
                Ok(())
            }
        }
    }

    /// Print a table of trial steps when the fit terminates.
    pub fn set_verbose(&mut self, verbose: bool) {
        if verbose {
            if matches!(self.reporter, ReporterSlot::None) {
                self.reporter = ReporterSlot::Local(StdoutReporter::new());
            }
        } else if matches!(self.reporter, ReporterSlot::Local(_)) {
            self.reporter = ReporterSlot::None;
        }
    }

    pub fn set_reporter(&mut self, reporter: Box<dyn Reporter>) {
        self.reporter = ReporterSlot::External(reporter);
    }

    /// Evaluate the model at the starting parameters.
    ///
    /// Parameters outside their limits are clamped first.
    pub fn prepare(&mut self) -> Result<(), FitError<M::Error>> {
        if self.prepared {
            return Err(FitError::AlreadyPrepared);
        }
        for par in 0..self.nb_par {
            let clamped = self.a[par].max(self.a_min[par]).min(self.a_max[par]);
            if clamped != self.a[par] {
                log::warn!(
                    "parameter {par} = {} outside its limits, clamped to {clamped}",
                    self.a[par]
                );
                self.a[par] = clamped;
            }
        }
        self.model
            .values(&self.a, &mut self.values)
            .map_err(FitError::Model)?;
        self.stats.nb_f_eval += 1;
        self.prepared = true;
        self.refresh_chi_2();
        log::debug!("prepared fit: chi2 = {:.6e}", self.chi_2);
        Ok(())
    }

    /// Perform one outer iteration and report where the fit stands.
    ///
    /// On error the parameters are those of the last accepted step.
    pub fn iterate(&mut self) -> Result<Status, FitError<M::Error>> {
        if !self.prepared {
            return Err(FitError::NotPrepared);
        }
        self.iteration += 1;

        self.evaluate_jacobian()?;
        self.compute_gradient();

        self.nb_free = 0;
        for par in 0..self.nb_par {
            let stuck = (self.a[par] == self.a_max[par] && self.beta[par] > 0.0)
                || (self.a[par] == self.a_min[par] && self.beta[par] < 0.0);
            self.free[par] = !stuck;
            if stuck {
                log::debug!("parameter {par} is stuck at a limit");
            } else {
                self.nb_free += 1;
            }
        }
        if self.nb_free == 0 {
            return Ok(self.conclude(Status::AllParametersAreStuck));
        }

        self.norm_gradient = self
            .beta
            .iter()
            .zip(&self.free)
            .filter(|&(_, &free)| free)
            .map(|(b, _)| b * b)
            .sum::<f64>()
            .sqrt();
        if self.norm_gradient <= self.criteria.min_gradient {
            return Ok(self.conclude(Status::MinimumFound));
        }

        self.factorize()?;
        let full_rank = self.factor.rank() == self.nb_free;
        if !full_rank {
            log::debug!(
                "jacobian is rank deficient: rank {} for {} free parameters",
                self.factor.rank(),
                self.nb_free
            );
        }

        let first = !self.trust.is_initialized();
        self.trust.rescale(self.factor.norms(), &self.a);

        loop {
            levenberg_step(
                &self.factor,
                &self.rhs,
                full_rank,
                &mut self.trust,
                &mut self.damping,
                &mut self.da,
            )?;
            let bounded = self.apply_step();

            let step_norm = self.trust.scaled_norm(&self.da);
            if first && step_norm > 0.0 {
                self.trust.delta = self.trust.delta.min(step_norm);
            }

            self.model
                .values(&self.trial_a, &mut self.trial_values)
                .map_err(FitError::Model)?;
            self.stats.nb_f_eval += 1;
            let trial_chi_2 = chi_2_of(
                &self.targets,
                &self.sigma,
                &self.inequalities,
                &self.trial_values,
                &mut self.trial_active,
            );

            let outcome = self.trial_outcome(trial_chi_2, step_norm)?;
            let (alpha, delta) = (self.trust.alpha, self.trust.delta);
            let rho = self.trust.adapt(&outcome);
            let accepted = trial_chi_2 < self.chi_2;

            if let Some(reporter) = self.reporter.as_mut() {
                reporter.on_iteration(&IterationReport {
                    iteration: self.iteration,
                    chi_2: self.chi_2,
                    trial_chi_2,
                    rho,
                    alpha,
                    delta,
                    norm_gradient: self.norm_gradient,
                    accepted,
                    bounded,
                });
            }

            if accepted {
                let previous = self.chi_2;
                core::mem::swap(&mut self.a, &mut self.trial_a);
                core::mem::swap(&mut self.values, &mut self.trial_values);
                core::mem::swap(&mut self.active, &mut self.trial_active);
                self.chi_2 = trial_chi_2;

                let status = if self.chi_2 <= self.criteria.acceptable_chi_2 {
                    Status::Chi2IsOk
                } else if !bounded
                    && (previous - self.chi_2) / previous < self.criteria.min_chi_2_change
                {
                    Status::Chi2ChangeTooSmall
                } else {
                    Status::Improving
                };
                return Ok(self.conclude(status));
            }

            let xnorm = self.trust.scaled_norm(&self.a);
            if self.trust.delta <= f64::EPSILON * xnorm || self.trust.delta < f64::MIN_POSITIVE {
                return Ok(self.conclude(Status::DeltaIsTooSmall));
            }
        }
    }

    /// Prepare if needed, then iterate until a terminal status or
    /// `max_iterations` calls to `iterate`.
    pub fn fit(&mut self, max_iterations: usize) -> Result<FitSummary, FitError<M::Error>> {
        let start_time = matches!(self.reporter, ReporterSlot::Local(_)).then(Instant::now);
        if !self.prepared {
            self.prepare()?;
        }
        let mut status = Status::Improving;
        let mut iterations = 0;
        while iterations < max_iterations {
            status = self.iterate()?;
            iterations += 1;
            if status.is_terminal() {
                break;
            }
        }
        if !status.is_terminal() {
            if let Some(reporter) = self.reporter.as_mut() {
                reporter.on_finish(status);
            }
        }
        if let Some(start) = start_time {
            emit_line(&format!("time: {}", format_duration(start.elapsed())));
        }
        Ok(FitSummary {
            status,
            iterations,
            chi_2: self.chi_2,
            norm_gradient: self.norm_gradient,
            stats: self.stats,
        })
    }

    /// Correlation between the weighted sensitivities of each pair of
    /// parameters over the active points, at the current parameters.
    ///
    /// Entries involving a parameter whose sensitivity does not vary are 0.
    pub fn correlation_matrix(&mut self) -> Result<Matrix, FitError<M::Error>> {
        if !self.prepared {
            return Err(FitError::NotPrepared);
        }
        self.evaluate_jacobian()?;

        let nb_active = self.active.iter().filter(|&&a| a).count();
        let mut centered = Matrix::zeros(nb_active, self.nb_par)?;
        for par in 0..self.nb_par {
            let col = self.jacobian.col(par);
            let dst = centered.col_mut(par);
            let mut row = 0;
            for i in (0..self.nb_points).filter(|&i| self.active[i]) {
                dst[row] = col[i] / self.sigma[i];
                row += 1;
            }
            if nb_active > 0 {
                let mean = dst.iter().sum::<f64>() / nb_active as f64;
                for value in dst.iter_mut() {
                    *value -= mean;
                }
            }
        }

        let mut gram = Matrix::zeros(self.nb_par, self.nb_par)?;
        matmul(
            gram.as_faer_mut(),
            centered.as_faer().transpose(),
            centered.as_faer(),
            None,
            1.0,
            Parallelism::None,
        );

        let correlation = Matrix::from_fn(self.nb_par, self.nb_par, |i, j| {
            let (vi, vj) = (gram[(i, i)], gram[(j, j)]);
            if vi > 0.0 && vj > 0.0 {
                gram[(i, j)] / (vi * vj).sqrt()
            } else {
                0.0
            }
        })?;
        Ok(correlation)
    }

    pub fn chi_2(&self) -> f64 {
        self.chi_2
    }

    pub fn norm_gradient(&self) -> f64 {
        self.norm_gradient
    }

    pub fn stats(&self) -> FitStats {
        self.stats
    }

    pub fn parameters(&self) -> &[f64] {
        &self.a
    }

    /// Model values at the current parameters.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn delta(&self) -> f64 {
        self.trust.delta
    }

    pub fn alpha(&self) -> f64 {
        self.trust.alpha
    }

    /// Rank of the last factorized Jacobian.
    pub fn rank(&self) -> usize {
        self.factor.rank()
    }

    pub fn nb_free_parameters(&self) -> usize {
        self.nb_free
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    fn conclude(&mut self, status: Status) -> Status {
        if status.is_terminal() {
            log::debug!(
                "fit terminated after {} iterations: {} (chi2 = {:.6e})",
                self.iteration,
                status.as_str(),
                self.chi_2
            );
            if let Some(reporter) = self.reporter.as_mut() {
                reporter.on_finish(status);
            }
        }
        status
    }

    fn refresh_chi_2(&mut self) {
        if self.prepared {
            self.chi_2 = chi_2_of(
                &self.targets,
                &self.sigma,
                &self.inequalities,
                &self.values,
                &mut self.active,
            );
        }
    }

    fn evaluate_jacobian(&mut self) -> Result<(), FitError<M::Error>> {
        self.jacobian.fill(0.0);
        let mut jacobian = JacobianMut::new(&mut self.jacobian);
        self.model
            .jacobian(&self.a, &mut jacobian)
            .map_err(FitError::Model)?;
        self.stats.nb_df_eval += 1;
        Ok(())
    }

    // beta = J' (Yi - Y) / sigma^2 over the active points.
    fn compute_gradient(&mut self) {
        for i in 0..self.nb_points {
            self.weights[i] = if self.active[i] {
                (self.targets[i] - self.values[i]) / (self.sigma[i] * self.sigma[i])
            } else {
                0.0
            };
        }
        matmul(
            mat::from_column_major_slice_mut::<f64>(&mut self.beta, self.nb_par, 1),
            self.jacobian.as_faer().transpose(),
            mat::from_column_major_slice::<f64>(&self.weights, self.nb_points, 1),
            None,
            1.0,
            Parallelism::None,
        );
    }

    // Factorize the weighted Jacobian of the free parameters and leave
    // Q' b in `rhs`.
    fn factorize(&mut self) -> Result<(), LinalgError> {
        let jacobian = &self.jacobian;
        let (sigma, active, free) = (&self.sigma, &self.active, &self.free);
        self.factor.refactor_with(|a| {
            a.fill(0.0);
            for par in (0..jacobian.ncols()).filter(|&par| free[par]) {
                let src = jacobian.col(par);
                let dst = a.col_mut(par);
                for i in (0..src.len()).filter(|&i| active[i]) {
                    dst[i] = src[i] / sigma[i];
                }
            }
        })?;

        self.rhs.fill(0.0);
        for i in (0..self.nb_points).filter(|&i| self.active[i]) {
            self.rhs[i] = (self.targets[i] - self.values[i]) / self.sigma[i];
        }
        self.factor.qt_b(&mut self.rhs)
    }

    // Moves the trial parameters to a + da, clamping into the limits and
    // shortening da to match. Returns whether any parameter was clamped.
    fn apply_step(&mut self) -> bool {
        let mut bounded = false;
        for par in 0..self.nb_par {
            if !self.free[par] {
                self.da[par] = 0.0;
            }
            let mut next = self.a[par] + self.da[par];
            if next < self.a_min[par] {
                next = self.a_min[par];
                bounded = true;
            } else if next > self.a_max[par] {
                next = self.a_max[par];
                bounded = true;
            }
            self.da[par] = next - self.a[par];
            self.trial_a[par] = next;
        }
        bounded
    }

    fn trial_outcome(&mut self, trial_chi_2: f64, step_norm: f64) -> Result<TrialOutcome, LinalgError> {
        let chi_2 = self.chi_2;
        if chi_2 == 0.0 {
            return Ok(TrialOutcome {
                actual: if trial_chi_2 == 0.0 { 0.0 } else { -1.0 },
                predicted: 0.0,
                dirder: 0.0,
                step_norm,
                blew_up: trial_chi_2 > 0.0,
            });
        }
        // A NaN trial counts as a blow-up.
        let blew_up = !(0.01 * trial_chi_2 < chi_2);
        let actual = if blew_up { -1.0 } else { 1.0 - trial_chi_2 / chi_2 };

        // ||b||^2 - ||b - J da||^2 in the factored coordinates.
        self.factor.r_mul(&self.da, &mut self.fitted)?;
        let gain: f64 = (0..self.factor.rank())
            .map(|i| self.fitted[i] * (2.0 * self.rhs[i] - self.fitted[i]))
            .sum();
        let slope: f64 = self.da.iter().zip(&self.beta).map(|(d, b)| d * b).sum();

        Ok(TrialOutcome {
            actual,
            predicted: gain / chi_2,
            dirder: -slope / chi_2,
            step_norm,
            blew_up,
        })
    }
}

/// Chi-square over the points active for `values`, refreshing `active`.
fn chi_2_of(
    targets: &[f64],
    sigma: &[f64],
    inequalities: &[Inequality],
    values: &[f64],
    active: &mut [bool],
) -> f64 {
    let mut sum = 0.0;
    for i in 0..values.len() {
        active[i] = inequalities[i].is_active(values[i], targets[i]);
        if active[i] {
            let r = (targets[i] - values[i]) / sigma[i];
            sum += r * r;
        }
    }
    sum
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs >= 1.0 {
        format!("{:.3} s", secs)
    } else if secs >= 1e-3 {
        format!("{:.3} ms", secs * 1e3)
    } else if secs >= 1e-6 {
        format!("{:.3} us", secs * 1e6)
    } else {
        format!("{:.0} ns", secs * 1e9)
    }
}
