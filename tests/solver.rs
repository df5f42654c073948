use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::RefCell;
use std::convert::Infallible;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use lm_fit_rs::{
    FitError, FitSummary, Inequality, IterationReport, JacobianMut, LevenbergMarquardt, Model,
    Reporter, Status, StopCriteria,
};

struct CountingAlloc;

static ALLOC_TOTAL: AtomicUsize = AtomicUsize::new(0);

#[global_allocator]
static GLOBAL: CountingAlloc = CountingAlloc;

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() {
            ALLOC_TOTAL.fetch_add(layout.size(), Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc_zeroed(layout) };
        if !ptr.is_null() {
            ALLOC_TOTAL.fetch_add(layout.size(), Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe {
            System.dealloc(ptr, layout);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = unsafe { System.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() {
            ALLOC_TOTAL.fetch_add(new_size, Ordering::Relaxed);
        }
        new_ptr
    }
}

fn reset_alloc_counter() {
    ALLOC_TOTAL.store(0, Ordering::SeqCst);
}

fn allocated_bytes() -> usize {
    ALLOC_TOTAL.load(Ordering::SeqCst)
}

struct FnModel<V, J> {
    values: V,
    jacobian: J,
}

impl<V, J> Model for FnModel<V, J>
where
    V: FnMut(&[f64], &mut [f64]),
    J: FnMut(&[f64], &mut JacobianMut<'_>),
{
    type Error = Infallible;

    fn values(&mut self, a: &[f64], values: &mut [f64]) -> Result<(), Infallible> {
        (self.values)(a, values);
        Ok(())
    }

    fn jacobian(&mut self, a: &[f64], jacobian: &mut JacobianMut<'_>) -> Result<(), Infallible> {
        (self.jacobian)(a, jacobian);
        Ok(())
    }
}

fn stop_criteria() -> StopCriteria {
    StopCriteria {
        min_gradient: 1e-12,
        acceptable_chi_2: 1e-20,
        min_chi_2_change: 1e-14,
    }
}

/// Statuses a fit reaching an exact zero residual may end with.
const EXACT: &[Status] = &[Status::Chi2IsOk, Status::MinimumFound];

/// Statuses a fit with a nonzero residual at the optimum may end with.
const RESIDUAL: &[Status] = &[
    Status::MinimumFound,
    Status::Chi2ChangeTooSmall,
    Status::DeltaIsTooSmall,
];

fn assert_converged(status: Status, allowed: &[Status]) {
    assert!(allowed.contains(&status), "unexpected status: {status:?}");
}

fn line_model(x: Vec<f64>) -> impl Model<Error = Infallible> {
    let xs = x.clone();
    FnModel {
        values: move |a: &[f64], out: &mut [f64]| {
            for (y, t) in out.iter_mut().zip(&x) {
                *y = a[0] * t + a[1];
            }
        },
        jacobian: move |_a: &[f64], jac: &mut JacobianMut<'_>| {
            jac.par_mut(0).copy_from_slice(&xs);
            jac.par_mut(1).fill(1.0);
        },
    }
}

/// y = a0 at every point.
fn constant_model() -> impl Model<Error = Infallible> {
    FnModel {
        values: |a: &[f64], out: &mut [f64]| out.fill(a[0]),
        jacobian: |_a: &[f64], jac: &mut JacobianMut<'_>| jac.par_mut(0).fill(1.0),
    }
}

fn fit_model<M: Model<Error = Infallible>>(
    model: M,
    a0: Vec<f64>,
    targets: Vec<f64>,
) -> (Vec<f64>, FitSummary) {
    let sigma = vec![1.0; targets.len()];
    let mut fit = LevenbergMarquardt::new(model, a0, targets, sigma).unwrap();
    fit.set_stop_criteria(stop_criteria());
    let summary = fit.fit(200).unwrap();
    (fit.parameters().to_vec(), summary)
}

#[derive(Clone, Default)]
struct Recorder {
    rows: Rc<RefCell<Vec<IterationReport>>>,
    finished: Rc<RefCell<Vec<Status>>>,
}

impl Reporter for Recorder {
    fn on_iteration(&mut self, report: &IterationReport) {
        self.rows.borrow_mut().push(report.clone());
    }

    fn on_finish(&mut self, status: Status) {
        self.finished.borrow_mut().push(status);
    }
}

#[test]
fn straight_line_fit() {
    let (a, summary) = fit_model(line_model(vec![0.0, 1.0, 2.0]), vec![0.0, 0.0], vec![1.0, 3.0, 5.0]);
    assert_converged(summary.status, EXACT);
    assert!((a[0] - 2.0).abs() <= 1e-6);
    assert!((a[1] - 1.0).abs() <= 1e-6);
    assert!(summary.chi_2 <= 1e-10);
}

#[test]
fn straight_line_fit_with_default_criteria() {
    let mut fit = LevenbergMarquardt::new(
        line_model(vec![0.0, 1.0, 2.0]),
        vec![0.0, 0.0],
        vec![1.0, 3.0, 5.0],
        vec![1.0; 3],
    )
    .unwrap();
    let summary = fit.fit(100).unwrap();
    assert!(
        matches!(summary.status, Status::Chi2IsOk | Status::MinimumFound),
        "unexpected status: {:?}",
        summary.status
    );
    let a = fit.parameters();
    assert!((a[0] - 2.0).abs() <= 1e-9, "{a:?}");
    assert!((a[1] - 1.0).abs() <= 1e-9, "{a:?}");
    assert!(summary.chi_2 <= 1e-18);
}

#[test]
fn nonlinear_single_parameter() {
    let model = FnModel {
        values: |a: &[f64], out: &mut [f64]| out[0] = a[0] * a[0] * a[0],
        jacobian: |a: &[f64], jac: &mut JacobianMut<'_>| jac.set(0, 0, 3.0 * a[0] * a[0]),
    };
    let (a, summary) = fit_model(model, vec![0.5], vec![1.0]);
    assert_converged(summary.status, EXACT);
    assert!((a[0] - 1.0).abs() <= 1e-6);
}

#[test]
fn exponential_decay() {
    let t: Vec<f64> = (0..10).map(f64::from).collect();
    let targets: Vec<f64> = t.iter().map(|t| 2.0 * (-0.5 * t).exp()).collect();
    let ts = t.clone();
    let model = FnModel {
        values: move |a: &[f64], out: &mut [f64]| {
            for (y, t) in out.iter_mut().zip(&t) {
                *y = a[0] * (-a[1] * t).exp();
            }
        },
        jacobian: move |a: &[f64], jac: &mut JacobianMut<'_>| {
            for (i, t) in ts.iter().enumerate() {
                let e = (-a[1] * t).exp();
                jac.set(i, 0, e);
                jac.set(i, 1, -a[0] * t * e);
            }
        },
    };
    let (a, summary) = fit_model(model, vec![1.0, 0.1], targets);
    assert_converged(summary.status, EXACT);
    assert!((a[0] - 2.0).abs() <= 1e-6, "{a:?}");
    assert!((a[1] - 0.5).abs() <= 1e-6, "{a:?}");
}

#[test]
fn rosenbrock() {
    let model = FnModel {
        values: |a: &[f64], out: &mut [f64]| {
            out[0] = 1.0 - a[0];
            out[1] = 10.0 * (a[1] - a[0] * a[0]);
        },
        jacobian: |a: &[f64], jac: &mut JacobianMut<'_>| {
            jac.set(0, 0, -1.0);
            jac.set(1, 0, -20.0 * a[0]);
            jac.set(1, 1, 10.0);
        },
    };
    let (a, summary) = fit_model(model, vec![-1.2, 1.0], vec![0.0, 0.0]);
    assert_converged(summary.status, EXACT);
    assert!((a[0] - 1.0).abs() <= 1e-5);
    assert!((a[1] - 1.0).abs() <= 1e-5);
}

#[test]
fn weights_scale_residuals() {
    // Two conflicting targets for a constant; the tighter sigma wins.
    let mut fit = LevenbergMarquardt::new(constant_model(), vec![0.0], vec![0.0, 10.0], vec![1.0, 0.5])
        .unwrap();
    fit.set_stop_criteria(stop_criteria());
    let summary = fit.fit(200).unwrap();
    assert_converged(summary.status, RESIDUAL);
    // Minimizes a^2 + 4 (10 - a)^2.
    assert!((fit.parameters()[0] - 8.0).abs() <= 1e-6);
    assert!((fit.chi_2() - 80.0).abs() <= 1e-6);
}

#[test]
fn lower_limit_is_never_crossed() {
    let recorder = Recorder::default();
    let mut fit = LevenbergMarquardt::new(constant_model(), vec![1.0], vec![-1.0], vec![1.0]).unwrap();
    fit.set_limits(Some(&[0.0]), None).unwrap();
    fit.set_reporter(Box::new(recorder.clone()));
    fit.prepare().unwrap();

    let mut status = Status::Improving;
    for _ in 0..50 {
        status = fit.iterate().unwrap();
        assert!(fit.parameters()[0] >= 0.0);
        if status.is_terminal() {
            break;
        }
    }
    assert_eq!(status, Status::AllParametersAreStuck);
    assert_eq!(fit.parameters()[0], 0.0);
    assert_eq!(fit.nb_free_parameters(), 0);
    assert!(recorder.rows.borrow().iter().any(|row| row.bounded));
    assert_eq!(*recorder.finished.borrow(), vec![Status::AllParametersAreStuck]);
}

#[test]
fn starting_point_is_clamped_into_limits() {
    let mut fit = LevenbergMarquardt::new(constant_model(), vec![5.0], vec![1.0], vec![1.0]).unwrap();
    fit.set_limits(None, Some(&[2.0])).unwrap();
    fit.prepare().unwrap();
    assert_eq!(fit.parameters(), &[2.0]);
    assert_eq!(fit.values(), &[2.0]);
    assert_eq!(fit.chi_2(), 1.0);
}

#[test]
fn satisfied_smaller_target_is_ignored() {
    let mut fit = LevenbergMarquardt::new(constant_model(), vec![0.0], vec![1.0, 5.0], vec![1.0, 1.0])
        .unwrap();
    fit.set_inequalities(Some(&[Inequality::Equal, Inequality::Smaller]))
        .unwrap();
    fit.set_stop_criteria(stop_criteria());
    fit.prepare().unwrap();
    assert_eq!(fit.chi_2(), 1.0);
    let summary = fit.fit(200).unwrap();
    assert_converged(summary.status, EXACT);
    assert!((fit.parameters()[0] - 1.0).abs() <= 1e-6);
}

#[test]
fn violated_smaller_target_pulls_back() {
    let mut fit = LevenbergMarquardt::new(constant_model(), vec![0.0], vec![10.0, 5.0], vec![1.0, 1.0])
        .unwrap();
    fit.set_inequalities(Some(&[Inequality::Equal, Inequality::Smaller]))
        .unwrap();
    fit.set_stop_criteria(stop_criteria());
    let summary = fit.fit(200).unwrap();
    assert_converged(summary.status, RESIDUAL);
    // Both points are active past 5: (10 - a)^2 + (a - 5)^2.
    assert!((fit.parameters()[0] - 7.5).abs() <= 1e-6);
    assert!((summary.chi_2 - 12.5).abs() <= 1e-6);
}

#[test]
fn larger_target_acts_as_floor() {
    let mut fit = LevenbergMarquardt::new(constant_model(), vec![0.0], vec![-3.0, 2.0], vec![1.0, 1.0])
        .unwrap();
    fit.set_inequalities(Some(&[Inequality::Equal, Inequality::Larger]))
        .unwrap();
    fit.set_stop_criteria(stop_criteria());
    fit.fit(200).unwrap();
    // At a = 0 the floor is violated; the optimum balances both points.
    assert!((fit.parameters()[0] + 0.5).abs() <= 1e-6);
}

#[test]
fn chi_2_never_increases() {
    let recorder = Recorder::default();
    let t: Vec<f64> = (0..8).map(|i| 0.25 * f64::from(i)).collect();
    let targets: Vec<f64> = t.iter().map(|t| (1.3 * t).sin() + 0.2).collect();
    let ts = t.clone();
    let model = FnModel {
        values: move |a: &[f64], out: &mut [f64]| {
            for (y, t) in out.iter_mut().zip(&t) {
                *y = (a[0] * t).sin() + a[1];
            }
        },
        jacobian: move |a: &[f64], jac: &mut JacobianMut<'_>| {
            for (i, t) in ts.iter().enumerate() {
                jac.set(i, 0, t * (a[0] * t).cos());
                jac.set(i, 1, 1.0);
            }
        },
    };
    let mut fit = LevenbergMarquardt::new(model, vec![1.0, 0.0], targets, vec![0.1; 8]).unwrap();
    fit.set_stop_criteria(stop_criteria());
    fit.set_reporter(Box::new(recorder.clone()));
    fit.prepare().unwrap();

    let mut previous = fit.chi_2();
    for _ in 0..100 {
        let status = fit.iterate().unwrap();
        assert!(fit.chi_2() <= previous);
        previous = fit.chi_2();
        if status.is_terminal() {
            break;
        }
    }
    for row in recorder.rows.borrow().iter() {
        assert_eq!(row.accepted, row.trial_chi_2 < row.chi_2);
        assert!(row.delta > 0.0);
    }
    assert!((fit.parameters()[0] - 1.3).abs() <= 1e-5);
}

#[test]
fn duplicated_parameter_is_rank_deficient() {
    // y = (a0 + a1) x: only the sum is determined.
    let x = [1.0, 2.0, 3.0];
    let model = FnModel {
        values: move |a: &[f64], out: &mut [f64]| {
            for (y, x) in out.iter_mut().zip(&x) {
                *y = (a[0] + a[1]) * x;
            }
        },
        jacobian: move |_a: &[f64], jac: &mut JacobianMut<'_>| {
            jac.par_mut(0).copy_from_slice(&x);
            jac.par_mut(1).copy_from_slice(&x);
        },
    };
    let mut fit = LevenbergMarquardt::new(model, vec![0.0, 0.0], vec![3.0, 6.0, 9.0], vec![1.0; 3])
        .unwrap();
    fit.set_stop_criteria(stop_criteria());
    fit.prepare().unwrap();
    fit.iterate().unwrap();
    assert_eq!(fit.rank(), 1);
    assert_eq!(fit.nb_free_parameters(), 2);
    fit.fit(200).unwrap();
    let a = fit.parameters();
    assert!((a[0] + a[1] - 3.0).abs() <= 1e-6);
    assert!((a[0] - a[1]).abs() <= 1e-9);
}

#[test]
fn iterate_before_prepare_fails() {
    let mut fit = LevenbergMarquardt::new(constant_model(), vec![0.0], vec![1.0], vec![1.0]).unwrap();
    assert!(matches!(fit.iterate(), Err(FitError::NotPrepared)));
    assert!(matches!(fit.correlation_matrix(), Err(FitError::NotPrepared)));
}

#[test]
fn model_errors_are_passed_through() {
    struct Failing {
        calls: usize,
    }

    impl Model for Failing {
        type Error = String;

        fn values(&mut self, a: &[f64], values: &mut [f64]) -> Result<(), String> {
            self.calls += 1;
            if self.calls > 1 {
                return Err(format!("diverged at {}", a[0]));
            }
            values[0] = a[0];
            Ok(())
        }

        fn jacobian(&mut self, _a: &[f64], jac: &mut JacobianMut<'_>) -> Result<(), String> {
            jac.set(0, 0, 1.0);
            Ok(())
        }
    }

    let mut fit = LevenbergMarquardt::new(Failing { calls: 0 }, vec![0.0], vec![1.0], vec![1.0])
        .unwrap();
    fit.prepare().unwrap();
    match fit.iterate() {
        Err(FitError::Model(message)) => assert!(message.starts_with("diverged")),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(fit.parameters(), &[0.0]);
    assert_eq!(fit.into_model().calls, 2);
}

#[test]
fn correlation_of_polynomial_terms() {
    // y = a0 x + a1 x^2 + a2; the constant column has no variance.
    let x = [0.0, 1.0, 2.0, 3.0];
    let model = FnModel {
        values: move |a: &[f64], out: &mut [f64]| {
            for (y, x) in out.iter_mut().zip(&x) {
                *y = a[0] * x + a[1] * x * x + a[2];
            }
        },
        jacobian: move |_a: &[f64], jac: &mut JacobianMut<'_>| {
            for (i, x) in x.iter().enumerate() {
                jac.set(i, 0, *x);
                jac.set(i, 1, x * x);
                jac.set(i, 2, 1.0);
            }
        },
    };
    let mut fit =
        LevenbergMarquardt::new(model, vec![1.0, 1.0, 1.0], vec![0.0; 4], vec![1.0; 4]).unwrap();
    fit.prepare().unwrap();
    let corr = fit.correlation_matrix().unwrap();
    assert_eq!(corr.nrows(), 3);
    assert!((corr[(0, 0)] - 1.0).abs() < 1e-14);
    assert!((corr[(1, 1)] - 1.0).abs() < 1e-14);
    let expected = 15.0 / 245.0f64.sqrt();
    assert!((corr[(0, 1)] - expected).abs() < 1e-13);
    assert!((corr[(0, 1)] - corr[(1, 0)]).abs() < 1e-15);
    for k in 0..3 {
        assert_eq!(corr[(2, k)], 0.0);
        assert_eq!(corr[(k, 2)], 0.0);
    }
}

#[test]
fn stats_count_evaluations() {
    let mut fit = LevenbergMarquardt::new(
        line_model(vec![0.0, 1.0, 2.0]),
        vec![0.0, 0.0],
        vec![1.0, 3.0, 5.0],
        vec![1.0; 3],
    )
    .unwrap();
    fit.set_stop_criteria(stop_criteria());
    let summary = fit.fit(200).unwrap();
    assert_eq!(summary.stats.nb_df_eval, summary.iterations);
    assert!(summary.stats.nb_f_eval >= summary.iterations);
    assert_eq!(fit.iteration(), summary.iterations);
    assert_eq!(fit.stats(), summary.stats);
}

#[test]
fn allocations() {
    let mut fit = LevenbergMarquardt::new(constant_model(), vec![0.0], vec![2.0], vec![1.0]).unwrap();
    fit.set_stop_criteria(stop_criteria());
    fit.prepare().unwrap();
    reset_alloc_counter();
    fit.fit(200).unwrap();
    let alloc = allocated_bytes();
    assert!(alloc <= 50_000, "allocations too high: {alloc}");
}
