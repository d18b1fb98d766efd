//! End-to-end runs of the dual-rate harness.

use approx::assert_relative_eq;

use ndarray_multirate::config::RunConfig;
use ndarray_multirate::controller::{build_controller, ControllerFamily, SENTINEL};
use ndarray_multirate::harness::{Harness, HarnessError, TF};
use ndarray_multirate::problem::{self, ProblemParams};
use ndarray_multirate::rk::{ErkIntegrator, RK45};
use ndarray_multirate::OdeIntegrate;

#[test]
fn default_adaptive_run_stays_within_accuracy_bound() {
    let mut harness = Harness::from_config(RunConfig::default()).unwrap();
    let mut rows = 0;
    let summary = harness.run(|_| rows += 1).unwrap();

    assert!(summary.slow.steps > 0);
    assert!(summary.fast.unwrap().steps > 0);
    // Per-step errors are measured against a resynchronized reference,
    // so they should sit within a small multiple of the tolerance.
    assert!(
        summary.worst_accuracy <= 10.,
        "worst accuracy {} out of bounds",
        summary.worst_accuracy
    );
    assert!(summary.rms_total > 0.);
    // Initial row plus one per report interval.
    assert_eq!(rows, 21);
}

#[test]
fn fixed_step_run_takes_exactly_500_slow_steps() {
    let mut cfg = RunConfig::default();
    cfg.scontrol = 0;
    cfg.fcontrol = 0;
    cfg.hs = 0.01;
    cfg.hf = 1e-4;
    let mut harness = Harness::from_config(cfg).unwrap();
    let summary = harness.run(|_| {}).unwrap();

    assert_eq!(summary.slow.steps, 500);
    assert_eq!(summary.slow.err_test_fails, 0);
    let fast = summary.fast.unwrap();
    assert!(fast.steps > 0);
    assert_eq!(fast.err_test_fails, 0);
}

#[test]
fn htol_paired_run_completes() {
    let mut cfg = RunConfig::default();
    cfg.scontrol = 5;
    let mut harness = Harness::from_config(cfg).unwrap();
    let mut last_t = 0.;
    let summary = harness.run(|row| last_t = row.t).unwrap();

    assert_relative_eq!(last_t, TF, epsilon = 1e-8);
    assert!(summary.slow.steps > 0);
    assert!(summary.worst_accuracy.is_finite());
}

#[test]
fn implicit_slow_method_runs_with_newton() {
    let mut cfg = RunConfig::default();
    cfg.method = "esdirk34".to_string();
    let mut harness = Harness::from_config(cfg).unwrap();
    let summary = harness.run(|_| {}).unwrap();

    assert!(summary.slow.steps > 0);
    assert!(summary.slow.newton_iters > 0);
    assert!(summary.slow.jac_evals > 0);
}

#[test]
fn imex_slow_method_runs() {
    let mut cfg = RunConfig::default();
    cfg.method = "imex-sr21".to_string();
    let mut harness = Harness::from_config(cfg).unwrap();
    let summary = harness.run(|_| {}).unwrap();

    assert!(summary.slow.steps > 0);
    assert!(summary.slow.implicit_rhs_evals > 0);
}

#[test]
fn single_rate_run_solves_full_system() {
    let mut cfg = RunConfig::default();
    cfg.fast_order = 0;
    cfg.rtol = 1e-6;
    let mut harness = Harness::from_config(cfg).unwrap();
    let summary = harness.run(|_| {}).unwrap();

    assert!(summary.fast.is_none());
    assert!(summary.slow.steps > 0);
    assert!(summary.worst_accuracy <= 10.);
    // The error estimate should track the kernel's real accuracy, not
    // oscillate between acceptance and rejection.
    assert!(summary.slow.err_test_fails < summary.slow.steps);
}

#[test]
fn explicit_seeding_applies_to_both_scales() {
    let mut cfg = RunConfig::default();
    cfg.set_h0 = true;
    cfg.hs = 1e-3;
    cfg.hf = 1e-5;
    let mut harness = Harness::from_config(cfg).unwrap();
    let summary = harness.run(|_| {}).unwrap();

    assert!(summary.slow.steps > 0);
    assert!(summary.fast.unwrap().steps > 0);
    assert!(summary.worst_accuracy.is_finite());
}

#[test]
fn tightly_toleranced_solver_matches_analytic_solution() {
    let params = ProblemParams::default();
    let ctrl = build_controller(ControllerFamily::I, &[], SENTINEL).unwrap();
    let mut reference = ErkIntegrator::new(
        problem::full_rhs(params),
        &RK45,
        0.,
        problem::initial_state(&params),
        1e-10,
        1e-12,
        ctrl,
    );
    reference.set_max_steps(10_000_000);
    reference.evolve_to(1.).unwrap();

    assert_relative_eq!(
        reference.state()[0],
        problem::utrue(1.),
        max_relative = 1e-7
    );
    assert_relative_eq!(
        reference.state()[1],
        problem::vtrue(&params, 1.),
        max_relative = 1e-6
    );
}

#[test]
fn invalid_tolerance_is_rejected_before_integration() {
    let mut cfg = RunConfig::default();
    cfg.rtol = 1.5;
    assert!(matches!(
        Harness::from_config(cfg),
        Err(HarnessError::Config(_))
    ));
}
