//! The dual-rate step loop and its diagnostics.
//!
//! [`Harness::run`] drives the slow integrator across the problem
//! interval one slow step at a time. Before every slow step the reference
//! solver is restarted from the slow integrator's current state, so each
//! measured error is the local error of that single step rather than an
//! accumulated drift. Squared errors are averaged into RMS figures and
//! the worst-case ratio of error to the tolerance profile is tracked
//! across the whole run.

use std::fmt;

use thiserror::Error;

use crate::config::{ConfigError, RunConfig};
use crate::controller::{
    build_controller, build_slow_control, ControllerError, ControllerFamily, SENTINEL,
};
use crate::multirate::{FastIntegrator, MultirateIntegrator};
use crate::problem::{self, initial_state};
use crate::rk::{tableau_for_order, ErkIntegrator, StepError, RK45};
use crate::{OdeIntegrate, RunStatistics};

pub const T0: f64 = 0.;
pub const TF: f64 = 5.;
pub const REPORT_INTERVALS: usize = 20;
/// The run terminates once the remaining interval drops below this.
const TERMINATION_SLACK: f64 = 1e-8;

const REFERENCE_RTOL: f64 = 1e-10;
const REFERENCE_ATOL: f64 = 1e-12;
const REFERENCE_MAX_STEPS: u64 = 10_000_000;
const FAST_MAX_STEPS: u64 = 1_000_000;
const SLOW_MAX_STEPS: u64 = 100_000;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),
    #[error("controller setup failed: {0}")]
    Controller(#[from] ControllerError),
    #[error("integration failed: {0}")]
    Step(#[from] StepError),
}

/// One report-interval table row.
#[derive(Clone, Copy, Debug)]
pub struct ProgressRow {
    pub t: f64,
    pub u: f64,
    pub v: f64,
    pub uerr: f64,
    pub verr: f64,
}

pub fn table_header() -> &'static str {
    "        t           u           v       uerr      verr"
}

impl fmt::Display for ProgressRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:10.6}  {:10.6}  {:10.6}  {:.2e}  {:.2e}",
            self.t, self.u, self.v, self.uerr, self.verr
        )
    }
}

/// Final diagnostics of one run.
#[derive(Clone, Copy, Debug)]
pub struct RunSummary {
    pub slow: RunStatistics,
    pub fast: Option<RunStatistics>,
    pub reference: RunStatistics,
    /// RMS of per-step u errors against the reference.
    pub rms_u: f64,
    /// RMS of per-step v errors against the reference.
    pub rms_v: f64,
    /// RMS over both components.
    pub rms_total: f64,
    /// Worst ratio of a per-step error to its tolerance profile
    /// `atol + rtol * |y_ref|` over the whole run.
    pub worst_accuracy: f64,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Final Solver Statistics:")?;
        writeln!(
            f,
            "  Slow steps = {} (attempts = {}, fails = {})",
            self.slow.steps, self.slow.attempts, self.slow.err_test_fails
        )?;
        if let Some(fast) = &self.fast {
            writeln!(
                f,
                "  Fast steps = {} (attempts = {}, fails = {})",
                fast.steps, fast.attempts, fast.err_test_fails
            )?;
        }
        writeln!(
            f,
            "  u error rms = {:.3e}, v error rms = {:.3e}, total = {:.3e}",
            self.rms_u, self.rms_v, self.rms_total
        )?;
        writeln!(f, "  Relative accuracy = {:.3e}", self.worst_accuracy)?;
        write!(
            f,
            "  RHS evals: slow = {}, implicit = {}, fast = {}",
            self.slow.rhs_evals,
            self.slow.implicit_rhs_evals,
            self.fast.map(|s| s.rhs_evals).unwrap_or(0)
        )?;
        if self.slow.newton_iters > 0 {
            write!(
                f,
                "\n  Newton iters = {}, fails = {}, Jacobian evals = {}",
                self.slow.newton_iters, self.slow.newton_fails, self.slow.jac_evals
            )?;
        }
        Ok(())
    }
}

pub struct Harness {
    cfg: RunConfig,
    slow: MultirateIntegrator,
    reference: ErkIntegrator<problem::RhsFn>,
}

impl Harness {
    /// Validates the configuration and assembles the slow, fast, and
    /// reference integrators.
    pub fn from_config(cfg: RunConfig) -> Result<Self, HarnessError> {
        cfg.validate()?;

        let params = cfg.problem_params();
        let method = cfg.lookup_method()?;
        let fast_active = cfg.fast_active();
        let ops = problem::select(params, method.class, fast_active);
        let y0 = initial_state(&params);

        let fast = if fast_active {
            let tableau = tableau_for_order(cfg.fast_order)
                .ok_or(ConfigError::UnsupportedFastOrder(cfg.fast_order))?;
            let family = cfg
                .fast_family()
                .ok_or(ConfigError::UnknownFastController(cfg.fcontrol))?;
            let ctrl = build_controller(family, &cfg.fast_gains, cfg.bias)?;
            let mut fast: FastIntegrator = ErkIntegrator::new(
                problem::fast_rhs(params),
                tableau,
                T0,
                y0.clone(),
                cfg.fast_rtol,
                cfg.atol,
                ctrl,
            );
            fast.set_max_steps(FAST_MAX_STEPS);
            fast.set_use_method_order(cfg.fast_pq);
            if let Some(mode) = cfg.accum_mode() {
                fast.set_accumulation_mode(mode);
            }
            if cfg.fcontrol == 0 {
                fast.set_fixed_step(Some(cfg.hf));
            } else if cfg.set_h0 {
                fast.set_initial_step(Some(cfg.hf));
            }
            Some(fast)
        } else {
            None
        };

        let selection = cfg
            .slow_selection()
            .ok_or(ConfigError::UnknownSlowController(cfg.scontrol))?;
        let control = build_slow_control(
            selection,
            &cfg.slow_gains,
            cfg.bias,
            cfg.htol_relch,
            cfg.htol_minfac,
            cfg.htol_maxfac,
        )?;

        // Fixed mode and explicit seeding take hs; otherwise the slow
        // integrator picks its own first step.
        let h0 = if cfg.scontrol == 0 || cfg.set_h0 {
            Some(cfg.hs)
        } else {
            None
        };
        let mut slow = MultirateIntegrator::new(
            method,
            ops,
            fast,
            control,
            T0,
            y0.clone(),
            cfg.rtol,
            cfg.atol,
            h0,
        );
        slow.set_max_steps(SLOW_MAX_STEPS);
        slow.set_use_method_order(cfg.slow_pq);
        if cfg.safety != SENTINEL {
            slow.set_safety(cfg.safety);
        }
        if cfg.scontrol == 0 {
            slow.set_fixed_step(Some(cfg.hs));
        }

        let ref_ctrl = build_controller(ControllerFamily::I, &[], SENTINEL)?;
        let mut reference = ErkIntegrator::new(
            problem::full_rhs(params),
            &RK45,
            T0,
            y0,
            REFERENCE_RTOL,
            REFERENCE_ATOL,
            ref_ctrl,
        );
        reference.set_max_steps(REFERENCE_MAX_STEPS);

        Ok(Harness {
            cfg,
            slow,
            reference,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.cfg
    }

    /// Drives the loop to completion, invoking `on_row` once per report
    /// interval, and returns the final diagnostics.
    pub fn run<R>(&mut self, mut on_row: R) -> Result<RunSummary, HarnessError>
    where
        R: FnMut(&ProgressRow),
    {
        let dt_out = (TF - T0) / REPORT_INTERVALS as f64;
        let mut tout = T0 + dt_out;
        let mut t = T0;

        let mut uerr_sq = 0.;
        let mut verr_sq = 0.;
        let mut worst = 0.;
        let mut measured_steps = 0u64;

        on_row(&ProgressRow {
            t,
            u: self.slow.state()[0],
            v: self.slow.state()[1],
            uerr: 0.,
            verr: 0.,
        });

        while TF - t > TERMINATION_SLACK {
            if measured_steps >= SLOW_MAX_STEPS {
                return Err(StepError::TooManySteps {
                    limit: SLOW_MAX_STEPS,
                    t_out: TF,
                }
                .into());
            }

            // Restart the reference from the pre-step state so the
            // measurement below is this step's local error.
            self.reference.reset(t, self.slow.state());
            self.slow.set_stop_time(tout);
            t = self.slow.step()?;
            self.reference.evolve_to(t)?;

            let y = self.slow.state();
            let y_ref = self.reference.state();
            let uerr = (y[0] - y_ref[0]).abs();
            let verr = (y[1] - y_ref[1]).abs();
            uerr_sq += uerr * uerr;
            verr_sq += verr * verr;
            measured_steps += 1;

            let u_acc = uerr / (self.cfg.atol + self.cfg.rtol * y_ref[0].abs());
            let v_acc = verr / (self.cfg.atol + self.cfg.rtol * y_ref[1].abs());
            worst = f64::max(worst, u_acc.max(v_acc));

            log::debug!(
                "slow step to t = {:.6}: uerr = {:.2e}, verr = {:.2e}",
                t,
                uerr,
                verr
            );

            if tout - t < TERMINATION_SLACK {
                on_row(&ProgressRow {
                    t,
                    u: y[0],
                    v: y[1],
                    uerr,
                    verr,
                });
                tout = (tout + dt_out).min(TF);
            }
        }

        let n = measured_steps.max(1) as f64;
        Ok(RunSummary {
            slow: *self.slow.statistics(),
            fast: self.slow.fast_statistics().copied(),
            reference: *self.reference.statistics(),
            rms_u: (uerr_sq / n).sqrt(),
            rms_v: (verr_sq / n).sqrt(),
            rms_total: ((uerr_sq + verr_sq) / (2. * n)).sqrt(),
            worst_accuracy: worst,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_from_default_config() {
        let harness = Harness::from_config(RunConfig::default());
        assert!(harness.is_ok());
    }

    #[test]
    fn rejects_invalid_config() {
        let mut cfg = RunConfig::default();
        cfg.rtol = 1.5;
        assert!(matches!(
            Harness::from_config(cfg),
            Err(HarnessError::Config(_))
        ));
    }

    #[test]
    fn row_formatting_is_tabular() {
        let row = ProgressRow {
            t: 0.25,
            u: 1.7,
            v: 1.3,
            uerr: 1.2e-6,
            verr: 3.4e-5,
        };
        let line = row.to_string();
        assert!(line.contains("0.250000"));
        assert!(line.contains("1.20e-6"));
        assert!(line.contains("3.40e-5"));
    }
}
