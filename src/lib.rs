//! Multirate adaptive integration harness for the coupled
//! Kvaerno–Prothero–Robinson test system.
//!
//! A slow integrator advances the stiff, slowly varying component of the
//! system while delegating the tightly oscillating component to an inner
//! fast integrator that sub-steps within each slow step. Both time scales
//! carry independently selectable error-feedback step controllers (see
//! [`controller`]), and the result of every slow step is measured against
//! a tightly toleranced reference solve restarted from the same state.

pub mod config;
pub mod controller;
pub mod harness;
pub mod multirate;
pub mod problem;
pub mod rk;

use ndarray::prelude::*;

use crate::rk::StepError;

/// Per-integrator counters, zeroed at creation and incremented by every
/// evolve call. Newton and Jacobian counts stay zero for explicit methods.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunStatistics {
    /// Accepted steps.
    pub steps: u64,
    /// Attempted steps, including rejected ones.
    pub attempts: u64,
    /// Steps rejected by the local error test.
    pub err_test_fails: u64,
    /// Explicit right-hand-side evaluations.
    pub rhs_evals: u64,
    /// Implicit right-hand-side evaluations.
    pub implicit_rhs_evals: u64,
    /// Newton iterations performed by implicit stage solves.
    pub newton_iters: u64,
    /// Newton convergence failures.
    pub newton_fails: u64,
    /// Jacobian evaluations.
    pub jac_evals: u64,
}

/// Capability surface shared by every integrator in the harness: the slow
/// multirate integrator, the inner fast integrator, and the reference
/// solver all evolve through this interface.
pub trait OdeIntegrate {
    /// Returns the number of elements in the state.
    fn len(&self) -> usize;
    /// Returns `true` if the state is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Current time.
    fn time(&self) -> f64;
    /// Current state.
    fn state(&self) -> ArrayView1<'_, f64>;
    /// Perform one accepted step, clamped to the stop time. Returns the
    /// new current time.
    fn step(&mut self) -> Result<f64, StepError>;
    /// Integrate until reaching `t_out` exactly, taking as many internal
    /// steps as the integrator's own adaptivity chooses.
    fn evolve_to(&mut self, t_out: f64) -> Result<(), StepError>;
    /// Reset to a new state at a new time, clearing the controller's
    /// history. Statistics are preserved.
    fn reset(&mut self, t: f64, state: ArrayView1<'_, f64>);
    /// Steps never advance past this time; a step that would is stretched
    /// or shortened to land on it exactly.
    fn set_stop_time(&mut self, t_stop: f64);
    /// Switch to fixed-step mode (`Some(h)`) or back to adaptive (`None`).
    fn set_fixed_step(&mut self, h: Option<f64>);
    /// Step and evaluation counters accumulated since creation.
    fn statistics(&self) -> &RunStatistics;
}
