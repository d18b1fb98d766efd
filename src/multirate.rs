//! Dual-rate slow integrator.
//!
//! [`MultirateIntegrator`] advances the slow partition of the system with
//! a named one-step method while delegating the fast partition to an
//! owned inner [`ErkIntegrator`] that sub-steps adaptively within each
//! slow step. One slow step is a symmetric splitting: the fast scale
//! covers the first half interval, the slow kernel the whole interval
//! (the slow partition leaves the fast component untouched), then the
//! fast scale covers the second half from the slow result.
//!
//! The slow local error is estimated by step doubling: the step is
//! repeated as two halves, and the scaled difference of the two results
//! feeds the slow controller. With an H/Tol composite controller the
//! inner integrator's relative tolerance is additionally scaled by the
//! composite's tolerance factor each step.

use lazy_static::lazy_static;
use ndarray::prelude::*;

use crate::controller::{SlowControl, StepController};
use crate::problem::{JacFn, RhsFn, SlowOperators, StructuralClass};
use crate::rk::{
    norm, select_initial_step, ErkIntegrator, StepError, Tableau, HEUN21, KUTTA32, MAX_ERR_FAILS,
    MAX_FACTOR, MIN_FACTOR, REJECT_FACTOR, RK45, STOP_FUZZ,
};
use crate::{OdeIntegrate, RunStatistics};

/// Step-size reduction after a Newton convergence failure.
const NEWTON_RETRY_FACTOR: f64 = 0.25;
/// Step-size reduction after the fast scale gives up inside a trial
/// attempt; a large trial step can hand the inner integrator a state far
/// outside the slow kernel's stability region.
const FAST_RETRY_FACTOR: f64 = 0.25;
const MAX_NEWTON_ITERS: u64 = 10;
/// Newton is converged when the correction's weighted norm drops below
/// this fraction of the error-test threshold.
const NEWTON_TOL: f64 = 0.01;

/// Diagonally implicit tableau; `a[i][i]` is the stage-solve coefficient.
pub struct DirkTableau {
    pub stages: usize,
    pub c: [f64; 3],
    pub a: [[f64; 3]; 3],
    pub b: [f64; 3],
}

const GAMMA: f64 = 0.435866521508459;
const B1: f64 = -1.5 * GAMMA * GAMMA + 4. * GAMMA - 0.25;
const B2: f64 = 1.5 * GAMMA * GAMMA - 5. * GAMMA + 1.25;

/// Implicit midpoint rule, order 2.
static IMPLICIT_MIDPOINT: DirkTableau = DirkTableau {
    stages: 1,
    c: [0.5, 0., 0.],
    a: [[0.5, 0., 0.], [0., 0., 0.], [0., 0., 0.]],
    b: [1., 0., 0.],
};

/// Three-stage stiffly accurate SDIRK method of order 3.
static SDIRK33: DirkTableau = DirkTableau {
    stages: 3,
    c: [GAMMA, (1. + GAMMA) / 2., 1.],
    a: [
        [GAMMA, 0., 0.],
        [(1. - GAMMA) / 2., GAMMA, 0.],
        [B1, B2, GAMMA],
    ],
    b: [B1, B2, GAMMA],
};

/// The stepping kernel a slow method runs over each full interval.
pub enum SlowKernel {
    Erk(&'static Tableau),
    Dirk(&'static DirkTableau),
    /// Theta splitting: forward Euler on the explicit part, trapezoidal
    /// on the implicit part.
    ImexTheta,
}

/// A named slow method: structural class, declared orders, and kernel.
pub struct MriMethod {
    pub name: &'static str,
    pub class: StructuralClass,
    pub order: usize,
    pub embed_order: usize,
    pub kernel: SlowKernel,
}

lazy_static! {
    static ref METHODS: Vec<MriMethod> = vec![
        MriMethod {
            name: "erk22",
            class: StructuralClass::Explicit,
            order: 2,
            embed_order: 1,
            kernel: SlowKernel::Erk(&HEUN21),
        },
        MriMethod {
            name: "erk33",
            class: StructuralClass::Explicit,
            order: 3,
            embed_order: 2,
            kernel: SlowKernel::Erk(&KUTTA32),
        },
        MriMethod {
            name: "erk45",
            class: StructuralClass::Explicit,
            order: 5,
            embed_order: 4,
            kernel: SlowKernel::Erk(&RK45),
        },
        MriMethod {
            name: "irk21",
            class: StructuralClass::Implicit,
            order: 2,
            embed_order: 1,
            kernel: SlowKernel::Dirk(&IMPLICIT_MIDPOINT),
        },
        MriMethod {
            name: "esdirk34",
            class: StructuralClass::Implicit,
            order: 3,
            embed_order: 2,
            kernel: SlowKernel::Dirk(&SDIRK33),
        },
        MriMethod {
            name: "imex-sr21",
            class: StructuralClass::ImEx,
            order: 2,
            embed_order: 1,
            kernel: SlowKernel::ImexTheta,
        },
    ];
}

/// Looks a slow method up by name.
pub fn lookup_method(name: &str) -> Option<&'static MriMethod> {
    METHODS.iter().find(|m| m.name == name)
}

/// Names of all registered slow methods, for help text and errors.
pub fn method_names() -> Vec<&'static str> {
    METHODS.iter().map(|m| m.name).collect()
}

/// Plain explicit stage loop without an embedded estimate; the error is
/// measured by step doubling one level up.
fn erk_step(
    fun: &mut RhsFn,
    tab: &Tableau,
    t: f64,
    y: &Array1<f64>,
    h: f64,
) -> (Array1<f64>, u64) {
    let mut k = Array2::zeros((tab.stages, y.len()));
    fun(t, y.view(), k.slice_mut(s![0, ..]));
    for (s, (a, c)) in tab.a.iter().zip(tab.c).enumerate() {
        let dy = k.slice(s![..s + 1, ..]).t().dot(&aview1(a)) * h;
        fun(t + c * h, (dy + y).view(), k.slice_mut(s![s + 1, ..]));
    }
    let y_new = h * k.t().dot(&aview1(tab.b)) + y;
    (y_new, tab.stages as u64)
}

/// One explicit step with the tableau's companion weight row as the error
/// estimate. Used when the kernel runs alone over the full system, where
/// step doubling over an oscillatory forcing can cancel between the whole
/// step and its halves.
fn erk_embedded_step(
    fun: &mut RhsFn,
    tab: &Tableau,
    t: f64,
    y: &Array1<f64>,
    h: f64,
) -> (Array1<f64>, Array1<f64>, u64) {
    let mut k = Array2::zeros((tab.stages + 1, y.len()));
    fun(t, y.view(), k.slice_mut(s![0, ..]));
    for (s, (a, c)) in tab.a.iter().zip(tab.c).enumerate() {
        let dy = k.slice(s![..s + 1, ..]).t().dot(&aview1(a)) * h;
        fun(t + c * h, (dy + y).view(), k.slice_mut(s![s + 1, ..]));
    }
    let y_new = h * k.slice::<Ix2>(s![..-1, ..]).t().dot(&aview1(tab.b)) + y;
    fun(t + h, y_new.view(), k.slice_mut(s![-1, ..]));
    let error = k.t().dot(&aview1(tab.e)) * h;
    (y_new, error, tab.stages as u64 + 1)
}

/// Inner fast integrator type: an embedded ERK over the boxed fast
/// right-hand side.
pub type FastIntegrator = ErkIntegrator<RhsFn>;

pub struct MultirateIntegrator {
    method: &'static MriMethod,
    explicit_rhs: RhsFn,
    implicit_rhs: RhsFn,
    jacobian: Option<JacFn>,
    fast: Option<FastIntegrator>,
    control: SlowControl,
    t: f64,
    y: Array1<f64>,
    t_stop: f64,
    /// Current slow step size.
    h: f64,
    fixed: bool,
    rtol: f64,
    atol: f64,
    /// Unscaled inner relative tolerance; the H/Tol factor multiplies it.
    fast_rtol_base: f64,
    safety: f64,
    use_method_order: bool,
    /// Step ceiling per `evolve_to` call.
    max_steps: u64,
    stats: RunStatistics,
}

impl MultirateIntegrator {
    /// Creates a slow integrator from its operator set, an optional inner
    /// fast integrator, and the slow control selection. `h0` seeds the
    /// slow step size; without a seed the empirical initial-step heuristic
    /// runs on the slow right-hand side.
    pub fn new(
        method: &'static MriMethod,
        ops: SlowOperators,
        fast: Option<FastIntegrator>,
        control: SlowControl,
        t0: f64,
        y0: Array1<f64>,
        rtol: f64,
        atol: f64,
        h0: Option<f64>,
    ) -> Self {
        let SlowOperators {
            mut explicit,
            implicit,
            jacobian,
        } = ops;
        let mut stats = RunStatistics::default();
        let h = match h0 {
            Some(h) => h,
            None => {
                let mut f0 = Array1::zeros(y0.len());
                explicit(t0, y0.view(), f0.view_mut());
                stats.rhs_evals += 2;
                select_initial_step(
                    &mut explicit,
                    t0,
                    y0.view(),
                    f0.view(),
                    method.order,
                    rtol,
                    atol,
                )
            }
        };
        let fast_rtol_base = fast.as_ref().map(|f| f.rtol()).unwrap_or(0.);
        MultirateIntegrator {
            method,
            explicit_rhs: explicit,
            implicit_rhs: implicit,
            jacobian,
            fast,
            control,
            t: t0,
            y: y0,
            t_stop: f64::INFINITY,
            h,
            fixed: false,
            rtol,
            atol,
            fast_rtol_base,
            safety: SLOW_SAFETY_DEFAULT,
            use_method_order: false,
            max_steps: 100_000,
            stats,
        }
    }

    pub fn set_max_steps(&mut self, max_steps: u64) {
        self.max_steps = max_steps;
    }

    pub fn method(&self) -> &'static MriMethod {
        self.method
    }

    pub fn set_safety(&mut self, safety: f64) {
        self.safety = safety;
    }

    pub fn set_use_method_order(&mut self, use_method_order: bool) {
        self.use_method_order = use_method_order;
    }

    pub fn fast_statistics(&self) -> Option<&RunStatistics> {
        self.fast.as_ref().map(|f| f.statistics())
    }

    /// Current H/Tol fast-tolerance factor, 1.0 outside H/Tol control.
    pub fn tolerance_factor(&self) -> f64 {
        match &self.control {
            SlowControl::HTol(c) => c.tolerance_factor(),
            _ => 1.,
        }
    }

    fn control_order(&self) -> usize {
        if self.use_method_order {
            self.method.order + 1
        } else {
            self.method.embed_order + 1
        }
    }

    /// Effective order for the step-doubling divisor: the splitting
    /// bounds the coupling accuracy at 2 while the fast scale is active.
    fn doubling_order(&self) -> usize {
        if self.fast.is_some() {
            2
        } else {
            self.method.order
        }
    }

    fn clamp_to_stop(&self, h: f64) -> f64 {
        let remaining = self.t_stop - self.t;
        if h >= remaining || remaining <= h * (1. + STOP_FUZZ) {
            remaining
        } else {
            h
        }
    }

    /// Solves `z = base + gamma_h * f_impl(t_stage, z)` by modified
    /// Newton with the iteration matrix `I - gamma_h * J`, `J` evaluated
    /// at `(t_jac, y_jac)`.
    fn newton_solve(
        &mut self,
        t_stage: f64,
        base: &Array1<f64>,
        gamma_h: f64,
        t_jac: f64,
        y_jac: &Array1<f64>,
    ) -> Result<Array1<f64>, StepError> {
        let jac_fn = match self.jacobian.as_mut() {
            Some(j) => j,
            None => return Err(StepError::MissingJacobian),
        };
        let mut jac = Array2::zeros((2, 2));
        jac_fn(t_jac, y_jac.view(), jac.view_mut());
        self.stats.jac_evals += 1;

        // Iteration matrix and its explicit 2x2 inverse.
        let m00 = 1. - gamma_h * jac[[0, 0]];
        let m01 = -gamma_h * jac[[0, 1]];
        let m10 = -gamma_h * jac[[1, 0]];
        let m11 = 1. - gamma_h * jac[[1, 1]];
        let det = m00 * m11 - m01 * m10;
        if det.abs() < 1e-14 {
            self.stats.newton_fails += 1;
            return Err(StepError::NonlinearDivergence {
                t: t_stage,
                h: gamma_h,
            });
        }

        let mut z = base.clone();
        let mut f = Array1::zeros(2);
        for _ in 0..MAX_NEWTON_ITERS {
            (self.implicit_rhs)(t_stage, z.view(), f.view_mut());
            self.stats.implicit_rhs_evals += 1;
            let g0 = z[0] - base[0] - gamma_h * f[0];
            let g1 = z[1] - base[1] - gamma_h * f[1];
            let d0 = -(m11 * g0 - m01 * g1) / det;
            let d1 = -(-m10 * g0 + m00 * g1) / det;
            z[0] += d0;
            z[1] += d1;
            self.stats.newton_iters += 1;

            let scale = array![
                self.atol + z[0].abs() * self.rtol,
                self.atol + z[1].abs() * self.rtol
            ];
            let delta = array![d0, d1];
            if norm(delta.view(), scale.view()) < NEWTON_TOL {
                return Ok(z);
            }
        }
        self.stats.newton_fails += 1;
        Err(StepError::NonlinearDivergence {
            t: t_stage,
            h: gamma_h,
        })
    }

    /// One diagonally implicit step over `[t, t + h]`.
    fn dirk_step(
        &mut self,
        tab: &'static DirkTableau,
        t: f64,
        y: &Array1<f64>,
        h: f64,
    ) -> Result<Array1<f64>, StepError> {
        let mut k = Vec::with_capacity(tab.stages);
        for i in 0..tab.stages {
            let mut base = y.clone();
            for (j, kj) in k.iter().enumerate().take(i) {
                base = base + h * tab.a[i][j] * kj;
            }
            let gamma_h = h * tab.a[i][i];
            let t_stage = t + tab.c[i] * h;
            let z = self.newton_solve(t_stage, &base, gamma_h, t, y)?;
            // Recover the stage derivative from the converged solve.
            k.push((&z - &base) / gamma_h);
        }
        let mut y_new = y.clone();
        for (j, kj) in k.iter().enumerate() {
            y_new = y_new + h * tab.b[j] * kj;
        }
        Ok(y_new)
    }

    /// One theta step: forward Euler on the explicit part, trapezoidal on
    /// the implicit part with a Newton stage solve.
    fn imex_theta_step(
        &mut self,
        t: f64,
        y: &Array1<f64>,
        h: f64,
    ) -> Result<Array1<f64>, StepError> {
        let mut fe = Array1::zeros(2);
        (self.explicit_rhs)(t, y.view(), fe.view_mut());
        self.stats.rhs_evals += 1;
        let mut fi = Array1::zeros(2);
        (self.implicit_rhs)(t, y.view(), fi.view_mut());
        self.stats.implicit_rhs_evals += 1;

        let base = y + &(h * fe) + &(h / 2. * fi);
        self.newton_solve(t + h, &base, h / 2., t, y)
    }

    /// One slow-kernel step over the full interval.
    fn outer_step(&mut self, t: f64, y: &Array1<f64>, h: f64) -> Result<Array1<f64>, StepError> {
        match self.method.kernel {
            SlowKernel::Erk(tab) => {
                let (y_new, evals) = erk_step(&mut self.explicit_rhs, tab, t, y, h);
                self.stats.rhs_evals += evals;
                Ok(y_new)
            }
            SlowKernel::Dirk(tab) => self.dirk_step(tab, t, y, h),
            SlowKernel::ImexTheta => self.imex_theta_step(t, y, h),
        }
    }

    /// One dual-rate advance over `[t, t + h]`: fast half, slow whole,
    /// fast half. Without a fast scale this is just the slow kernel over
    /// the full system.
    fn advance(&mut self, t: f64, y: &Array1<f64>, h: f64) -> Result<Array1<f64>, StepError> {
        let mid = t + h / 2.;
        let y_mid = match self.fast.as_mut() {
            None => return self.outer_step(t, y, h),
            Some(fast) => {
                fast.reset(t, y.view());
                fast.set_stop_time(mid);
                fast.evolve_to(mid)?;
                fast.state().to_owned()
            }
        };

        // The slow partition freezes the fast component, so the kernel
        // carries the half-advanced value through unchanged.
        let y_outer = self.outer_step(t, &y_mid, h)?;

        match self.fast.as_mut() {
            None => Ok(y_outer),
            Some(fast) => {
                fast.reset(mid, y_outer.view());
                fast.set_stop_time(t + h);
                fast.evolve_to(t + h)?;
                Ok(fast.state().to_owned())
            }
        }
    }

    /// One trial attempt over `[t, t + h]`: the candidate result and its
    /// scaled error norm. A lone explicit kernel uses its own embedded
    /// estimate; every other configuration doubles the step.
    fn attempt(&mut self, t: f64, h: f64) -> Result<(Array1<f64>, f64), StepError> {
        let y = self.y.clone();

        if self.fast.is_none() {
            if let SlowKernel::Erk(tab) = self.method.kernel {
                let (y_new, error, evals) =
                    erk_embedded_step(&mut self.explicit_rhs, tab, t, &y, h);
                self.stats.rhs_evals += evals;
                let mut scale = Array1::zeros(y.len());
                azip!((scale in &mut scale, &y in &y, &f in &y_new) {
                    *scale = self.atol + y.abs().max(f.abs()) * self.rtol;
                });
                return Ok((y_new, norm(error.view(), scale.view())));
            }
        }

        let coarse = self.advance(t, &y, h)?;
        let y_half = self.advance(t, &y, h / 2.)?;
        let fine = self.advance(t + h / 2., &y_half, h / 2.)?;

        let divisor = (2f64).powi(self.doubling_order() as i32) - 1.;
        let err = (&coarse - &fine) / divisor;
        let mut scale = Array1::zeros(y.len());
        azip!((scale in &mut scale, &y in &y, &f in &fine) {
            *scale = self.atol + y.abs().max(f.abs()) * self.rtol;
        });
        Ok((fine, norm(err.view(), scale.view())))
    }

    /// Runs the slow controller on an observed error and applies H/Tol
    /// tolerance feedback to the inner integrator.
    fn feed_control(&mut self, error_norm: f64, h: f64) -> f64 {
        let order = self.control_order();
        match &mut self.control {
            SlowControl::Fixed => 1.,
            SlowControl::Single(c) => c.update(error_norm, h, order).unwrap_or(1.),
            SlowControl::HTol(c) => {
                let scale = c.update_step(error_norm, h, order).unwrap_or(1.);
                if let Some(fast) = self.fast.as_mut() {
                    let accumulated = fast.accumulated_error();
                    let tolfac = c.update_tolerance(accumulated, order);
                    fast.set_rtol(self.fast_rtol_base * tolfac);
                }
                scale
            }
        }
    }
}

pub(crate) const SLOW_SAFETY_DEFAULT: f64 = 0.96;

impl OdeIntegrate for MultirateIntegrator {
    fn len(&self) -> usize {
        self.y.len()
    }

    fn time(&self) -> f64 {
        self.t
    }

    fn state(&self) -> ArrayView1<'_, f64> {
        self.y.view()
    }

    fn step(&mut self) -> Result<f64, StepError> {
        if self.fixed {
            let h = self.clamp_to_stop(self.h);
            self.stats.attempts += 1;
            if let Some(fast) = self.fast.as_mut() {
                fast.reset_accumulated_error();
            }
            let y = self.y.clone();
            let y_new = self.advance(self.t, &y, h)?;
            self.y = y_new;
            self.t += h;
            self.stats.steps += 1;
            return Ok(self.t);
        }

        let mut h_abs = self.h;
        let mut fails = 0u64;
        loop {
            let h = self.clamp_to_stop(h_abs);
            self.stats.attempts += 1;
            if let Some(fast) = self.fast.as_mut() {
                fast.reset_accumulated_error();
            }

            match self.attempt(self.t, h) {
                Ok((fine, error_norm)) => {
                    let scale = self.feed_control(error_norm, h);
                    if error_norm < 1. {
                        self.h = h_abs * (self.safety * scale).max(MIN_FACTOR).min(MAX_FACTOR);
                        self.y = fine;
                        self.t += h;
                        self.stats.steps += 1;
                        return Ok(self.t);
                    }
                    self.stats.err_test_fails += 1;
                    fails += 1;
                    if fails >= MAX_ERR_FAILS {
                        return Err(StepError::RepeatedErrorFailures {
                            t: self.t,
                            count: fails,
                        });
                    }
                    h_abs = h * (self.safety * scale).min(REJECT_FACTOR).max(MIN_FACTOR);
                }
                Err(StepError::NonlinearDivergence { .. }) => {
                    fails += 1;
                    if fails >= MAX_ERR_FAILS {
                        return Err(StepError::NonlinearDivergence {
                            t: self.t,
                            h: h_abs,
                        });
                    }
                    log::debug!(
                        "nonlinear solve failed at t = {:.6}; retrying with h = {:.3e}",
                        self.t,
                        h_abs * NEWTON_RETRY_FACTOR
                    );
                    h_abs *= NEWTON_RETRY_FACTOR;
                }
                // The inner integrator refusing to cross the interval
                // rejects the attempt, it does not end the run: the trial
                // state it was handed may be garbage from an oversized
                // slow step.
                Err(e @ StepError::StepSizeUnderflow { .. })
                | Err(e @ StepError::RepeatedErrorFailures { .. }) => {
                    self.stats.err_test_fails += 1;
                    fails += 1;
                    if fails >= MAX_ERR_FAILS {
                        return Err(e);
                    }
                    log::debug!(
                        "fast scale rejected the attempt at t = {:.6}; retrying with h = {:.3e}",
                        self.t,
                        h_abs * FAST_RETRY_FACTOR
                    );
                    h_abs *= FAST_RETRY_FACTOR;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn evolve_to(&mut self, t_out: f64) -> Result<(), StepError> {
        let saved_stop = self.t_stop;
        self.t_stop = t_out.min(saved_stop);
        let mut taken = 0u64;
        while self.t_stop - self.t > 0. {
            if taken >= self.max_steps {
                self.t_stop = saved_stop;
                return Err(StepError::TooManySteps {
                    limit: self.max_steps,
                    t_out,
                });
            }
            if let Err(e) = self.step() {
                self.t_stop = saved_stop;
                return Err(e);
            }
            taken += 1;
        }
        self.t_stop = saved_stop;
        Ok(())
    }

    fn reset(&mut self, t: f64, state: ArrayView1<'_, f64>) {
        self.t = t;
        self.y.assign(&state);
        self.control.reset();
        if let Some(fast) = self.fast.as_mut() {
            fast.reset(t, state);
        }
    }

    fn set_stop_time(&mut self, t_stop: f64) {
        self.t_stop = t_stop;
    }

    fn set_fixed_step(&mut self, h: Option<f64>) {
        match h {
            Some(h) => {
                self.fixed = true;
                self.h = h;
            }
            None => self.fixed = false,
        }
    }

    fn statistics(&self) -> &RunStatistics {
        &self.stats
    }
}
