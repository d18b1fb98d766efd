//! Embedded explicit Runge-Kutta stepping.
//!
//! [`ErkIntegrator`] pairs a runtime Butcher [`Tableau`] with a pluggable
//! [`StepController`] and backs both the fast inner integrator and the
//! reference solver. The stepping core follows Hairer, Norsett and Wanner,
//! "Solving Ordinary Differential Equations I: Nonstiff Problems",
//! Sec. II.4: FSAL stage storage, a weighted RMS error norm, and the
//! empirical initial-step heuristic.

use ndarray::prelude::*;
use ndarray::{FoldWhile, Zip};
use thiserror::Error;

use crate::controller::StepController;
use crate::{OdeIntegrate, RunStatistics};

/// Multiply steps computed from asymptotic behaviour of errors by this.
pub(crate) const SAFETY: f64 = 0.9;
/// Minimum allowed decrease in a step size.
pub(crate) const MIN_FACTOR: f64 = 0.2;
/// Maximum allowed increase in a step size.
pub(crate) const MAX_FACTOR: f64 = 10.;
/// A rejected step never grows, whatever the controller suggests.
pub(crate) const REJECT_FACTOR: f64 = 0.9;
/// Consecutive error-test failures tolerated within one step.
pub(crate) const MAX_ERR_FAILS: u64 = 10;
/// A step whose remaining interval is within this relative slack of the
/// step size is stretched to land on the stop time exactly.
pub(crate) const STOP_FUZZ: f64 = 1e-10;

#[derive(Debug, Error)]
pub enum StepError {
    #[error("step size {h:.3e} fell below the representable limit {limit:.3e} at t = {t:.6}")]
    StepSizeUnderflow { t: f64, h: f64, limit: f64 },
    #[error("{count} consecutive error-test failures at t = {t:.6}")]
    RepeatedErrorFailures { t: f64, count: u64 },
    #[error("step limit of {limit} reached before t = {t_out:.6}")]
    TooManySteps { limit: u64, t_out: f64 },
    #[error("nonlinear solve failed to converge at t = {t:.6} with h = {h:.3e}")]
    NonlinearDivergence { t: f64, h: f64 },
    #[error("implicit method requires a Jacobian and none was configured")]
    MissingJacobian,
}

/// Computes RMS norm of scaled values.
pub(crate) fn norm(x: ArrayView1<'_, f64>, scale: ArrayView1<'_, f64>) -> f64 {
    debug_assert_eq!(x.len(), scale.len());
    (Zip::from(x)
        .and(scale)
        .fold_while(0., |acc, &x, &scale| {
            let scaled = x / scale;
            FoldWhile::Continue(acc + scaled * scaled)
        })
        .into_inner()
        / x.len() as f64)
        .sqrt()
}

/// Empirically select a good initial step (HNW Sec. II.4).
pub(crate) fn select_initial_step<F>(
    fun: &mut F,
    t0: f64,
    y0: ArrayView1<'_, f64>,
    f0: ArrayView1<'_, f64>,
    order: usize,
    rtol: f64,
    atol: f64,
) -> f64
where
    F: FnMut(f64, ArrayView1<'_, f64>, ArrayViewMut1<'_, f64>),
{
    if y0.is_empty() {
        return f64::INFINITY;
    }

    let scale = y0.mapv(f64::abs) * rtol + atol;
    let d0 = norm(y0, scale.view());
    let d1 = norm(f0, scale.view());
    let h0 = if d0 < 1e-5 || d1 < 1e-5 {
        1e-6
    } else {
        0.01 * d0 / d1
    };

    let y1 = h0 * &f0 + y0;
    let mut f1 = Array1::zeros(y0.len());
    fun(t0 + h0, y1.view(), f1.view_mut());
    let d2 = norm((f1 - f0).view(), scale.view()) / h0;

    let h1 = if d1 <= 1e-15 && d2 <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / d1.max(d2)).powf(1. / (order as f64 + 1.))
    };

    (100. * h0).min(h1)
}

/// Computes the next representable floating-point value following `x` in
/// the direction of `y`.
fn next_after(x: f64, y: f64) -> f64 {
    if x.is_nan() || y.is_nan() {
        f64::NAN
    } else if x == y {
        y
    } else if x == 0. {
        if y < 0. {
            -f64::from_bits(1)
        } else {
            f64::from_bits(1)
        }
    } else if (y > x) == (x > 0.) {
        f64::from_bits(x.to_bits().wrapping_add(1))
    } else {
        f64::from_bits(x.to_bits().wrapping_sub(1))
    }
}

/// A Butcher tableau with an embedded error estimate.
///
/// `a` is stored as rows of increasing length (explicit methods only have
/// entries below the diagonal, and the first stage needs none). `e` holds
/// the difference of the two weight rows over `stages + 1` entries: the
/// extra entry weights the derivative at the step result, which the FSAL
/// storage keeps in the last stage row.
pub struct Tableau {
    pub method_order: usize,
    pub embed_order: usize,
    pub stages: usize,
    pub c: &'static [f64],
    pub a: &'static [&'static [f64]],
    pub b: &'static [f64],
    pub e: &'static [f64],
}

/// Heun's method with an embedded Euler estimate, order 2(1).
pub static HEUN21: Tableau = Tableau {
    method_order: 2,
    embed_order: 1,
    stages: 2,
    c: &[1.],
    a: &[&[1.]],
    b: &[1. / 2., 1. / 2.],
    e: &[-1. / 2., 1. / 2., 0.],
};

/// Kutta's third-order method with an embedded midpoint estimate,
/// order 3(2).
pub static KUTTA32: Tableau = Tableau {
    method_order: 3,
    embed_order: 2,
    stages: 3,
    c: &[1. / 2., 1.],
    a: &[&[1. / 2.], &[-1., 2.]],
    b: &[1. / 6., 2. / 3., 1. / 6.],
    e: &[1. / 6., -1. / 3., 1. / 6., 0.],
};

/// Bogacki-Shampine 3(2) pair with local extrapolation.
pub static RK23: Tableau = Tableau {
    method_order: 3,
    embed_order: 2,
    stages: 3,
    c: &[1. / 2., 3. / 4.],
    a: &[&[1. / 2.], &[0., 3. / 4.]],
    b: &[2. / 9., 1. / 3., 4. / 9.],
    e: &[5. / 72., -1. / 12., -1. / 9., 1. / 8.],
};

/// Dormand-Prince 5(4) pair with local extrapolation.
pub static RK45: Tableau = Tableau {
    method_order: 5,
    embed_order: 4,
    stages: 6,
    c: &[1. / 5., 3. / 10., 4. / 5., 8. / 9., 1.],
    a: &[
        &[1. / 5.],
        &[3. / 40., 9. / 40.],
        &[44. / 45., -56. / 15., 32. / 9.],
        &[19372. / 6561., -25360. / 2187., 64448. / 6561., -212. / 729.],
        &[
            9017. / 3168.,
            -355. / 33.,
            46732. / 5247.,
            49. / 176.,
            -5103. / 18656.,
        ],
    ],
    b: &[
        35. / 384.,
        0.,
        500. / 1113.,
        125. / 192.,
        -2187. / 6784.,
        11. / 84.,
    ],
    e: &[
        -71. / 57600.,
        0.,
        71. / 16695.,
        -71. / 1920.,
        17253. / 339200.,
        -22. / 525.,
        1. / 40.,
    ],
};

/// Maps a requested order of accuracy to an embedded pair.
pub fn tableau_for_order(order: usize) -> Option<&'static Tableau> {
    match order {
        2 | 3 => Some(&RK23),
        4 | 5 => Some(&RK45),
        _ => None,
    }
}

/// How accepted sub-step errors are folded into the readable accumulator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccumMode {
    None,
    Max,
    Sum,
    Average,
}

impl AccumMode {
    /// Selector values: -1 disables accumulation, 0 = max, 1 = sum,
    /// 2 = average.
    pub fn from_selector(selector: i32) -> Option<Self> {
        match selector {
            -1 => Some(AccumMode::None),
            0 => Some(AccumMode::Max),
            1 => Some(AccumMode::Sum),
            2 => Some(AccumMode::Average),
            _ => None,
        }
    }
}

struct StepOutput {
    /// Solution at `t + h` computed with higher accuracy.
    y_new: Array1<f64>,
    /// Error estimate of the less accurate method.
    error: Array1<f64>,
}

/// Embedded explicit Runge-Kutta integrator with a pluggable step
/// controller.
pub struct ErkIntegrator<F>
where
    F: FnMut(f64, ArrayView1<'_, f64>, ArrayViewMut1<'_, f64>),
{
    fun: F,
    tableau: &'static Tableau,
    /// Current time.
    t: f64,
    /// Current state.
    y: Array1<f64>,
    /// Steps never pass this time.
    t_stop: f64,
    /// Step size for the next attempt; selected empirically when absent.
    h_abs: Option<f64>,
    /// Fixed step size, bypassing the error test entirely.
    fixed_h: Option<f64>,
    rtol: f64,
    atol: f64,
    controller: Box<dyn StepController>,
    safety: f64,
    /// Controller exponents use the method order when set, otherwise the
    /// embedding order.
    use_method_order: bool,
    /// Internal step ceiling per `evolve_to` call.
    max_steps: u64,
    stats: RunStatistics,
    accum_mode: AccumMode,
    accum: f64,
    accum_count: u64,
    /// Stage storage, shape `(stages + 1, len)`; the last row carries the
    /// derivative at the current state.
    k: Array2<f64>,
}

impl<F> ErkIntegrator<F>
where
    F: FnMut(f64, ArrayView1<'_, f64>, ArrayViewMut1<'_, f64>),
{
    pub fn new(
        mut fun: F,
        tableau: &'static Tableau,
        t0: f64,
        y0: Array1<f64>,
        rtol: f64,
        atol: f64,
        controller: Box<dyn StepController>,
    ) -> Self {
        let mut k = Array2::zeros((tableau.stages + 1, y0.len()));
        fun(t0, y0.view(), k.slice_mut(s![-1, ..]));
        let mut stats = RunStatistics::default();
        stats.rhs_evals += 1;
        ErkIntegrator {
            fun,
            tableau,
            t: t0,
            y: y0,
            t_stop: f64::INFINITY,
            h_abs: None,
            fixed_h: None,
            rtol,
            atol,
            controller,
            safety: SAFETY,
            use_method_order: false,
            max_steps: 100_000,
            stats,
            accum_mode: AccumMode::None,
            accum: 0.,
            accum_count: 0,
            k,
        }
    }

    pub fn set_rtol(&mut self, rtol: f64) {
        self.rtol = rtol;
    }

    pub fn rtol(&self) -> f64 {
        self.rtol
    }

    /// Overrides the empirical initial-step heuristic; `None` restores it.
    pub fn set_initial_step(&mut self, h0: Option<f64>) {
        self.h_abs = h0;
    }

    pub fn set_max_steps(&mut self, max_steps: u64) {
        self.max_steps = max_steps;
    }

    pub fn set_safety(&mut self, safety: f64) {
        self.safety = safety;
    }

    pub fn set_use_method_order(&mut self, use_method_order: bool) {
        self.use_method_order = use_method_order;
    }

    pub fn set_accumulation_mode(&mut self, mode: AccumMode) {
        self.accum_mode = mode;
        self.reset_accumulated_error();
    }

    /// Error accumulated over accepted steps since the last reset, folded
    /// per the configured mode.
    pub fn accumulated_error(&self) -> f64 {
        match self.accum_mode {
            AccumMode::Average if self.accum_count > 0 => {
                self.accum / self.accum_count as f64
            }
            _ => self.accum,
        }
    }

    pub fn reset_accumulated_error(&mut self) {
        self.accum = 0.;
        self.accum_count = 0;
    }

    fn control_order(&self) -> usize {
        if self.use_method_order {
            self.tableau.method_order + 1
        } else {
            self.tableau.embed_order + 1
        }
    }

    fn accumulate(&mut self, error_norm: f64) {
        match self.accum_mode {
            AccumMode::None => {}
            AccumMode::Max => self.accum = self.accum.max(error_norm),
            AccumMode::Sum | AccumMode::Average => {
                self.accum += error_norm;
                self.accum_count += 1;
            }
        }
    }

    /// One embedded RK attempt over `[t, t + h]`; stage notation as in
    /// HNW Sec. II.4. The derivative at the result lands in the last
    /// stage row, becoming the first stage of the next attempt.
    fn step_by(&mut self, h: f64) -> StepOutput {
        let f = self.k.slice(s![-1, ..]).to_owned();
        self.k.slice_mut(s![0, ..]).assign(&f);
        for (s, (a, c)) in self.tableau.a.iter().zip(self.tableau.c).enumerate() {
            let dy = self.k.slice(s![..s + 1, ..]).t().dot(&aview1(a)) * h;
            (self.fun)(
                self.t + c * h,
                (dy + &self.y).view(),
                self.k.slice_mut(s![s + 1, ..]),
            );
        }

        let y_new =
            h * self.k.slice::<Ix2>(s![..-1, ..]).t().dot(&aview1(self.tableau.b)) + &self.y;
        (self.fun)(self.t + h, y_new.view(), self.k.slice_mut(s![-1, ..]));
        self.stats.rhs_evals += self.tableau.stages as u64;

        let error = self.k.t().dot(&aview1(self.tableau.e)) * h;

        StepOutput { y_new, error }
    }

    fn error_norm(&self, y_new: &Array1<f64>, error: &Array1<f64>) -> f64 {
        let mut scale = Array1::zeros(self.y.len());
        azip!((scale in &mut scale, &y in &self.y, &y_new in y_new) {
            *scale = self.atol + y.abs().max(y_new.abs()) * self.rtol;
        });
        norm(error.view(), scale.view())
    }

    /// Clamps a proposed step onto the stop time. A step that would land
    /// just short of it (within the fuzz) is stretched to hit it exactly.
    fn clamp_to_stop(&self, h: f64) -> f64 {
        let remaining = self.t_stop - self.t;
        if h >= remaining || remaining <= h * (1. + STOP_FUZZ) {
            remaining
        } else {
            h
        }
    }

    fn accept(&mut self, t_new: f64, y_new: Array1<f64>) {
        self.t = t_new;
        self.y = y_new;
        self.stats.steps += 1;
    }
}

impl<F> OdeIntegrate for ErkIntegrator<F>
where
    F: FnMut(f64, ArrayView1<'_, f64>, ArrayViewMut1<'_, f64>),
{
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
        let min_step = 10. * (next_after(self.t, f64::INFINITY) - self.t).abs();

        if let Some(h_fixed) = self.fixed_h {
            // Fixed mode: no error test, no controller.
            let h = self.clamp_to_stop(h_fixed);
            self.stats.attempts += 1;
            let StepOutput { y_new, error } = self.step_by(h);
            let error_norm = self.error_norm(&y_new, &error);
            self.accumulate(error_norm);
            self.accept(self.t + h, y_new);
            return Ok(self.t);
        }

        let mut h_abs = match self.h_abs {
            Some(h) => h,
            None => {
                let f0 = self.k.slice(s![-1, ..]).to_owned();
                let y0 = self.y.clone();
                let t0 = self.t;
                let order = self.tableau.method_order;
                let (rtol, atol) = (self.rtol, self.atol);
                let h = select_initial_step(
                    &mut self.fun,
                    t0,
                    y0.view(),
                    f0.view(),
                    order,
                    rtol,
                    atol,
                );
                self.stats.rhs_evals += 1;
                h
            }
        };
        h_abs = h_abs.max(min_step);

        let order = self.control_order();
        let mut fails = 0u64;
        loop {
            if h_abs < min_step {
                return Err(StepError::StepSizeUnderflow {
                    t: self.t,
                    h: h_abs,
                    limit: min_step,
                });
            }
            let h = self.clamp_to_stop(h_abs);
            let t_new = self.t + h;

            self.stats.attempts += 1;
            let StepOutput { y_new, error } = self.step_by(h);
            let error_norm = self.error_norm(&y_new, &error);
            let scale = self
                .controller
                .update(error_norm, h, order)
                .unwrap_or(1.);

            if error_norm < 1. {
                self.h_abs = Some(h_abs * (self.safety * scale).max(MIN_FACTOR).min(MAX_FACTOR));
                self.accumulate(error_norm);
                self.accept(t_new, y_new);
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
            // The rejected attempt left a stale derivative in the FSAL
            // row; restore the one at the current state.
            let y = self.y.clone();
            (self.fun)(self.t, y.view(), self.k.slice_mut(s![-1, ..]));
            self.stats.rhs_evals += 1;
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
            self.step()?;
            taken += 1;
        }
        self.t_stop = saved_stop;
        Ok(())
    }

    fn reset(&mut self, t: f64, state: ArrayView1<'_, f64>) {
        self.t = t;
        self.y.assign(&state);
        (self.fun)(t, self.y.view(), self.k.slice_mut(s![-1, ..]));
        self.stats.rhs_evals += 1;
        self.controller.reset();
    }

    fn set_stop_time(&mut self, t_stop: f64) {
        self.t_stop = t_stop;
    }

    fn set_fixed_step(&mut self, h: Option<f64>) {
        self.fixed_h = h;
    }

    fn statistics(&self) -> &RunStatistics {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{build_controller, ControllerFamily, SENTINEL};
    use approx::assert_relative_eq;

    fn pi_controller() -> Box<dyn StepController> {
        build_controller(ControllerFamily::Pi, &[], SENTINEL).unwrap()
    }

    fn exponential_decay(
    ) -> impl FnMut(f64, ArrayView1<'_, f64>, ArrayViewMut1<'_, f64>) {
        |_t, y, mut dy| {
            dy[0] = -y[0];
        }
    }

    #[test]
    fn norm_is_scaled_rms() {
        let x = array![3., 4.];
        let scale = array![1., 1.];
        assert_relative_eq!(norm(x.view(), scale.view()), (25f64 / 2.).sqrt());
    }

    #[test]
    fn decay_to_one_matches_analytic_solution() {
        let mut ivp = ErkIntegrator::new(
            exponential_decay(),
            &RK45,
            0.,
            array![1.],
            1e-8,
            1e-10,
            pi_controller(),
        );
        ivp.evolve_to(1.).unwrap();
        assert_relative_eq!(ivp.time(), 1.);
        assert_relative_eq!(ivp.state()[0], (-1f64).exp(), max_relative = 1e-7);
        assert!(ivp.statistics().steps > 0);
        assert!(ivp.statistics().rhs_evals > ivp.statistics().steps);
    }

    #[test]
    fn heun_pair_integrates_linear_growth_exactly() {
        // y' = t has a quadratic solution, exact for any order-2 method.
        let mut ivp = ErkIntegrator::new(
            |t, _y: ArrayView1<'_, f64>, mut dy: ArrayViewMut1<'_, f64>| {
                dy[0] = t;
            },
            &HEUN21,
            0.,
            array![0.],
            1e-6,
            1e-12,
            pi_controller(),
        );
        ivp.evolve_to(2.).unwrap();
        assert_relative_eq!(ivp.state()[0], 2., max_relative = 1e-9);
    }

    #[test]
    fn fixed_step_mode_takes_exact_count() {
        let mut ivp = ErkIntegrator::new(
            exponential_decay(),
            &RK23,
            0.,
            array![1.],
            1e-4,
            1e-11,
            pi_controller(),
        );
        ivp.set_fixed_step(Some(0.01));
        ivp.evolve_to(1.).unwrap();
        assert_relative_eq!(ivp.time(), 1.);
        assert_eq!(ivp.statistics().steps, 100);
        assert_eq!(ivp.statistics().err_test_fails, 0);
    }

    #[test]
    fn stop_time_is_never_overshot() {
        let mut ivp = ErkIntegrator::new(
            exponential_decay(),
            &RK45,
            0.,
            array![1.],
            1e-6,
            1e-9,
            pi_controller(),
        );
        ivp.set_stop_time(0.3);
        let mut t = 0.;
        while ivp.time() < 0.3 {
            t = ivp.step().unwrap();
            assert!(t <= 0.3 + 1e-14);
        }
        assert_relative_eq!(t, 0.3);
    }

    #[test]
    fn reset_restarts_from_new_state() {
        let mut ivp = ErkIntegrator::new(
            exponential_decay(),
            &RK45,
            0.,
            array![1.],
            1e-8,
            1e-10,
            pi_controller(),
        );
        ivp.evolve_to(0.5).unwrap();
        ivp.reset(0., array![2.].view());
        assert_relative_eq!(ivp.time(), 0.);
        ivp.evolve_to(1.).unwrap();
        assert_relative_eq!(ivp.state()[0], 2. * (-1f64).exp(), max_relative = 1e-7);
    }

    #[test]
    fn accumulator_modes_fold_accepted_errors() {
        for &(mode, selector) in &[
            (AccumMode::Max, 0),
            (AccumMode::Sum, 1),
            (AccumMode::Average, 2),
        ] {
            assert_eq!(AccumMode::from_selector(selector), Some(mode));
            let mut ivp = ErkIntegrator::new(
                exponential_decay(),
                &RK23,
                0.,
                array![1.],
                1e-5,
                1e-9,
                pi_controller(),
            );
            ivp.set_accumulation_mode(mode);
            ivp.evolve_to(1.).unwrap();
            let acc = ivp.accumulated_error();
            assert!(acc > 0.);
            if mode == AccumMode::Max || mode == AccumMode::Average {
                // Accepted errors are below tolerance by construction.
                assert!(acc < 1.);
            }
            ivp.reset_accumulated_error();
            assert_eq!(ivp.accumulated_error(), 0.);
        }
        assert_eq!(AccumMode::from_selector(-1), Some(AccumMode::None));
        assert_eq!(AccumMode::from_selector(3), None);
    }

    #[test]
    fn step_limit_is_enforced() {
        let mut ivp = ErkIntegrator::new(
            exponential_decay(),
            &RK45,
            0.,
            array![1.],
            1e-10,
            1e-12,
            pi_controller(),
        );
        ivp.set_max_steps(2);
        assert!(matches!(
            ivp.evolve_to(100.),
            Err(StepError::TooManySteps { limit: 2, .. })
        ));
    }

    #[test]
    fn order_lookup_covers_supported_orders() {
        assert!(tableau_for_order(2).is_some());
        assert_eq!(tableau_for_order(3).map(|t| t.stages), Some(3));
        assert_eq!(tableau_for_order(4).map(|t| t.stages), Some(6));
        assert_eq!(tableau_for_order(5).map(|t| t.stages), Some(6));
        assert!(tableau_for_order(6).is_none());
        assert!(tableau_for_order(1).is_none());
    }

    #[test]
    fn tableau_rows_are_consistent() {
        for tab in &[&HEUN21, &KUTTA32, &RK23, &RK45] {
            assert_eq!(tab.c.len(), tab.stages - 1);
            assert_eq!(tab.a.len(), tab.stages - 1);
            assert_eq!(tab.b.len(), tab.stages);
            assert_eq!(tab.e.len(), tab.stages + 1);
            assert_relative_eq!(tab.b.iter().sum::<f64>(), 1., epsilon = 1e-12);
            assert_relative_eq!(tab.e.iter().sum::<f64>(), 0., epsilon = 1e-12);
        }
    }
}
