//! The coupled Kvaerno-Prothero-Robinson test system.
//!
//! ```text
//! [u]' = [ G  e ] [(u^2 - r(t) - 2)/(2u)] + [ r'(t)/(2u) ]
//! [v]    [ e -1 ] [(v^2 - s(t) - 2)/(2v)]   [ s'(t)/(2v) ]
//! ```
//!
//! with forcing `r(t) = cos(t)` and `s(t) = cos(w t (1 + exp(-(t-2)^2)))`.
//! The true solution is `u = sqrt(2 + r(t))`, `v = sqrt(2 + s(t))` for any
//! choice of the parameters, which makes the problem a clean accuracy
//! benchmark: `G < 0` sets the stiffness of the slow component and
//! `w >= 1` the frequency separation of the fast one.

use ndarray::prelude::*;

/// Immutable problem parameters, copied into every right-hand-side and
/// Jacobian closure.
#[derive(Clone, Copy, Debug)]
pub struct ProblemParams {
    /// Coupling strength between the components.
    pub coupling: f64,
    /// Stiffness of the slow component; negative.
    pub stiffness: f64,
    /// Time-scale separation factor; at least 1.
    pub separation: f64,
}

impl Default for ProblemParams {
    fn default() -> Self {
        ProblemParams {
            coupling: 0.5,
            stiffness: -100.0,
            separation: 100.0,
        }
    }
}

/// Structural class of a slow method, deciding which right-hand-side
/// variants and Jacobian it needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StructuralClass {
    Explicit,
    Implicit,
    ImEx,
}

/// Boxed right-hand-side: `f(t, y, dy)` writes the derivative into `dy`.
pub type RhsFn = Box<dyn FnMut(f64, ArrayView1<'_, f64>, ArrayViewMut1<'_, f64>)>;

/// Boxed Jacobian: fills a 2x2 matrix with df/dy at `(t, y)`.
pub type JacFn = Box<dyn FnMut(f64, ArrayView1<'_, f64>, ArrayViewMut2<'_, f64>)>;

/// Slow-component forcing.
pub fn r(t: f64) -> f64 {
    t.cos()
}

pub fn rdot(t: f64) -> f64 {
    -t.sin()
}

/// Fast-component forcing; oscillates at frequency `w` with a transient
/// chirp centered at t = 2.
pub fn s(params: &ProblemParams, t: f64) -> f64 {
    let arg = params.separation * t * (1.0 + (-(t - 2.0) * (t - 2.0)).exp());
    arg.cos()
}

pub fn sdot(params: &ProblemParams, t: f64) -> f64 {
    let e = (-(t - 2.0) * (t - 2.0)).exp();
    let arg = params.separation * t * (1.0 + e);
    -arg.sin() * params.separation * (1.0 + e * (1.0 - 2.0 * t * (t - 2.0)))
}

/// Analytic solution component u.
pub fn utrue(t: f64) -> f64 {
    (2.0 + r(t)).sqrt()
}

/// Analytic solution component v.
pub fn vtrue(params: &ProblemParams, t: f64) -> f64 {
    (2.0 + s(params, t)).sqrt()
}

/// State at a given time on the true solution; `initial_state(p)` at the
/// start time gives `(sqrt(3), sqrt(3))`.
pub fn true_state(params: &ProblemParams, t: f64) -> Array1<f64> {
    array![utrue(t), vtrue(params, t)]
}

pub fn initial_state(params: &ProblemParams) -> Array1<f64> {
    true_state(params, 0.0)
}

fn tmp1(t: f64, u: f64) -> f64 {
    (-2.0 + u * u - r(t)) / (2.0 * u)
}

fn tmp2(params: &ProblemParams, t: f64, v: f64) -> f64 {
    (-2.0 + v * v - s(params, t)) / (2.0 * v)
}

/// Full right-hand side, both rows with both forcing terms.
pub fn full_rhs(params: ProblemParams) -> RhsFn {
    Box::new(move |t, y, mut dy| {
        let (u, v) = (y[0], y[1]);
        let t1 = tmp1(t, u);
        let t2 = tmp2(&params, t, v);
        dy[0] = params.stiffness * t1 + params.coupling * t2 + rdot(t) / (2.0 * u);
        dy[1] = params.coupling * t1 - t2 + sdot(&params, t) / (2.0 * v);
    })
}

/// Slow partition: row 1 with its forcing; the fast component is frozen.
pub fn slow_rhs(params: ProblemParams) -> RhsFn {
    Box::new(move |t, y, mut dy| {
        let (u, v) = (y[0], y[1]);
        dy[0] = params.stiffness * tmp1(t, u) + params.coupling * tmp2(&params, t, v)
            + rdot(t) / (2.0 * u);
        dy[1] = 0.0;
    })
}

/// Fast partition: row 2 with its forcing; the slow component is frozen.
pub fn fast_rhs(params: ProblemParams) -> RhsFn {
    Box::new(move |t, y, mut dy| {
        let (u, v) = (y[0], y[1]);
        dy[0] = 0.0;
        dy[1] = params.coupling * tmp1(t, u) - tmp2(&params, t, v) + sdot(&params, t) / (2.0 * v);
    })
}

/// Explicit part of the split slow partition: the forcing term only.
pub fn slow_explicit_rhs(_params: ProblemParams) -> RhsFn {
    Box::new(move |t, y, mut dy| {
        dy[0] = rdot(t) / (2.0 * y[0]);
        dy[1] = 0.0;
    })
}

/// Implicit part of the split slow partition: row 1 without forcing.
pub fn slow_implicit_rhs(params: ProblemParams) -> RhsFn {
    Box::new(move |t, y, mut dy| {
        let (u, v) = (y[0], y[1]);
        dy[0] = params.stiffness * tmp1(t, u) + params.coupling * tmp2(&params, t, v);
        dy[1] = 0.0;
    })
}

/// Zero right-hand side, for slow partitions with no term of a class.
pub fn zero_rhs(_params: ProblemParams) -> RhsFn {
    Box::new(move |_t, _y, mut dy| {
        dy.fill(0.0);
    })
}

fn t11(t: f64, u: f64) -> f64 {
    1.0 - (u * u - r(t) - 2.0) / (2.0 * u * u)
}

fn t22(params: &ProblemParams, t: f64, v: f64) -> f64 {
    1.0 - (v * v - s(params, t) - 2.0) / (2.0 * v * v)
}

/// Jacobian of the full right-hand side.
pub fn full_jacobian(params: ProblemParams) -> JacFn {
    Box::new(move |t, y, mut jac| {
        let (u, v) = (y[0], y[1]);
        let a = t11(t, u);
        let b = t22(&params, t, v);
        jac[[0, 0]] = params.stiffness * a - rdot(t) / (2.0 * u * u);
        jac[[0, 1]] = params.coupling * b;
        jac[[1, 0]] = params.coupling * a;
        jac[[1, 1]] = -b - sdot(&params, t) / (2.0 * v * v);
    })
}

/// Jacobian of the slow partition (row 1 with forcing).
pub fn slow_jacobian(params: ProblemParams) -> JacFn {
    Box::new(move |t, y, mut jac| {
        let (u, v) = (y[0], y[1]);
        jac[[0, 0]] = params.stiffness * t11(t, u) - rdot(t) / (2.0 * u * u);
        jac[[0, 1]] = params.coupling * t22(&params, t, v);
        jac[[1, 0]] = 0.0;
        jac[[1, 1]] = 0.0;
    })
}

/// Jacobian of the implicit split part (row 1, no forcing).
pub fn slow_implicit_jacobian(params: ProblemParams) -> JacFn {
    Box::new(move |t, y, mut jac| {
        let (u, v) = (y[0], y[1]);
        jac[[0, 0]] = params.stiffness * t11(t, u);
        jac[[0, 1]] = params.coupling * t22(&params, t, v);
        jac[[1, 0]] = 0.0;
        jac[[1, 1]] = 0.0;
    })
}

/// The slow time scale's operator set: explicit part, implicit part, and
/// the Jacobian of the implicit part where one exists.
pub struct SlowOperators {
    pub explicit: RhsFn,
    pub implicit: RhsFn,
    pub jacobian: Option<JacFn>,
}

/// Selects the slow operators for a structural class. With the fast scale
/// active the slow side sees only its own partition; with the fast scale
/// disabled the slow side carries the full system.
pub fn select(params: ProblemParams, class: StructuralClass, fast_active: bool) -> SlowOperators {
    match class {
        StructuralClass::Explicit => SlowOperators {
            explicit: if fast_active {
                slow_rhs(params)
            } else {
                full_rhs(params)
            },
            implicit: zero_rhs(params),
            jacobian: None,
        },
        StructuralClass::Implicit => SlowOperators {
            explicit: zero_rhs(params),
            implicit: if fast_active {
                slow_rhs(params)
            } else {
                full_rhs(params)
            },
            jacobian: Some(if fast_active {
                slow_jacobian(params)
            } else {
                full_jacobian(params)
            }),
        },
        StructuralClass::ImEx => SlowOperators {
            explicit: if fast_active {
                slow_explicit_rhs(params)
            } else {
                zero_rhs(params)
            },
            implicit: if fast_active {
                slow_implicit_rhs(params)
            } else {
                full_rhs(params)
            },
            jacobian: Some(if fast_active {
                slow_implicit_jacobian(params)
            } else {
                full_jacobian(params)
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn eval(f: &mut RhsFn, t: f64, y: &Array1<f64>) -> Array1<f64> {
        let mut dy = Array1::zeros(2);
        f(t, y.view(), dy.view_mut());
        dy
    }

    #[test]
    fn initial_state_is_sqrt_three() {
        let p = ProblemParams::default();
        let y0 = initial_state(&p);
        assert_relative_eq!(y0[0], 3f64.sqrt(), epsilon = 1e-15);
        assert_relative_eq!(y0[1], 3f64.sqrt(), epsilon = 1e-15);
    }

    #[test]
    fn partitions_sum_to_full_rhs() {
        let p = ProblemParams::default();
        let mut f_full = full_rhs(p);
        let mut f_slow = slow_rhs(p);
        let mut f_fast = fast_rhs(p);
        for &t in &[0.0, 0.7, 2.0, 4.3] {
            let y = array![utrue(t) * 1.01, vtrue(&p, t) * 0.98];
            let full = eval(&mut f_full, t, &y);
            let sum = eval(&mut f_slow, t, &y) + eval(&mut f_fast, t, &y);
            assert_relative_eq!(full[0], sum[0], max_relative = 1e-13);
            assert_relative_eq!(full[1], sum[1], max_relative = 1e-13);
        }
    }

    #[test]
    fn split_parts_sum_to_slow_rhs() {
        let p = ProblemParams::default();
        let mut f_slow = slow_rhs(p);
        let mut f_e = slow_explicit_rhs(p);
        let mut f_i = slow_implicit_rhs(p);
        for &t in &[0.1, 1.9, 3.5] {
            let y = array![utrue(t), vtrue(&p, t)];
            let slow = eval(&mut f_slow, t, &y);
            let sum = eval(&mut f_e, t, &y) + eval(&mut f_i, t, &y);
            assert_relative_eq!(slow[0], sum[0], max_relative = 1e-13);
            assert_eq!(sum[1], 0.0);
        }
    }

    #[test]
    fn true_solution_satisfies_full_rhs() {
        // d/dt sqrt(2 + r) = r' / (2u); both tmp terms vanish on the
        // true solution, leaving only the forcing.
        let p = ProblemParams::default();
        let mut f_full = full_rhs(p);
        for &t in &[0.3, 1.0, 2.5] {
            let y = true_state(&p, t);
            let dy = eval(&mut f_full, t, &y);
            assert_relative_eq!(dy[0], rdot(t) / (2.0 * y[0]), max_relative = 1e-10);
            assert_relative_eq!(dy[1], sdot(&p, t) / (2.0 * y[1]), max_relative = 1e-10);
        }
    }

    #[test]
    fn full_jacobian_matches_finite_differences() {
        let p = ProblemParams::default();
        let mut f_full = full_rhs(p);
        let mut jac_fn = full_jacobian(p);
        let t = 1.3;
        let y = array![1.4, 1.2];
        let mut jac = Array2::zeros((2, 2));
        jac_fn(t, y.view(), jac.view_mut());
        let eps = 1e-7;
        for j in 0..2 {
            let mut yp = y.clone();
            let mut ym = y.clone();
            yp[j] += eps;
            ym[j] -= eps;
            let fp = eval(&mut f_full, t, &yp);
            let fm = eval(&mut f_full, t, &ym);
            for i in 0..2 {
                let fd = (fp[i] - fm[i]) / (2.0 * eps);
                assert_relative_eq!(jac[[i, j]], fd, max_relative = 1e-5);
            }
        }
    }

    #[test]
    fn implicit_jacobian_matches_finite_differences() {
        let p = ProblemParams::default();
        let mut f_impl = slow_implicit_rhs(p);
        let mut jac_fn = slow_implicit_jacobian(p);
        let t = 0.8;
        let y = array![1.5, 1.1];
        let mut jac = Array2::zeros((2, 2));
        jac_fn(t, y.view(), jac.view_mut());
        let eps = 1e-7;
        for j in 0..2 {
            let mut yp = y.clone();
            let mut ym = y.clone();
            yp[j] += eps;
            ym[j] -= eps;
            let fp = eval(&mut f_impl, t, &yp);
            let fm = eval(&mut f_impl, t, &ym);
            for i in 0..2 {
                let fd = (fp[i] - fm[i]) / (2.0 * eps);
                assert_relative_eq!(jac[[i, j]], fd, max_relative = 1e-5, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn selection_gives_explicit_class_no_jacobian() {
        let p = ProblemParams::default();
        let ops = select(p, StructuralClass::Explicit, true);
        assert!(ops.jacobian.is_none());
        let ops = select(p, StructuralClass::Implicit, true);
        assert!(ops.jacobian.is_some());
        let ops = select(p, StructuralClass::ImEx, false);
        assert!(ops.jacobian.is_some());
    }
}
