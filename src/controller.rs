//! Error-feedback step-size controllers.
//!
//! A controller maps a sequence of observed local error norms (normalized
//! so that 1.0 means "exactly at tolerance") into step-scale factors that
//! drive future error estimates toward 1.0. The families here share one
//! general filter form
//!
//! ```text
//! scale = e1^(-K1/p) * e2^(-K2/p) * e3^(-K3/p) * (h/hp)^K4 * (hp/hpp)^K5
//! ```
//!
//! where `e1..e3` are the bias-adjusted error norms of the current and two
//! previous updates, `h/hp` and `hp/hpp` are step-size ratios, and `p` is
//! the order of accuracy supplied per update. Each family is a preset of
//! the `K` vector; the implicit-explicit Gustafsson controller keeps its
//! own asymmetric two-branch law.

use thiserror::Error;

/// Gains below the at-tolerance floor are clipped to this before feedback.
const TINY: f64 = 1e-10;

/// "Unspecified" marker for gains, biases, and composite bounds: a value
/// of exactly -1.0 keeps the built-in default.
pub const SENTINEL: f64 = -1.0;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid controller parameter {name} = {value} ({reason})")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },
}

fn invalid(name: &'static str, value: f64, reason: &'static str) -> ControllerError {
    ControllerError::InvalidParameter {
        name,
        value,
        reason,
    }
}

/// The supported feedback-law families.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerFamily {
    /// Fixed-step marker: `update` yields no scale factor.
    Fixed,
    I,
    Pi,
    Pid,
    ExpGus,
    ImpGus,
    ImExGus,
    H0211,
    H0321,
    H211,
    H312,
}

/// Families in fast-selector order; index 0 is the fixed-step marker.
const FAMILY_ORDER: [ControllerFamily; 11] = [
    ControllerFamily::Fixed,
    ControllerFamily::I,
    ControllerFamily::Pi,
    ControllerFamily::Pid,
    ControllerFamily::ExpGus,
    ControllerFamily::ImpGus,
    ControllerFamily::ImExGus,
    ControllerFamily::H0211,
    ControllerFamily::H0321,
    ControllerFamily::H211,
    ControllerFamily::H312,
];

impl ControllerFamily {
    /// Number of free gains the family exposes. The H-family filters and
    /// the implicit-explicit Gustafsson controller have fixed structure.
    pub fn gain_count(self) -> usize {
        match self {
            ControllerFamily::I => 1,
            ControllerFamily::Pi | ControllerFamily::ExpGus | ControllerFamily::ImpGus => 2,
            ControllerFamily::Pid => 3,
            _ => 0,
        }
    }

    /// Built-in default gains.
    pub fn default_gains(self) -> &'static [f64] {
        match self {
            ControllerFamily::I => &[1.0],
            ControllerFamily::Pi => &[0.8, -0.31],
            ControllerFamily::Pid => &[0.58, -0.21, 0.10],
            ControllerFamily::ExpGus => &[0.367, 0.268],
            ControllerFamily::ImpGus => &[0.98, 0.95],
            _ => &[],
        }
    }

    /// Maps the fast-controller selector (0 = fixed step, 1..=10 the
    /// feedback families) to a family.
    pub fn from_fast_selector(selector: i32) -> Option<Self> {
        if (0..=10).contains(&selector) {
            Some(FAMILY_ORDER[selector as usize])
        } else {
            None
        }
    }
}

/// Slow-controller selection: fixed steps, a standalone controller on the
/// slow step size, or an H/Tol pair splitting step-size and fast-tolerance
/// feedback. Selectors 5..=24 alternate paired/standalone per family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlowSelection {
    Fixed,
    Paired(ControllerFamily),
    Standalone(ControllerFamily),
}

impl SlowSelection {
    pub fn from_selector(selector: i32) -> Option<Self> {
        match selector {
            0 => Some(SlowSelection::Fixed),
            5..=24 => {
                let family = FAMILY_ORDER[1 + ((selector - 5) / 2) as usize];
                if (selector - 5) % 2 == 0 {
                    Some(SlowSelection::Paired(family))
                } else {
                    Some(SlowSelection::Standalone(family))
                }
            }
            _ => None,
        }
    }
}

/// One step-size feedback law.
pub trait StepController {
    fn family(&self) -> ControllerFamily;

    /// Replace the family's free gains. A gain equal to [`SENTINEL`] keeps
    /// the default; other negative gains and surplus gains are rejected.
    fn set_params(&mut self, gains: &[f64]) -> Result<(), ControllerError>;

    /// Effective (resolved) gains; a sentinel never leaks out of here.
    fn params(&self) -> Vec<f64>;

    /// Multiplies observed errors before feedback; must be positive.
    fn set_error_bias(&mut self, bias: f64) -> Result<(), ControllerError>;

    /// Feed one observed error norm for a step of size `h` taken by a
    /// method of order `p`. Returns the suggested step-scale factor, or
    /// `None` for the fixed-step controller.
    fn update(&mut self, error_norm: f64, h: f64, order: usize) -> Option<f64>;

    /// Clear history; required whenever the governed integrator's state is
    /// externally reset.
    fn reset(&mut self);
}

/// Resolves one user-supplied gain slot against the family default.
fn resolve_gain(
    supplied: Option<f64>,
    default: f64,
    name: &'static str,
) -> Result<f64, ControllerError> {
    match supplied {
        None => Ok(default),
        Some(g) if g == SENTINEL => Ok(default),
        Some(g) if g < 0.0 => Err(invalid(name, g, "negative gains other than the sentinel are not accepted")),
        Some(g) => Ok(g),
    }
}

fn check_arity(
    family: ControllerFamily,
    gains: &[f64],
) -> Result<(), ControllerError> {
    let surplus = gains.iter().skip(family.gain_count());
    for &g in surplus {
        if g != SENTINEL {
            return Err(invalid(
                "gain",
                g,
                "family does not use this many gains",
            ));
        }
    }
    Ok(())
}

/// Fixed-step placeholder: carries no history and yields no feedback.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedStep;

impl StepController for FixedStep {
    fn family(&self) -> ControllerFamily {
        ControllerFamily::Fixed
    }

    fn set_params(&mut self, gains: &[f64]) -> Result<(), ControllerError> {
        check_arity(ControllerFamily::Fixed, gains)
    }

    fn params(&self) -> Vec<f64> {
        Vec::new()
    }

    fn set_error_bias(&mut self, bias: f64) -> Result<(), ControllerError> {
        if bias <= 0.0 {
            return Err(invalid("bias", bias, "must be positive"));
        }
        Ok(())
    }

    fn update(&mut self, _error_norm: f64, _h: f64, _order: usize) -> Option<f64> {
        None
    }

    fn reset(&mut self) {}
}

/// General digital-filter controller covering the I/PI/PID, explicit and
/// implicit Gustafsson, and H-family presets.
#[derive(Clone, Debug)]
pub struct Soderlind {
    family: ControllerFamily,
    gains: Vec<f64>,
    k: [f64; 5],
    bias: f64,
    err_hist: [Option<f64>; 2],
    h_hist: [Option<f64>; 2],
}

impl Soderlind {
    pub fn new(family: ControllerFamily) -> Self {
        let gains = family.default_gains().to_vec();
        let k = Self::preset(family, &gains);
        Soderlind {
            family,
            gains,
            k,
            bias: 1.0,
            err_hist: [None, None],
            h_hist: [None, None],
        }
    }

    /// Maps user-facing gains onto the filter coefficients.
    fn preset(family: ControllerFamily, gains: &[f64]) -> [f64; 5] {
        match family {
            ControllerFamily::I => [gains[0], 0.0, 0.0, 0.0, 0.0],
            ControllerFamily::Pi => [gains[0], gains[1], 0.0, 0.0, 0.0],
            ControllerFamily::Pid => [gains[0], gains[1], gains[2], 0.0, 0.0],
            // Gustafsson laws in filter form: the previous error enters
            // with the opposite sign, and the implicit variant carries the
            // step ratio linearly.
            ControllerFamily::ExpGus => [gains[0] + gains[1], -gains[1], 0.0, 0.0, 0.0],
            ControllerFamily::ImpGus => [gains[0] + gains[1], -gains[1], 0.0, 1.0, 0.0],
            ControllerFamily::H0211 => [0.5, 0.5, 0.0, -0.5, 0.0],
            ControllerFamily::H0321 => [1.25, 0.5, -0.75, -0.25, -0.75],
            ControllerFamily::H211 => [0.25, 0.25, 0.0, -0.25, 0.0],
            ControllerFamily::H312 => [0.125, 0.25, 0.125, -0.375, -0.25],
            _ => [1.0, 0.0, 0.0, 0.0, 0.0],
        }
    }
}

impl StepController for Soderlind {
    fn family(&self) -> ControllerFamily {
        self.family
    }

    fn set_params(&mut self, gains: &[f64]) -> Result<(), ControllerError> {
        check_arity(self.family, gains)?;
        let defaults = self.family.default_gains();
        let mut resolved = Vec::with_capacity(defaults.len());
        for (i, &d) in defaults.iter().enumerate() {
            resolved.push(resolve_gain(gains.get(i).copied(), d, "gain")?);
        }
        self.k = Self::preset(self.family, &resolved);
        self.gains = resolved;
        Ok(())
    }

    fn params(&self) -> Vec<f64> {
        self.gains.clone()
    }

    fn set_error_bias(&mut self, bias: f64) -> Result<(), ControllerError> {
        if bias <= 0.0 {
            return Err(invalid("bias", bias, "must be positive"));
        }
        self.bias = bias;
        Ok(())
    }

    fn update(&mut self, error_norm: f64, h: f64, order: usize) -> Option<f64> {
        let p = order as f64;
        let e1 = (self.bias * error_norm).max(TINY);
        let e2 = self.err_hist[0].unwrap_or(1.0);
        let e3 = self.err_hist[1].unwrap_or(1.0);
        let rho1 = self.h_hist[0].map(|hp| h / hp).unwrap_or(1.0);
        let rho2 = match (self.h_hist[0], self.h_hist[1]) {
            (Some(hp), Some(hpp)) => hp / hpp,
            _ => 1.0,
        };
        let scale = e1.powf(-self.k[0] / p)
            * e2.powf(-self.k[1] / p)
            * e3.powf(-self.k[2] / p)
            * rho1.powf(self.k[3])
            * rho2.powf(self.k[4]);
        self.err_hist = [Some(e1), self.err_hist[0]];
        self.h_hist = [Some(h), self.h_hist[0]];
        Some(scale)
    }

    fn reset(&mut self) {
        self.err_hist = [None, None];
        self.h_hist = [None, None];
    }
}

/// Implicit-explicit Gustafsson controller: an I-step on the first update,
/// afterwards the minimum of the explicit and implicit Gustafsson laws.
#[derive(Clone, Debug)]
pub struct ImExGus {
    k: [f64; 4],
    bias: f64,
    prev: Option<(f64, f64)>,
}

impl Default for ImExGus {
    fn default() -> Self {
        ImExGus {
            k: [0.367, 0.268, 0.98, 0.95],
            bias: 1.0,
            prev: None,
        }
    }
}

impl ImExGus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StepController for ImExGus {
    fn family(&self) -> ControllerFamily {
        ControllerFamily::ImExGus
    }

    fn set_params(&mut self, gains: &[f64]) -> Result<(), ControllerError> {
        check_arity(ControllerFamily::ImExGus, gains)
    }

    fn params(&self) -> Vec<f64> {
        Vec::new()
    }

    fn set_error_bias(&mut self, bias: f64) -> Result<(), ControllerError> {
        if bias <= 0.0 {
            return Err(invalid("bias", bias, "must be positive"));
        }
        self.bias = bias;
        Ok(())
    }

    fn update(&mut self, error_norm: f64, h: f64, order: usize) -> Option<f64> {
        let p = order as f64;
        let e1 = (self.bias * error_norm).max(TINY);
        let scale = match self.prev {
            None => e1.powf(-1.0 / p),
            Some((e2, hp)) => {
                let explicit = e1.powf(-self.k[0] / p) * (e2 / e1).powf(self.k[1] / p);
                let implicit =
                    (h / hp) * e1.powf(-self.k[2] / p) * (e2 / e1).powf(self.k[3] / p);
                explicit.min(implicit)
            }
        };
        self.prev = Some((e1, h));
        Some(scale)
    }

    fn reset(&mut self) {
        self.prev = None;
    }
}

/// H/Tol composite: decouples the slow step-size decision from the fast
/// integrator's tolerance decision while sharing one accuracy target. The
/// H controller feeds on the slow local error, the Tol controller on the
/// error accumulated by the fast integrator within the slow step.
pub struct HTolController {
    h_ctrl: Box<dyn StepController>,
    tol_ctrl: Box<dyn StepController>,
    relch: f64,
    minfac: f64,
    maxfac: f64,
    tolfac: f64,
}

impl HTolController {
    pub fn new(h_ctrl: Box<dyn StepController>, tol_ctrl: Box<dyn StepController>) -> Self {
        HTolController {
            h_ctrl,
            tol_ctrl,
            relch: 20.0,
            minfac: 1e-5,
            maxfac: 1.0,
            tolfac: 1.0,
        }
    }

    /// Set the relative-change cap and the tolerance-factor bounds. A
    /// [`SENTINEL`] keeps the corresponding default.
    pub fn set_bounds(
        &mut self,
        relch: f64,
        minfac: f64,
        maxfac: f64,
    ) -> Result<(), ControllerError> {
        if relch != SENTINEL {
            if relch <= 0.0 {
                return Err(invalid("relch", relch, "must be positive"));
            }
            self.relch = relch;
        }
        if minfac != SENTINEL {
            if minfac <= 0.0 {
                return Err(invalid("minfac", minfac, "must be positive"));
            }
            self.minfac = minfac;
        }
        if maxfac != SENTINEL {
            if maxfac <= 0.0 {
                return Err(invalid("maxfac", maxfac, "must be positive"));
            }
            self.maxfac = maxfac;
        }
        if self.minfac > self.maxfac {
            return Err(invalid("minfac", self.minfac, "exceeds maxfac"));
        }
        Ok(())
    }

    pub fn set_params(&mut self, gains: &[f64]) -> Result<(), ControllerError> {
        self.h_ctrl.set_params(gains)?;
        self.tol_ctrl.set_params(gains)
    }

    pub fn set_error_bias(&mut self, bias: f64) -> Result<(), ControllerError> {
        self.h_ctrl.set_error_bias(bias)?;
        self.tol_ctrl.set_error_bias(bias)
    }

    /// Step-size feedback from the slow local error.
    pub fn update_step(&mut self, error_norm: f64, h: f64, order: usize) -> Option<f64> {
        self.h_ctrl.update(error_norm, h, order)
    }

    /// Tolerance feedback from the accumulated fast error. The candidate
    /// factor is clamped to `[minfac, maxfac]`; an update whose relative
    /// change exceeds `relch` leaves the factor unchanged. Returns the
    /// current factor either way.
    pub fn update_tolerance(&mut self, accumulated_error: f64, order: usize) -> f64 {
        let scale = match self.tol_ctrl.update(accumulated_error, self.tolfac, order) {
            Some(s) => s,
            None => return self.tolfac,
        };
        let candidate = (self.tolfac * scale).max(self.minfac).min(self.maxfac);
        let change = (candidate / self.tolfac).max(self.tolfac / candidate);
        if change > self.relch {
            log::warn!(
                "tolerance-factor update rejected: relative change {:.3e} exceeds cap {:.3e}",
                change,
                self.relch
            );
            return self.tolfac;
        }
        self.tolfac = candidate;
        self.tolfac
    }

    /// Current fast-tolerance scale factor.
    pub fn tolerance_factor(&self) -> f64 {
        self.tolfac
    }

    pub fn reset(&mut self) {
        self.h_ctrl.reset();
        self.tol_ctrl.reset();
        self.tolfac = 1.0;
    }
}

/// The slow time scale's tuning unit, as selected by the configuration.
pub enum SlowControl {
    Fixed,
    Single(Box<dyn StepController>),
    HTol(HTolController),
}

impl SlowControl {
    pub fn reset(&mut self) {
        match self {
            SlowControl::Fixed => {}
            SlowControl::Single(c) => c.reset(),
            SlowControl::HTol(c) => c.reset(),
        }
    }
}

/// Builds one standalone controller with resolved gains and bias. A bias
/// equal to [`SENTINEL`] keeps the family default.
pub fn build_controller(
    family: ControllerFamily,
    gains: &[f64],
    bias: f64,
) -> Result<Box<dyn StepController>, ControllerError> {
    let mut ctrl: Box<dyn StepController> = match family {
        ControllerFamily::Fixed => Box::new(FixedStep),
        ControllerFamily::ImExGus => Box::new(ImExGus::new()),
        other => Box::new(Soderlind::new(other)),
    };
    ctrl.set_params(gains)?;
    if bias != SENTINEL {
        ctrl.set_error_bias(bias)?;
    }
    Ok(ctrl)
}

/// Factory over the slow selector space: (family, paired-or-standalone)
/// plus gains, bias, and the composite bounds. The paired variants apply
/// the same gains to both halves of the H/Tol pair.
pub fn build_slow_control(
    selection: SlowSelection,
    gains: &[f64],
    bias: f64,
    relch: f64,
    minfac: f64,
    maxfac: f64,
) -> Result<SlowControl, ControllerError> {
    match selection {
        SlowSelection::Fixed => Ok(SlowControl::Fixed),
        SlowSelection::Standalone(family) => {
            Ok(SlowControl::Single(build_controller(family, gains, bias)?))
        }
        SlowSelection::Paired(family) => {
            let h_ctrl = build_controller(family, gains, SENTINEL)?;
            let tol_ctrl = build_controller(family, gains, SENTINEL)?;
            let mut composite = HTolController::new(h_ctrl, tol_ctrl);
            composite.set_bounds(relch, minfac, maxfac)?;
            if bias != SENTINEL {
                composite.set_error_bias(bias)?;
            }
            Ok(SlowControl::HTol(composite))
        }
    }
}
