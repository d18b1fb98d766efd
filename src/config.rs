//! Run configuration and validation.

use thiserror::Error;

use crate::controller::{ControllerFamily, SlowSelection, SENTINEL};
use crate::multirate::{lookup_method, method_names, MriMethod};
use crate::problem::ProblemParams;
use crate::rk::AccumMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("tolerance {name} = {value} must lie in (0, 1)")]
    ToleranceOutOfRange { name: &'static str, value: f64 },
    #[error("stiffness parameter G = {0} must be negative")]
    NonNegativeStiffness(f64),
    #[error("separation factor w = {0} must be at least 1")]
    SeparationTooSmall(f64),
    #[error("step size {name} = {value} must be positive here")]
    NonPositiveStep { name: &'static str, value: f64 },
    #[error("slow controller selector {0} is out of range (0, or 5..=24)")]
    UnknownSlowController(i32),
    #[error("fast controller selector {0} is out of range (0..=10)")]
    UnknownFastController(i32),
    #[error("error accumulation selector {0} is out of range (-1..=2)")]
    UnknownAccumulation(i32),
    #[error("fast method order {0} is not one of 0, 2, 3, 4, 5")]
    UnsupportedFastOrder(usize),
    #[error("unknown slow method '{name}' (known: {known})")]
    UnknownMethod { name: String, known: String },
    #[error("safety factor {0} must lie in (0, 1)")]
    InvalidSafety(f64),
}

/// The full option surface of one harness run. Every gain, bias, safety
/// and composite-bound field defaults to the sentinel -1.0, which keeps
/// the corresponding built-in default downstream.
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Coupling strength between the components (e).
    pub coupling: f64,
    /// Stiffness of the slow component (G); negative.
    pub stiffness: f64,
    /// Time-scale separation factor (w); at least 1.
    pub separation: f64,
    /// Slow step size: fixed step when the slow controller is disabled,
    /// the initial slow step when `set_h0` is set.
    pub hs: f64,
    /// Fast step size: fixed step when the fast controller is disabled.
    pub hf: f64,
    /// Seed the adaptive integrators with hs/hf instead of the empirical
    /// initial-step heuristic.
    pub set_h0: bool,
    /// Slow relative tolerance.
    pub rtol: f64,
    /// Absolute tolerance, shared by all integrators.
    pub atol: f64,
    /// Fast relative tolerance (before any H/Tol scaling).
    pub fast_rtol: f64,
    /// Slow method name; see [`method_names`].
    pub method: String,
    /// Fast method order: 0 disables the fast scale, otherwise one of
    /// 2, 3, 4, 5.
    pub fast_order: usize,
    /// Slow controller selector: 0 fixed, 5..=24 the paired/standalone
    /// family grid.
    pub scontrol: i32,
    /// Fast controller selector: 0 fixed, 1..=10 the families.
    pub fcontrol: i32,
    /// Fast error accumulation selector: -1 none, 0 max, 1 sum,
    /// 2 average.
    pub faccum: i32,
    /// Use the slow method order instead of the embedding order in
    /// controller exponents.
    pub slow_pq: bool,
    /// Same for the fast method.
    pub fast_pq: bool,
    /// Slow controller gains (k1s, k2s, k3s).
    pub slow_gains: [f64; 3],
    /// Fast controller gains (k1f, k2f, k3f).
    pub fast_gains: [f64; 3],
    /// Controller error bias.
    pub bias: f64,
    /// Slow step-size safety factor.
    pub safety: f64,
    /// H/Tol relative-change cap.
    pub htol_relch: f64,
    /// H/Tol tolerance-factor lower bound.
    pub htol_minfac: f64,
    /// H/Tol tolerance-factor upper bound.
    pub htol_maxfac: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            coupling: 0.5,
            stiffness: -100.0,
            separation: 100.0,
            hs: 0.01,
            hf: 1e-4,
            set_h0: false,
            rtol: 1e-4,
            atol: 1e-11,
            fast_rtol: 1e-4,
            method: "erk45".to_string(),
            fast_order: 4,
            scontrol: 6,
            fcontrol: 1,
            faccum: 0,
            slow_pq: false,
            fast_pq: false,
            slow_gains: [SENTINEL; 3],
            fast_gains: [SENTINEL; 3],
            bias: SENTINEL,
            safety: SENTINEL,
            htol_relch: SENTINEL,
            htol_minfac: SENTINEL,
            htol_maxfac: SENTINEL,
        }
    }
}

fn check_tolerance(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value <= 0. || value >= 1. {
        Err(ConfigError::ToleranceOutOfRange { name, value })
    } else {
        Ok(())
    }
}

impl RunConfig {
    /// Checks the whole option surface before any integrator is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_tolerance("rtol", self.rtol)?;
        check_tolerance("atol", self.atol)?;
        check_tolerance("fast_rtol", self.fast_rtol)?;
        if self.stiffness >= 0. {
            return Err(ConfigError::NonNegativeStiffness(self.stiffness));
        }
        if self.separation < 1. {
            return Err(ConfigError::SeparationTooSmall(self.separation));
        }
        if self.slow_selection().is_none() {
            return Err(ConfigError::UnknownSlowController(self.scontrol));
        }
        if self.fast_family().is_none() {
            return Err(ConfigError::UnknownFastController(self.fcontrol));
        }
        if self.accum_mode().is_none() {
            return Err(ConfigError::UnknownAccumulation(self.faccum));
        }
        if self.scontrol == 0 && self.hs <= 0. {
            return Err(ConfigError::NonPositiveStep {
                name: "hs",
                value: self.hs,
            });
        }
        if self.fcontrol == 0 && self.hf <= 0. {
            return Err(ConfigError::NonPositiveStep {
                name: "hf",
                value: self.hf,
            });
        }
        if self.set_h0 && self.hs <= 0. {
            return Err(ConfigError::NonPositiveStep {
                name: "hs",
                value: self.hs,
            });
        }
        if self.set_h0 && self.fast_order != 0 && self.hf <= 0. {
            return Err(ConfigError::NonPositiveStep {
                name: "hf",
                value: self.hf,
            });
        }
        match self.fast_order {
            0 | 2 | 3 | 4 | 5 => {}
            other => return Err(ConfigError::UnsupportedFastOrder(other)),
        }
        if self.safety != SENTINEL && (self.safety <= 0. || self.safety >= 1.) {
            return Err(ConfigError::InvalidSafety(self.safety));
        }
        self.lookup_method()?;
        Ok(())
    }

    pub fn lookup_method(&self) -> Result<&'static MriMethod, ConfigError> {
        lookup_method(&self.method).ok_or_else(|| ConfigError::UnknownMethod {
            name: self.method.clone(),
            known: method_names().join(", "),
        })
    }

    pub fn problem_params(&self) -> ProblemParams {
        ProblemParams {
            coupling: self.coupling,
            stiffness: self.stiffness,
            separation: self.separation,
        }
    }

    pub fn slow_selection(&self) -> Option<SlowSelection> {
        SlowSelection::from_selector(self.scontrol)
    }

    pub fn fast_family(&self) -> Option<ControllerFamily> {
        ControllerFamily::from_fast_selector(self.fcontrol)
    }

    pub fn accum_mode(&self) -> Option<AccumMode> {
        AccumMode::from_selector(self.faccum)
    }

    pub fn fast_active(&self) -> bool {
        self.fast_order != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(RunConfig::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_tolerances_are_rejected() {
        for (field, value) in &[("rtol", 1.5), ("rtol", 0.0), ("rtol", -1e-4)] {
            let mut cfg = RunConfig::default();
            match *field {
                "rtol" => cfg.rtol = *value,
                _ => unreachable!(),
            }
            assert!(cfg.validate().is_err(), "rtol = {} accepted", value);
        }
        let mut cfg = RunConfig::default();
        cfg.atol = 2.;
        assert!(cfg.validate().is_err());
        let mut cfg = RunConfig::default();
        cfg.fast_rtol = 0.;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parameter_domains_are_enforced() {
        let mut cfg = RunConfig::default();
        cfg.stiffness = 1.;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NonNegativeStiffness(_))
        ));
        let mut cfg = RunConfig::default();
        cfg.separation = 0.5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::SeparationTooSmall(_))
        ));
    }

    #[test]
    fn fixed_modes_require_positive_steps() {
        let mut cfg = RunConfig::default();
        cfg.scontrol = 0;
        cfg.hs = 0.;
        assert!(cfg.validate().is_err());
        let mut cfg = RunConfig::default();
        cfg.fcontrol = 0;
        cfg.hf = -1e-4;
        assert!(cfg.validate().is_err());
        // Adaptive modes tolerate an unset slow step.
        let mut cfg = RunConfig::default();
        cfg.hs = 0.;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn selector_ranges_are_enforced() {
        for bad in &[1, 4, 25, -1] {
            let mut cfg = RunConfig::default();
            cfg.scontrol = *bad;
            assert!(cfg.validate().is_err(), "scontrol = {} accepted", bad);
        }
        for bad in &[11, -1] {
            let mut cfg = RunConfig::default();
            cfg.fcontrol = *bad;
            assert!(cfg.validate().is_err(), "fcontrol = {} accepted", bad);
        }
        let mut cfg = RunConfig::default();
        cfg.faccum = 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_method_and_order_are_rejected() {
        let mut cfg = RunConfig::default();
        cfg.method = "rk4".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnknownMethod { .. })
        ));
        let mut cfg = RunConfig::default();
        cfg.fast_order = 7;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnsupportedFastOrder(7))
        ));
        let mut cfg = RunConfig::default();
        cfg.fast_order = 0;
        assert!(cfg.validate().is_ok());
    }
}
