//! Livermore solver for ordinary differential equations with automatic method switching.
//!
//! Solves y' = f(t, y) with the variable-order, variable-step Adams (non-stiff)
//! and BDF (stiff) methods in Nordsieck form, switching between the two
//! families as the problem's stiffness changes. The Jacobian of the stiff
//! corrector is approximated by finite differences.
//!
//! L. R. Petzold & A. C. Hindmarsh, LSODA (1983).
mod coefficients;
mod corrector;
mod interpolate;
mod selector;
mod stepper;
mod switcher;

pub use coefficients::Method;
use coefficients::{ADAMS_MAX_ORDER, BDF_MAX_ORDER};
use stepper::{Start, StepOutcome, Stepper};

use crate::integrator::linalg::{argmax_abs, scale, weighted_max_norm};
use crate::integrator::{Error, Integrator, Stats, System, Tolerance};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// When `advance` returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
pub enum Task {
    /// At `tout` exactly, interpolating from the step that passed it.
    #[default]
    Exact,
    /// After the first internal step reaching or passing `tout`.
    Overshoot,
    /// After one internal step.
    OneStep,
    /// As `Exact`, without ever stepping past `tcrit`.
    ExactCritical { tcrit: f64 },
    /// As `OneStep`, without ever stepping past `tcrit`.
    OneStepCritical { tcrit: f64 },
}

impl Task {
    fn tcrit(self) -> Option<f64> {
        match self {
            Task::ExactCritical { tcrit } | Task::OneStepCritical { tcrit } => Some(tcrit),
            _ => None,
        }
    }
}

// Entry state of the next call to `advance`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Phase {
    #[default]
    Uninitialised,
    FreshStart,
    Continue,
    NewParameters,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[serde(deny_unknown_fields)]
pub struct Lsoda {
    x_initial: f64,
    x_final: f64,
    y_initial: Vec<f64>,
    y_final: Vec<f64>,
    // Vectors of positional tolerance.
    tolerance: Tolerance,
    // Size of the first step. 0 selects it automatically.
    first_step_size: f64, // H0
    // Maximum absolute step size. 0 means unbounded.
    max_step_size: f64, // HMAX
    min_step_size: f64, // HMIN
    // Maximum orders of the Adams and BDF methods, capped at 12 and 5.
    max_order_nonstiff: usize, // MXORDN
    max_order_stiff: usize,    // MXORDS
    // Maximum number of internal steps per call to `advance`. 0 means 500.
    max_integration_steps: usize, // MXSTEP
    // Number of times the "t + h = t" warning is logged. 0 means 10.
    max_step_warnings: usize, // MXHNIL

    #[serde(skip)]
    phase: Phase,
    #[serde(skip)]
    stepper: Stepper,
    // Time and solution returned by the last call.
    #[serde(skip)]
    t: f64,
    #[serde(skip)]
    y: Vec<f64>,
    #[serde(skip)]
    tolsf: f64,
    // Time of the last method switch.
    #[serde(skip)]
    tsw: f64,
    #[serde(skip)]
    nhnil: usize,
}

impl Default for Lsoda {
    fn default() -> Self {
        Self {
            x_initial: 0.0,
            x_final: 0.0,
            y_initial: vec![],
            y_final: vec![],
            tolerance: Tolerance::default(),
            first_step_size: 0.0,
            max_step_size: 0.0,
            min_step_size: 0.0,
            max_order_nonstiff: ADAMS_MAX_ORDER,
            max_order_stiff: BDF_MAX_ORDER,
            max_integration_steps: 500,
            max_step_warnings: 10,

            phase: Phase::Uninitialised,
            stepper: Stepper::default(),
            t: 0.0,
            y: vec![],
            tolsf: 0.0,
            tsw: 0.0,
            nhnil: 0,
        }
    }
}

impl Integrator for Lsoda {
    fn initialise(&mut self, x_initial: f64, x_final: f64, y_initial: &[f64]) -> Result<(), Error> {
        self.initialise(x_initial, x_final, y_initial);
        self.reconfigure()
    }

    fn integrate<S: System>(&mut self, system: &mut S) -> Result<Stats, Error> {
        let x_final = self.x_final;
        let result = self.advance(system, x_final, Task::Exact);
        self.y_final.clone_from(&self.y);
        result.map(|_| self.stats())
    }

    fn y_final(&self) -> Vec<f64> {
        self.y_final.clone()
    }
}

impl Lsoda {
    pub fn new() -> Self {
        Self::default()
    }

    fn initialise(&mut self, x_initial: f64, x_final: f64, y_initial: &[f64]) {
        self.x_initial = x_initial;
        self.x_final = x_final;
        self.y_initial = y_initial.to_vec();
        self.t = x_initial;
        self.y = y_initial.to_vec();
        self.phase = Phase::FreshStart;
    }

    // Validates the settings and fills in the defaults that depend on them.
    fn reconfigure(&mut self) -> Result<(), Error> {
        if self.y.is_empty() {
            return Err(Error::InvalidParameter {
                param: "system size: 0".to_string(),
            });
        }
        self.tolerance.reconfigure(self.y.len())?;

        if self.max_order_nonstiff == 0 {
            return Err(Error::InvalidParameter {
                param: format!("max_order_nonstiff: {}", self.max_order_nonstiff),
            });
        }
        if self.max_order_stiff == 0 {
            return Err(Error::InvalidParameter {
                param: format!("max_order_stiff: {}", self.max_order_stiff),
            });
        }
        if self.max_step_size.is_nan() || self.max_step_size < 0.0 {
            return Err(Error::InvalidParameter {
                param: format!("max_step_size: {}", self.max_step_size),
            });
        }
        if !self.min_step_size.is_finite() || self.min_step_size < 0.0 {
            return Err(Error::InvalidParameter {
                param: format!("min_step_size: {}", self.min_step_size),
            });
        }
        if !self.first_step_size.is_finite() {
            return Err(Error::InvalidParameter {
                param: format!("first_step_size: {}", self.first_step_size),
            });
        }

        if self.max_integration_steps == 0 {
            self.max_integration_steps = 500;
        }
        if self.max_step_warnings == 0 {
            self.max_step_warnings = 10;
        }
        Ok(())
    }

    // Pushes the step bounds and order limits into the step controller.
    fn apply_settings(&mut self) {
        let stepper = &mut self.stepper;
        stepper.hmin = self.min_step_size;
        stepper.hmxi = if self.max_step_size > 0.0 {
            1.0 / self.max_step_size
        } else {
            0.0
        };
        stepper.mxordn = min!(self.max_order_nonstiff, ADAMS_MAX_ORDER);
        stepper.mxords = min!(self.max_order_stiff, BDF_MAX_ORDER);
        stepper.maxord = match stepper.meth {
            Method::Adams => stepper.mxordn,
            Method::Bdf => stepper.mxords,
        };
    }

    fn mark_changed(&mut self) {
        if self.phase == Phase::Continue {
            self.phase = Phase::NewParameters;
        }
    }

    pub fn set_tolerance(&mut self, tolerance: Tolerance) {
        self.tolerance = tolerance;
        self.mark_changed();
    }

    pub fn set_first_step_size(&mut self, h0: f64) {
        self.first_step_size = h0;
    }

    pub fn set_max_step_size(&mut self, hmax: f64) {
        self.max_step_size = hmax;
        self.mark_changed();
    }

    pub fn set_min_step_size(&mut self, hmin: f64) {
        self.min_step_size = hmin;
        self.mark_changed();
    }

    pub fn set_max_order_nonstiff(&mut self, order: usize) {
        self.max_order_nonstiff = order;
        self.mark_changed();
    }

    pub fn set_max_order_stiff(&mut self, order: usize) {
        self.max_order_stiff = order;
        self.mark_changed();
    }

    pub fn set_max_integration_steps(&mut self, steps: usize) {
        self.max_integration_steps = steps;
        self.mark_changed();
    }

    pub fn set_max_step_warnings(&mut self, warnings: usize) {
        self.max_step_warnings = warnings;
        self.mark_changed();
    }

    /// Solution at the time returned by the last call to `advance`.
    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn stats(&self) -> Stats {
        let s = &self.stepper;
        Stats {
            function_calls: s.nfe,
            jacobian_evaluations: s.nje,
            accepted_steps: s.nst,
            rejected_steps: s.netf + s.ncfn,
            method_switches: s.nswitch,
            step_size_warnings: self.nhnil,
        }
    }

    /// Order of the last successful step.
    pub fn order_used(&self) -> usize {
        self.stepper.nqu
    }

    /// Order to be attempted on the next step.
    pub fn order_next(&self) -> usize {
        self.stepper.nq
    }

    pub fn step_used(&self) -> f64 {
        self.stepper.hu
    }

    pub fn step_next(&self) -> f64 {
        self.stepper.h
    }

    /// Time reached by the integrator. With `Task::Exact` this lies at or beyond
    /// the returned time.
    pub fn current_time(&self) -> f64 {
        self.stepper.tn
    }

    pub fn method_used(&self) -> Method {
        self.stepper.mused
    }

    pub fn method_next(&self) -> Method {
        self.stepper.meth
    }

    pub fn last_switch_time(&self) -> f64 {
        self.tsw
    }

    /// Factor by which the tolerances should be scaled up when
    /// `Error::AccuracyUnachievable` is returned.
    pub fn tolerance_scale(&self) -> f64 {
        self.tolsf
    }

    /// k-th derivative of the solution at `t`, which must lie within the last
    /// step taken. `k` may not exceed `order_next()`.
    pub fn interpolate(&self, t: f64, k: usize, dky: &mut [f64]) -> Result<(), Error> {
        if self.phase == Phase::Uninitialised || self.phase == Phase::FreshStart {
            return Err(Error::InvalidParameter {
                param: "interpolation before the first step".to_string(),
            });
        }
        if dky.len() != self.stepper.n {
            return Err(Error::InvalidParameter {
                param: format!("dky length: {}", dky.len()),
            });
        }
        self.stepper.interpolate(t, k, dky)
    }

    /// Integrates towards `tout` and returns the time reached; the solution
    /// is then available from `y()`.
    ///
    /// The first call after `initialise` starts the integration, later calls
    /// continue it. Changing a setting between calls is taken into account
    /// without losing the integration history.
    pub fn advance<S: System>(&mut self, system: &mut S, tout: f64, task: Task) -> Result<f64, Error> {
        if !tout.is_finite() {
            return Err(Error::InvalidParameter {
                param: format!("tout: {tout}"),
            });
        }
        if let Some(tcrit) = task.tcrit() {
            if !tcrit.is_finite() {
                return Err(Error::InvalidParameter {
                    param: format!("tcrit: {tcrit}"),
                });
            }
        }

        // The weights were just set by a fresh start.
        let mut weights_current = self.phase == Phase::FreshStart;
        let nslast = match self.phase {
            Phase::Uninitialised => {
                return Err(Error::InvalidParameter {
                    param: "initial conditions: not set".to_string(),
                });
            }
            Phase::FreshStart => {
                self.reconfigure()?;
                self.start(system, tout, task)?;
                0
            }
            Phase::Continue | Phase::NewParameters => {
                if self.phase == Phase::NewParameters {
                    self.reconfigure()?;
                    self.apply_settings();
                    let stepper = &mut self.stepper;
                    let rh = abs!(stepper.h) * stepper.hmxi;
                    if rh > 1.0 {
                        stepper.h /= rh;
                    }
                    stepper.start = Start::Reconfigured;
                    self.phase = Phase::Continue;
                }
                if let Some(t) = self.check_stop_before_step(tout, task)? {
                    return Ok(t);
                }
                self.stepper.nst
            }
        };

        loop {
            if !weights_current {
                if self.stepper.nst - nslast >= self.max_integration_steps {
                    self.take_solution();
                    debug!(
                        "at t = {}, {} steps taken on this call before reaching tout",
                        self.t, self.max_integration_steps
                    );
                    return Err(Error::StepLimitReached {
                        x: self.t,
                        n_step: self.max_integration_steps,
                    });
                }
                let stepper = &mut self.stepper;
                if let Err(component) = self.tolerance.error_weights(&stepper.yh[0], &mut stepper.ewt) {
                    self.take_solution();
                    return Err(Error::NonPositiveWeight {
                        x: self.t,
                        component,
                    });
                }
            }
            weights_current = false;

            self.tolsf = f64::EPSILON * weighted_max_norm(&self.stepper.yh[0], &self.stepper.ewt);
            if self.tolsf > 0.01 {
                self.tolsf *= 200.0;
                if self.stepper.nst == 0 {
                    return Err(Error::InvalidParameter {
                        param: format!(
                            "tolerance: too much accuracy requested at the start, scale by {}",
                            self.tolsf
                        ),
                    });
                }
                self.take_solution();
                return Err(Error::AccuracyUnachievable {
                    x: self.t,
                    scale: self.tolsf,
                });
            }

            if self.stepper.tn + self.stepper.h == self.stepper.tn {
                self.nhnil += 1;
                if self.nhnil <= self.max_step_warnings {
                    warn!(
                        "t (= {}) and h (= {}) are such that t + h = t on the next step, integration continues",
                        self.stepper.tn, self.stepper.h
                    );
                    if self.nhnil == self.max_step_warnings {
                        warn!(
                            "the t + h = t warning has been issued {} times and will not be issued again",
                            self.nhnil
                        );
                    }
                }
            }

            let outcome = match self.stepper.step(system) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.take_solution();
                    return Err(e);
                }
            };
            match outcome {
                StepOutcome::Accepted => {
                    self.after_switch();
                    if let Err(e) = system.solout(self.stepper.tn, &self.stepper.yh[0]) {
                        self.take_solution();
                        return Err(e.into());
                    }
                    if let Some(t) = self.check_stop_after_step(tout, task)? {
                        return Ok(t);
                    }
                }
                outcome => return Err(self.step_failure(outcome)),
            }
        }
    }

    // Fresh start: allocates the working state, evaluates the initial
    // derivative and chooses the first step size.
    fn start<S: System>(&mut self, system: &mut S, tout: f64, task: Task) -> Result<(), Error> {
        let n = self.y.len();
        let t = self.t;
        let mut h0 = self.first_step_size;

        if tout == t {
            return Err(Error::InvalidParameter {
                param: format!("tout: {tout} equals the initial time"),
            });
        }
        if (tout - t) * h0 < 0.0 {
            return Err(Error::InvalidParameter {
                param: format!("first_step_size: {h0} points away from tout"),
            });
        }
        if let Some(tcrit) = task.tcrit() {
            if (tcrit - tout) * (tout - t) < 0.0 {
                return Err(Error::InvalidParameter {
                    param: format!("tcrit: {tcrit} lies behind tout"),
                });
            }
        }

        self.stepper = Stepper::new(n);
        self.apply_settings();
        self.nhnil = 0;
        self.tsw = t;
        self.tolsf = 0.0;

        let stepper = &mut self.stepper;
        stepper.tn = t;
        stepper.yh[0].copy_from_slice(&self.y);
        system.derive(t, &self.y, &mut stepper.yh[1])?;
        stepper.nfe = 1;

        if let Err(component) = self.tolerance.error_weights(&self.y, &mut stepper.ewt) {
            return Err(Error::InvalidParameter {
                param: format!("tolerance: error weight of component {component} is not positive"),
            });
        }

        if h0 == 0.0 {
            let tdist = abs!(tout - t);
            let w0 = max!(abs!(t), abs!(tout));
            if tdist < 2.0 * f64::EPSILON * w0 {
                return Err(Error::InvalidParameter {
                    param: format!("tout: {tout} too close to the initial time to start"),
                });
            }
            let tol = self.tolerance.initial_step_tolerance(&self.y);
            let tol = min!(max!(tol, 100.0 * f64::EPSILON), 0.001);
            let sum = weighted_max_norm(&stepper.yh[1], &stepper.ewt);
            let sum = 1.0 / (tol * w0 * w0) + tol * sum * sum;
            let h = min!(1.0 / sqrt!(sum), tdist);
            h0 = h.copysign(tout - t);
            debug!("automatic initial step size {h0}");
        }
        if let Some(tcrit) = task.tcrit() {
            if (t + h0 - tcrit) * h0 > 0.0 {
                h0 = tcrit - t;
            }
        }
        let rh = abs!(h0) * stepper.hmxi;
        if rh > 1.0 {
            h0 /= rh;
        }

        stepper.h = h0;
        stepper.start = Start::Fresh;
        scale(h0, &mut stepper.yh[1]);

        system.solout(t, &self.y)?;
        self.phase = Phase::Continue;
        Ok(())
    }

    // Checks, before any step is taken on a continuation call, whether the
    // task is already complete, and shortens h to reach a critical time.
    fn check_stop_before_step(&mut self, tout: f64, task: Task) -> Result<Option<f64>, Error> {
        let tn = self.stepper.tn;
        let h = self.stepper.h;

        match task {
            Task::Exact => {
                if (tn - tout) * h >= 0.0 {
                    return self.interpolate_to(tout).map(Some);
                }
                Ok(None)
            }
            Task::OneStep => Ok(None),
            Task::Overshoot => {
                let tp = tn - self.stepper.hu * (1.0 + 100.0 * f64::EPSILON);
                if (tp - tout) * h > 0.0 {
                    return Err(Error::InvalidParameter {
                        param: format!("tout: {tout} lies behind the last step"),
                    });
                }
                if (tn - tout) * h < 0.0 {
                    return Ok(None);
                }
                Ok(Some(self.solution_at_tn()))
            }
            Task::ExactCritical { tcrit } | Task::OneStepCritical { tcrit } => {
                if (tn - tcrit) * h > 0.0 {
                    return Err(Error::InvalidParameter {
                        param: format!("tcrit: {tcrit} lies behind the current time {tn}"),
                    });
                }
                if let Task::ExactCritical { .. } = task {
                    if (tcrit - tout) * h < 0.0 {
                        return Err(Error::InvalidParameter {
                            param: format!("tcrit: {tcrit} lies behind tout"),
                        });
                    }
                    if (tn - tout) * h >= 0.0 {
                        return self.interpolate_to(tout).map(Some);
                    }
                }
                if self.hits_tcrit(tcrit) {
                    return Ok(Some(self.take_critical_solution(tcrit)));
                }
                self.approach_tcrit(tcrit);
                Ok(None)
            }
        }
    }

    // Checks after an accepted step whether the call is complete.
    fn check_stop_after_step(&mut self, tout: f64, task: Task) -> Result<Option<f64>, Error> {
        let tn = self.stepper.tn;
        let h = self.stepper.h;

        match task {
            Task::Exact => {
                if (tn - tout) * h < 0.0 {
                    return Ok(None);
                }
                self.interpolate_to(tout).map(Some)
            }
            Task::OneStep => Ok(Some(self.solution_at_tn())),
            Task::Overshoot => {
                if (tn - tout) * h < 0.0 {
                    return Ok(None);
                }
                Ok(Some(self.solution_at_tn()))
            }
            Task::ExactCritical { tcrit } => {
                if (tn - tout) * h >= 0.0 {
                    return self.interpolate_to(tout).map(Some);
                }
                if self.hits_tcrit(tcrit) {
                    return Ok(Some(self.take_critical_solution(tcrit)));
                }
                self.approach_tcrit(tcrit);
                Ok(None)
            }
            Task::OneStepCritical { tcrit } => {
                if self.hits_tcrit(tcrit) {
                    return Ok(Some(self.take_critical_solution(tcrit)));
                }
                Ok(Some(self.solution_at_tn()))
            }
        }
    }

    fn hits_tcrit(&self, tcrit: f64) -> bool {
        let hmx = abs!(self.stepper.tn) + abs!(self.stepper.h);
        abs!(self.stepper.tn - tcrit) <= 100.0 * f64::EPSILON * hmx
    }

    // Shortens the next step so that it does not pass tcrit.
    fn approach_tcrit(&mut self, tcrit: f64) {
        let stepper = &mut self.stepper;
        let tnext = stepper.tn + stepper.h * (1.0 + 4.0 * f64::EPSILON);
        if (tnext - tcrit) * stepper.h <= 0.0 {
            return;
        }
        stepper.h = (tcrit - stepper.tn) * (1.0 - 4.0 * f64::EPSILON);
        if stepper.start == Start::Continue {
            stepper.start = Start::NewStepSize;
        }
    }

    fn interpolate_to(&mut self, tout: f64) -> Result<f64, Error> {
        self.stepper.interpolate(tout, 0, &mut self.y)?;
        self.t = tout;
        Ok(tout)
    }

    // Copies the solution at the last accepted step into `y`.
    fn take_solution(&mut self) {
        self.y.copy_from_slice(&self.stepper.yh[0]);
        self.t = self.stepper.tn;
    }

    fn solution_at_tn(&mut self) -> f64 {
        self.take_solution();
        self.t
    }

    fn take_critical_solution(&mut self, tcrit: f64) -> f64 {
        self.take_solution();
        self.t = tcrit;
        tcrit
    }

    // A step that returns with a new method family restarts the step
    // controller with that family's coefficients and order limit.
    fn after_switch(&mut self) {
        let stepper = &mut self.stepper;
        if stepper.meth == stepper.mused {
            return;
        }
        self.tsw = stepper.tn;
        stepper.maxord = match stepper.meth {
            Method::Adams => stepper.mxordn,
            Method::Bdf => stepper.mxords,
        };
        stepper.start = Start::Reconfigured;
        info!(
            "method switch to {:?} at t = {}, step size {}, order {}",
            stepper.meth, stepper.tn, stepper.h, stepper.nq
        );
    }

    fn step_failure(&mut self, outcome: StepOutcome) -> Error {
        let stepper = &self.stepper;
        let weighted: Vec<f64> = stepper
            .acor
            .iter()
            .zip(&stepper.ewt)
            .map(|(a, w)| a * w)
            .collect();
        let component = argmax_abs(&weighted);
        let h = stepper.h;
        self.take_solution();
        debug!(
            "step failed at t = {} with h = {}, largest local error in component {}",
            self.t, h, component
        );
        match outcome {
            StepOutcome::ConvergenceFailed => Error::ConvergenceFailed {
                x: self.t,
                h,
                component,
            },
            _ => Error::ErrorTestFailed {
                x: self.t,
                h,
                component,
            },
        }
    }
}
