mod linalg;
mod lsoda;
mod tolerance;
pub use lsoda::{Lsoda, Method, Task};
pub use tolerance::Tolerance;

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use thiserror::Error;

pub trait Integrator: Serialize + for<'a> Deserialize<'a> {
    // Set the initial and final conditions for the integration.
    fn initialise(&mut self, x_initial: f64, x_final: f64, y_initial: &[f64]) -> Result<(), Error>;
    // Begin the integration, with system containing derivation, solout, and associated data.
    fn integrate<S: System>(&mut self, system: &mut S) -> Result<Stats, Error>;
    // The final integrated quantities.
    fn y_final(&self) -> Vec<f64>;
}

/// Any type implementing the `System` trait must provide implementations for these function signatures,
/// which are called by the integrator for calculating derivatives and outputing intermediate solutions.
pub trait System {
    // Calculates the derivates of y with respect to x
    fn derive(
        &mut self,
        x: f64,
        y: &[f64],
        dy: &mut [f64],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    // Outputs the initial state and each accepted step of the solution
    fn solout(&mut self, _x: f64, _y: &[f64]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

/// Possible error conditions that may arise during integration.
#[derive(Debug, Error)]
pub enum Error {
    #[error("maximum number of steps reached ({n_step}) at x = {x}")]
    StepLimitReached { x: f64, n_step: usize },
    #[error("invalid {param}")]
    InvalidParameter { param: String },
    #[error("too much accuracy requested at x = {x}, tolerances should be scaled by at least {scale}")]
    AccuracyUnachievable { x: f64, scale: f64 },
    #[error("repeated error test failures at x = {x} with step size {h}, largest error in component {component}")]
    ErrorTestFailed { x: f64, h: f64, component: usize },
    #[error("repeated corrector convergence failures at x = {x} with step size {h}, largest error in component {component}")]
    ConvergenceFailed { x: f64, h: f64, component: usize },
    #[error("error weight of component {component} became non-positive at x = {x}")]
    NonPositiveWeight { x: f64, component: usize },
    #[error("x = {t} outside the last step [{start}, {end}]")]
    InterpolationOutOfRange { t: f64, start: f64, end: f64 },
    #[error("derivative order {k} exceeds the current order {order}")]
    InvalidDerivativeOrder { k: usize, order: usize },
    #[error("Error in `derive` or `solout` method")]
    External(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Contains some statistics of the integration.
#[derive(Debug, Default, Deserialize, Serialize, Copy, Clone, PartialEq, Eq)]
pub struct Stats {
    pub function_calls: usize,
    pub jacobian_evaluations: usize,
    pub accepted_steps: usize,
    // Attempts rejected by the error test or by a corrector convergence failure.
    pub rejected_steps: usize,
    pub method_switches: usize,
    // Steps for which t + h == t in floating point.
    pub step_size_warnings: usize,
}

impl Display for Stats {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "function evaluations: {}, ", self.function_calls)?;
        write!(f, "jacobian evaluations: {}, ", self.jacobian_evaluations)?;
        write!(f, "accepted steps: {}, ", self.accepted_steps)?;
        write!(f, "rejected steps: {}, ", self.rejected_steps)?;
        write!(f, "method switches: {}", self.method_switches)?;
        if self.step_size_warnings > 0 {
            write!(f, ", step size warnings: {}", self.step_size_warnings)?;
        }

        Ok(())
    }
}
