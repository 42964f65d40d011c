use crate::integrator::Error;
use itertools::izip;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

// The local error in y[i] is kept below relative[i] * abs!(y[i]) + absolute[i].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Tolerance {
    pub absolute: Vec<f64>,
    pub relative: Vec<f64>,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            absolute: vec![1e-9],
            relative: vec![1e-6],
        }
    }
}

impl Tolerance {
    pub fn new(relative: f64, absolute: f64) -> Self {
        Self {
            absolute: vec![absolute],
            relative: vec![relative],
        }
    }

    pub(crate) fn reconfigure(&mut self, system_size: usize) -> Result<(), Error> {
        Self::extend_or_error(&mut self.absolute, system_size)?;
        Self::extend_or_error(&mut self.relative, system_size)?;

        if let Some(value) = self
            .absolute
            .iter()
            .chain(&self.relative)
            .find(|value| !value.is_finite() || **value < 0.0)
        {
            return Err(Error::InvalidParameter {
                param: format!("tolerance: {value}"),
            });
        }
        Ok(())
    }

    // If a single tolerance value is provided, extend the vector to apply it to all elements.
    fn extend_or_error(tolerance: &mut Vec<f64>, system_size: usize) -> Result<(), Error> {
        match tolerance.len().cmp(&system_size) {
            Ordering::Less => {
                if tolerance.len() == 1 {
                    *tolerance = vec![tolerance[0]; system_size];
                    return Ok(());
                }
            }
            Ordering::Equal => return Ok(()),
            Ordering::Greater => (),
        };

        Err(Error::InvalidParameter {
            param: format!("tolerance: {tolerance:?}"),
        })
    }

    /// Fills `ewt` with the inverse error weights 1 / (relative * |y| + absolute).
    /// Fails with the index of the first component whose weight would not be positive.
    pub(crate) fn error_weights(&self, y: &[f64], ewt: &mut [f64]) -> Result<(), usize> {
        for (i, (weight, y_val, rtol, atol)) in
            izip!(ewt.iter_mut(), y, &self.relative, &self.absolute).enumerate()
        {
            let denominator = rtol * abs!(y_val) + atol;
            if denominator <= 0.0 {
                return Err(i);
            }
            *weight = 1.0 / denominator;
        }
        Ok(())
    }

    // Scalar tolerance used to size the first step: the largest relative
    // tolerance or, when all of them are zero, the largest absolute tolerance
    // relative to the initial state.
    pub(crate) fn initial_step_tolerance(&self, y: &[f64]) -> f64 {
        let mut tol = self.relative.iter().fold(0.0, |tol, rtol| max!(tol, *rtol));
        if tol <= 0.0 {
            for (atol, y_val) in izip!(&self.absolute, y) {
                if *y_val != 0.0 {
                    tol = max!(tol, atol / abs!(y_val));
                }
            }
        }
        tol
    }
}
