// Stiffness detection: compares the step size the current family can take
// with the one the other family would allow at the same accuracy.

use super::coefficients::{ADAMS_STABILITY, BDF_MAX_ORDER, Method};
use super::stepper::{SWITCH_CHECK_INTERVAL, SWITCH_RATIO, Stepper};
use crate::integrator::linalg::weighted_max_norm;
use log::debug;

fn ratio_for(error: f64, exponent: f64) -> f64 {
    1.0 / (1.2 * error.powf(exponent) + 0.000_001_2)
}

impl Stepper {
    // Called after an accepted step. When the other family promises a
    // sufficiently larger step, switches `meth` and the order and returns the
    // step size ratio to apply.
    pub(super) fn consider_method_switch(&mut self, dsm: f64, pnorm: f64) -> Option<f64> {
        let (rh, nq) = match self.meth {
            Method::Adams => self.adams_to_bdf(dsm, pnorm)?,
            Method::Bdf => self.bdf_to_adams(dsm, pnorm)?,
        };
        let target = match self.meth {
            Method::Adams => Method::Bdf,
            Method::Bdf => Method::Adams,
        };
        debug!(
            "switching from {:?} order {} to {:?} order {} at t = {}, step ratio {}",
            self.meth, self.nq, target, nq, self.tn, rh
        );
        self.meth = target;
        self.icount = SWITCH_CHECK_INTERVAL;
        self.pdlast = 0.0;
        self.nq = nq;
        self.nswitch += 1;
        Some(rh)
    }

    fn adams_to_bdf(&mut self, dsm: f64, pnorm: f64) -> Option<(f64, usize)> {
        if self.nq > BDF_MAX_ORDER {
            return None;
        }
        if dsm <= 100.0 * pnorm * f64::EPSILON || self.pdest == 0.0 {
            // The error estimate is polluted by roundoff or no Lipschitz
            // estimate is available: switch only if the step was cut by the
            // stability bound.
            if !self.irflag {
                return None;
            }
            return Some((2.0, min!(self.nq, self.mxords)));
        }

        let exsm = 1.0 / (self.nq + 1) as f64;
        let mut rh1 = ratio_for(dsm, exsm);
        let mut rh1it = 2.0 * rh1;
        let pdh = self.pdlast * abs!(self.h);
        if pdh * rh1 > 0.000_01 {
            rh1it = ADAMS_STABILITY[self.nq] / pdh;
        }
        rh1 = min!(rh1, rh1it);

        let (rh2, nqm2) = if self.nq > self.mxords {
            let dm2 = weighted_max_norm(&self.yh[self.mxords + 1], &self.ewt)
                / self.bdf.error_constant(self.mxords);
            (ratio_for(dm2, 1.0 / (self.mxords + 1) as f64), self.mxords)
        } else {
            let dm2 = dsm * (self.adams.error_constant(self.nq) / self.bdf.error_constant(self.nq));
            (ratio_for(dm2, exsm), self.nq)
        };
        if rh2 < SWITCH_RATIO * rh1 {
            return None;
        }
        Some((rh2, nqm2))
    }

    fn bdf_to_adams(&mut self, dsm: f64, pnorm: f64) -> Option<(f64, usize)> {
        let exsm = 1.0 / (self.nq + 1) as f64;
        let (mut dm1, mut rh1, nqm1, exm1) = if self.mxordn < self.nq {
            let exm1 = 1.0 / (self.mxordn + 1) as f64;
            let dm1 = weighted_max_norm(&self.yh[self.mxordn + 1], &self.ewt)
                / self.adams.error_constant(self.mxordn);
            (dm1, ratio_for(dm1, exm1), self.mxordn, exm1)
        } else {
            let dm1 = dsm * (self.bdf.error_constant(self.nq) / self.adams.error_constant(self.nq));
            (dm1, ratio_for(dm1, exsm), self.nq, exsm)
        };

        let mut rh1it = 2.0 * rh1;
        let pdh = self.pdnorm * abs!(self.h);
        if pdh * rh1 > 0.000_01 {
            rh1it = ADAMS_STABILITY[nqm1] / pdh;
        }
        rh1 = min!(rh1, rh1it);
        let rh2 = ratio_for(dsm, exsm);
        if rh1 * SWITCH_RATIO < 5.0 * rh2 {
            return None;
        }

        // The Adams error estimate at the new step must not be at the roundoff level.
        let alpha = max!(0.001, rh1);
        dm1 *= alpha.powf(exm1);
        if dm1 <= 1000.0 * f64::EPSILON * pnorm {
            return None;
        }
        Some((rh1, nqm1))
    }
}
