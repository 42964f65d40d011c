// Order and step size selection after a successful step or a failed error test.

use super::coefficients::ADAMS_STABILITY;
use super::stepper::{OrderChange, Stepper};
use crate::integrator::linalg::weighted_max_norm;
use itertools::izip;

impl Stepper {
    // Chooses among orders nq - 1, nq and nq + 1 the one allowing the largest
    // step. `rhup` is the ratio already computed for nq + 1 (0 when that order
    // is not considered), `dsm` the error estimate at nq and `failures` the
    // number of error test failures on the current step.
    //
    // Returns the kind of change together with the step size ratio. When the
    // order is raised the new Nordsieck row is filled in here; the caller must
    // reload the coefficients for any order change.
    pub(super) fn select_order(&mut self, rhup: f64, dsm: f64, failures: usize) -> (OrderChange, f64) {
        let mut rhup = rhup;
        let exsm = 1.0 / (self.nq + 1) as f64;
        let mut rhsm = 1.0 / (1.2 * dsm.powf(exsm) + 0.000_001_2);
        let mut rhdn = 0.0;
        if self.nq != 1 {
            let ddn = weighted_max_norm(&self.yh[self.nq], &self.ewt) / self.tesco[0];
            let exdn = 1.0 / self.nq as f64;
            rhdn = 1.0 / (1.3 * ddn.powf(exdn) + 0.000_001_3);
        }

        // Adams ratios are further limited by the stability region.
        let adams = !self.newton();
        if adams {
            self.pdh = max!(abs!(self.h) * self.pdlast, 0.000_001);
            if self.nq < self.maxord {
                rhup = min!(rhup, ADAMS_STABILITY[self.nq + 1] / self.pdh);
            }
            rhsm = min!(rhsm, ADAMS_STABILITY[self.nq] / self.pdh);
            if self.nq > 1 {
                rhdn = min!(rhdn, ADAMS_STABILITY[self.nq - 1] / self.pdh);
            }
            self.pdest = 0.0;
        }

        let lower = |rhdn: f64| {
            if failures > 0 && rhdn > 1.0 { 1.0 } else { rhdn }
        };
        let (newq, mut rh) = if rhsm >= rhup {
            if rhsm >= rhdn {
                (self.nq, rhsm)
            } else {
                (self.nq - 1, lower(rhdn))
            }
        } else if rhup <= rhdn {
            (self.nq - 1, lower(rhdn))
        } else {
            if rhup < 1.1 {
                self.ialth = 3;
                return (OrderChange::None, rhup);
            }
            let r = self.el[self.nq] / (self.nq + 1) as f64;
            self.nq += 1;
            let nq = self.nq;
            for (yh, a) in izip!(self.yh[nq].iter_mut(), &self.acor) {
                *yh = a * r;
            }
            return (OrderChange::StepSizeAndOrder, rhup);
        };

        // Gains below 10% are not worth a change, unless h is held back by
        // the Adams stability bound.
        let stability_bound = adams && rh * self.pdh * 1.00001 >= ADAMS_STABILITY[newq];
        if failures == 0 && rh < 1.1 && !stability_bound {
            self.ialth = 3;
            return (OrderChange::None, rh);
        }
        if failures >= 2 {
            rh = min!(rh, 0.2);
        }

        if newq == self.nq {
            (OrderChange::StepSize, rh)
        } else {
            self.nq = newq;
            (OrderChange::StepSizeAndOrder, rh)
        }
    }
}
