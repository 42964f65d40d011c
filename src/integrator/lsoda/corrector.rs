// Corrector iteration for the implicit multistep equation
//
//     y_n - h * el0 * f(t_n, y_n) - a_n = 0,
//
// by functional iteration (Adams) or a chord/modified Newton iteration with
// the iteration matrix P = I - h * el0 * J (BDF).

use super::stepper::{MAXCOR, MXNCF, Stepper};
use crate::integrator::linalg::{SingularMatrix, lu_factor, lu_solve, weighted_matrix_norm, weighted_max_norm};
use crate::integrator::{Error, System};
use itertools::izip;
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) enum CorrectorOutcome {
    // `del` is the weighted norm of the last increment.
    Converged { del: f64, iterations: usize },
    // The Nordsieck array has been retracted; retry with h scaled by rh.
    RetryWithSmallerStep { rh: f64 },
    Failed,
}

impl Stepper {
    // Solves the corrector equation at tn, starting from the prediction in yh.
    // On convergence `acor` holds the accumulated correction and `y` the
    // corrected solution.
    pub(super) fn correct<S: System>(
        &mut self,
        system: &mut S,
        pnorm: f64,
        ncf: &mut usize,
    ) -> Result<CorrectorOutcome, Error> {
        let mut m = 0;
        let mut rate: f64 = 0.0;
        let mut delp = 0.0;

        self.y.copy_from_slice(&self.yh[0]);
        system.derive(self.tn, &self.y, &mut self.savf)?;
        self.nfe += 1;

        loop {
            if m == 0 {
                if self.ipup {
                    let factorisation = self.evaluate_iteration_matrix(system)?;
                    self.ipup = false;
                    self.rc = 1.0;
                    self.nslp = self.nst;
                    self.conv_rate = 0.7;
                    if let Err(singular) = factorisation {
                        debug!(
                            "singular iteration matrix at t = {} (column {}), h = {}",
                            self.tn, singular.column, self.h
                        );
                        return Ok(self.corrector_failure(ncf));
                    }
                }
                self.acor.fill(0.0);
            }

            let del = if self.newton() {
                for (y, f, yh1, a) in izip!(self.y.iter_mut(), &self.savf, &self.yh[1], &self.acor) {
                    *y = self.h * f - (yh1 + a);
                }
                self.solve_correction();
                let del = weighted_max_norm(&self.y, &self.ewt);
                for (a, y, yh0) in izip!(self.acor.iter_mut(), self.y.iter_mut(), &self.yh[0]) {
                    *a += *y;
                    *y = yh0 + self.el[0] * *a;
                }
                del
            } else {
                // Functional iteration: the correction is the residual itself.
                for (s, y, yh1, a) in izip!(self.savf.iter_mut(), self.y.iter_mut(), &self.yh[1], &self.acor) {
                    *s = self.h * *s - yh1;
                    *y = *s - a;
                }
                let del = weighted_max_norm(&self.y, &self.ewt);
                for (y, a, s, yh0) in izip!(self.y.iter_mut(), self.acor.iter_mut(), &self.savf, &self.yh[0]) {
                    *y = yh0 + self.el[0] * s;
                    *a = *s;
                }
                del
            };

            // A change of the size of roundoff means convergence. Otherwise the
            // Adams iteration is forced through two passes so a Lipschitz
            // constant estimate is available.
            if del <= 100.0 * pnorm * f64::EPSILON {
                return Ok(CorrectorOutcome::Converged { del, iterations: m });
            }
            if m != 0 || self.newton() {
                if m != 0 {
                    let rm = if del <= 1024.0 * delp { del / delp } else { 1024.0 };
                    rate = max!(rate, rm);
                    self.conv_rate = max!(0.2 * self.conv_rate, rm);
                }
                let dcon = del * min!(1.0, 1.5 * self.conv_rate) / (self.tesco[1] * self.conit);
                if dcon <= 1.0 {
                    self.pdest = max!(self.pdest, rate / abs!(self.h * self.el[0]));
                    if self.pdest != 0.0 {
                        self.pdlast = self.pdest;
                    }
                    return Ok(CorrectorOutcome::Converged { del, iterations: m });
                }
            }

            m += 1;
            if m == MAXCOR || (m >= 2 && del > 2.0 * delp) {
                if !self.newton() || self.jcur {
                    return Ok(self.corrector_failure(ncf));
                }
                // Stale iteration matrix: re-evaluate it and restart from the prediction.
                self.ipup = true;
                m = 0;
                rate = 0.0;
                self.y.copy_from_slice(&self.yh[0]);
            } else {
                delp = del;
            }
            system.derive(self.tn, &self.y, &mut self.savf)?;
            self.nfe += 1;
        }
    }

    // Retracts the prediction after a convergence failure and decides whether
    // a smaller step is worth trying.
    fn corrector_failure(&mut self, ncf: &mut usize) -> CorrectorOutcome {
        *ncf += 1;
        self.ncfn += 1;
        self.rmax = 2.0;
        self.tn = self.told;
        self.retract();
        if abs!(self.h) <= self.hmin * 1.00001 || *ncf == MXNCF {
            return CorrectorOutcome::Failed;
        }
        self.ipup = self.newton();
        CorrectorOutcome::RetryWithSmallerStep { rh: 0.25 }
    }

    // Forms P = I - h * el0 * J with a forward difference Jacobian, one
    // perturbed derivative evaluation per column, and factors it in place.
    // Expects `y` = prediction and `savf` = f(tn, y).
    fn evaluate_iteration_matrix<S: System>(
        &mut self,
        system: &mut S,
    ) -> Result<Result<(), SingularMatrix>, Error> {
        self.nje += 1;
        self.jcur = true;
        let hl0 = self.h * self.el0;

        let fac = weighted_max_norm(&self.savf, &self.ewt);
        let mut r0 = 1000.0 * abs!(self.h) * f64::EPSILON * self.n as f64 * fac;
        if r0 == 0.0 {
            r0 = 1.0;
        }
        let srur = sqrt!(f64::EPSILON);

        for j in 0..self.n {
            let yj = self.y[j];
            let r = max!(srur * abs!(yj), r0 / self.ewt[j]);
            self.y[j] += r;
            let fac = -hl0 / r;
            system.derive(self.tn, &self.y, &mut self.acor)?;
            for (w, a, s) in izip!(self.wm[j].iter_mut(), &self.acor, &self.savf) {
                *w = (a - s) * fac;
            }
            self.y[j] = yj;
        }
        self.nfe += self.n;

        self.pdnorm = weighted_matrix_norm(&self.wm, &self.ewt) / abs!(hl0);

        for (j, column) in self.wm.iter_mut().enumerate() {
            column[j] += 1.0;
        }
        Ok(lu_factor(&mut self.wm, &mut self.ipvt))
    }

    // Overwrites `y` with P^-1 y using the stored factors.
    fn solve_correction(&mut self) {
        lu_solve(&self.wm, &self.ipvt, &mut self.y);
    }
}
