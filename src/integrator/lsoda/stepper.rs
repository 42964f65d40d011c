// One step of the variable-order, variable-step Adams/BDF method in Nordsieck
// form, with local error control and automatic method switching.
//
// K. Radhakrishnan & A. C. Hindmarsh, Description and Use of LSODE, the
// Livermore Solver for Ordinary Differential Equations, LLNL UCRL-ID-113855
// (1993), chapter 3.

use super::coefficients::{ADAMS_MAX_ORDER, ADAMS_STABILITY, Method, MethodCoefficients};
use super::corrector::CorrectorOutcome;
use crate::integrator::linalg::{axpy, scale, weighted_max_norm};
use crate::integrator::{Error, System};
use itertools::izip;

// Maximum relative change of h * el0 tolerated before the iteration matrix is re-evaluated.
pub(super) const CCMAX: f64 = 0.3;
// Maximum corrector iterations per attempt.
pub(super) const MAXCOR: usize = 3;
// Maximum steps between iteration matrix evaluations.
pub(super) const MSBP: usize = 20;
// Maximum corrector convergence failures on one step.
pub(super) const MXNCF: usize = 10;
// Steps taken with one family before stiffness is checked.
pub(super) const SWITCH_CHECK_INTERVAL: i32 = 20;
// Step size advantage the other family must offer before switching.
pub(super) const SWITCH_RATIO: f64 = 5.0;

// How the next call to `step` must (re)start the method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) enum Start {
    // First step: order 1, coefficients and counters initialised.
    #[default]
    Fresh,
    // Method family, maximum order or step bounds changed since the last step.
    Reconfigured,
    // Only h changed; the Nordsieck array must be rescaled.
    NewStepSize,
    // Plain continuation.
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum StepOutcome {
    Accepted,
    // Error test failed repeatedly or with |h| = hmin.
    ErrorTestFailed,
    // Corrector failed to converge repeatedly or with |h| = hmin.
    ConvergenceFailed,
}

// Result of the order and step size selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum OrderChange {
    None,
    StepSize,
    StepSizeAndOrder,
}

#[derive(Debug, Clone)]
pub(super) struct Stepper {
    pub n: usize,
    // Nordsieck array: row j holds h^j y^(j)(tn) / j!, rows 0..=nq are meaningful.
    pub yh: Vec<Vec<f64>>,
    // Inverse error weights.
    pub ewt: Vec<f64>,
    pub y: Vec<f64>,
    pub savf: Vec<f64>,
    pub acor: Vec<f64>,
    // Iteration matrix I - h el0 J, stored by columns, overwritten by its LU factors.
    pub wm: Vec<Vec<f64>>,
    pub ipvt: Vec<usize>,

    pub adams: MethodCoefficients,
    pub bdf: MethodCoefficients,
    pub el: [f64; ADAMS_MAX_ORDER + 1],
    pub tesco: [f64; 3],

    pub tn: f64,
    pub told: f64,
    pub h: f64,
    pub hold: f64,
    pub hu: f64,
    pub hmin: f64,
    // Inverse of the maximum step size, zero when unbounded.
    pub hmxi: f64,
    pub rc: f64,
    pub el0: f64,
    pub conit: f64,
    pub conv_rate: f64,
    pub rmax: f64,
    // Lipschitz constant estimates used by the stiffness test.
    pub pdest: f64,
    pub pdlast: f64,
    pub pdnorm: f64,
    pub pdh: f64,

    pub nq: usize,
    pub nqu: usize,
    pub maxord: usize,
    pub mxordn: usize,
    pub mxords: usize,
    pub ialth: usize,
    pub icount: i32,
    pub nslp: usize,
    // Iteration matrix must be re-evaluated before the next corrector pass.
    pub ipup: bool,
    // Iteration matrix was evaluated during the current step.
    pub jcur: bool,
    // Last step size was cut to stay inside the Adams stability region.
    pub irflag: bool,

    pub meth: Method,
    pub mused: Method,
    pub start: Start,

    pub nst: usize,
    pub nfe: usize,
    pub nje: usize,
    pub netf: usize,
    pub ncfn: usize,
    pub nswitch: usize,
}

impl Default for Stepper {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Stepper {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            yh: vec![vec![0.0; n]; ADAMS_MAX_ORDER + 1],
            ewt: vec![0.0; n],
            y: vec![0.0; n],
            savf: vec![0.0; n],
            acor: vec![0.0; n],
            wm: vec![vec![0.0; n]; n],
            ipvt: vec![0; n],

            adams: MethodCoefficients::new(Method::Adams),
            bdf: MethodCoefficients::new(Method::Bdf),
            el: [0.0; ADAMS_MAX_ORDER + 1],
            tesco: [0.0; 3],

            tn: 0.0,
            told: 0.0,
            h: 0.0,
            hold: 0.0,
            hu: 0.0,
            hmin: 0.0,
            hmxi: 0.0,
            rc: 0.0,
            el0: 1.0,
            conit: 0.0,
            conv_rate: 0.7,
            rmax: 10000.0,
            pdest: 0.0,
            pdlast: 0.0,
            pdnorm: 0.0,
            pdh: 0.0,

            nq: 1,
            nqu: 0,
            maxord: ADAMS_MAX_ORDER,
            mxordn: ADAMS_MAX_ORDER,
            mxords: Method::Bdf.max_order(),
            ialth: 2,
            icount: SWITCH_CHECK_INTERVAL,
            nslp: 0,
            ipup: false,
            jcur: false,
            irflag: false,

            meth: Method::Adams,
            mused: Method::Adams,
            start: Start::Fresh,

            nst: 0,
            nfe: 0,
            nje: 0,
            netf: 0,
            ncfn: 0,
            nswitch: 0,
        }
    }

    // Stiff problems are corrected by a modified Newton iteration, non-stiff
    // ones by functional iteration.
    pub fn newton(&self) -> bool {
        self.meth == Method::Bdf
    }

    fn coefficients(&self) -> &MethodCoefficients {
        match self.meth {
            Method::Adams => &self.adams,
            Method::Bdf => &self.bdf,
        }
    }

    // Loads el and tesco for the current family and order.
    pub fn reset_coefficients(&mut self) {
        let (el, tesco) = {
            let table = self.coefficients();
            (table.el[self.nq], table.tesco[self.nq])
        };
        self.el = el;
        self.tesco = tesco;
        self.rc *= self.el[0] / self.el0;
        self.el0 = self.el[0];
        self.conit = 0.5 / (self.nq + 2) as f64;
    }

    fn cold_start(&mut self) {
        self.nq = 1;
        self.ialth = 2;
        self.rmax = 10000.0;
        self.rc = 0.0;
        self.el0 = 1.0;
        self.conv_rate = 0.7;
        self.hold = self.h;
        self.nslp = 0;
        self.ipup = self.newton();
        self.icount = SWITCH_CHECK_INTERVAL;
        self.irflag = false;
        self.pdest = 0.0;
        self.pdlast = 0.0;
        self.reset_coefficients();
    }

    fn restart(&mut self) {
        self.ipup = self.newton();
        if self.ialth == 1 {
            self.ialth = 2;
        }
        if self.nq > self.maxord {
            // The rows above the new maximum order are simply dropped.
            self.nq = self.maxord;
            self.reset_coefficients();
            self.ialth = self.nq + 1;
        }
        if self.meth != self.mused {
            self.reset_coefficients();
            self.ialth = self.nq + 1;
        }
        self.apply_new_step_size();
    }

    fn apply_new_step_size(&mut self) {
        if self.h != self.hold {
            let rh = self.h / self.hold;
            self.h = self.hold;
            self.rescale(rh);
        }
    }

    // Rescales the Nordsieck array for h -> rh * h, after bounding rh by rmax,
    // hmax and, for the Adams methods, the stability region.
    pub fn rescale(&mut self, rh: f64) {
        let mut rh = min!(rh, self.rmax);
        rh /= max!(1.0, abs!(self.h) * self.hmxi * rh);

        if self.meth == Method::Adams {
            self.irflag = false;
            self.pdh = max!(abs!(self.h) * self.pdlast, 0.000_001);
            if rh * self.pdh * 1.00001 >= ADAMS_STABILITY[self.nq] {
                rh = ADAMS_STABILITY[self.nq] / self.pdh;
                self.irflag = true;
            }
        }

        let mut r = 1.0;
        for row in self.yh.iter_mut().take(self.nq + 1).skip(1) {
            r *= rh;
            scale(r, row);
        }
        self.h *= rh;
        self.rc *= rh;
        self.ialth = self.nq + 1;
    }

    // Multiplies the Nordsieck array by the Pascal triangle matrix, giving the
    // explicit predictor at tn + h.
    fn predict(&mut self) {
        self.pascal(1.0);
    }

    // Undoes `predict` after a failed attempt.
    pub fn retract(&mut self) {
        self.pascal(-1.0);
    }

    fn pascal(&mut self, sign: f64) {
        for j in (0..self.nq).rev() {
            for i1 in j..self.nq {
                let (lower, upper) = self.yh.split_at_mut(i1 + 1);
                axpy(sign, &upper[0], &mut lower[i1]);
            }
        }
    }

    fn bound_below(&self, rh: f64) -> f64 {
        max!(rh, self.hmin / abs!(self.h))
    }

    // Attempts one step from tn. On success the Nordsieck array, tn and the
    // counters describe the new point; on failure, including a failing
    // callback, tn and the array are left at the last accepted point.
    pub fn step<S: System>(&mut self, system: &mut S) -> Result<StepOutcome, Error> {
        let mut failures = 0;
        let mut ncf = 0;
        self.told = self.tn;
        self.jcur = false;

        match self.start {
            Start::Fresh => self.cold_start(),
            Start::Reconfigured => self.restart(),
            Start::NewStepSize => self.apply_new_step_size(),
            Start::Continue => {}
        }

        loop {
            let (del, iterations, pnorm) = loop {
                if abs!(self.rc - 1.0) > CCMAX || self.nst >= self.nslp + MSBP {
                    self.ipup = self.newton();
                }
                self.tn += self.h;
                self.predict();
                let pnorm = weighted_max_norm(&self.yh[0], &self.ewt);

                let outcome = match self.correct(system, pnorm, &mut ncf) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        self.tn = self.told;
                        self.retract();
                        self.abandon();
                        return Err(e);
                    }
                };
                match outcome {
                    CorrectorOutcome::Converged { del, iterations } => break (del, iterations, pnorm),
                    CorrectorOutcome::RetryWithSmallerStep { rh } => {
                        let rh = self.bound_below(rh);
                        self.rescale(rh);
                    }
                    CorrectorOutcome::Failed => {
                        self.abandon();
                        return Ok(StepOutcome::ConvergenceFailed);
                    }
                }
            };

            // Local error test.
            self.jcur = false;
            let dsm = if iterations == 0 {
                del / self.tesco[1]
            } else {
                weighted_max_norm(&self.acor, &self.ewt) / self.tesco[1]
            };

            if dsm <= 1.0 {
                self.accept(dsm, pnorm);
                return Ok(StepOutcome::Accepted);
            }

            failures += 1;
            self.netf += 1;
            self.tn = self.told;
            self.retract();
            self.rmax = 2.0;

            if abs!(self.h) <= self.hmin * 1.00001 {
                self.abandon();
                return Ok(StepOutcome::ErrorTestFailed);
            }

            if failures < 3 {
                let (change, rh) = self.select_order(0.0, dsm, failures);
                let rh = match change {
                    OrderChange::None => min!(rh, 0.2),
                    OrderChange::StepSize => rh,
                    OrderChange::StepSizeAndOrder => {
                        self.reset_coefficients();
                        rh
                    }
                };
                let rh = self.bound_below(rh);
                self.rescale(rh);
                continue;
            }

            // Three or more failures: the derivative estimates are assumed to
            // be unreliable, so restart at order 1 with a tenth of the step.
            if failures == 10 {
                self.abandon();
                return Ok(StepOutcome::ErrorTestFailed);
            }
            self.y.copy_from_slice(&self.yh[0]);
            if let Err(e) = system.derive(self.tn, &self.y, &mut self.savf) {
                self.abandon();
                return Err(e.into());
            }
            self.nfe += 1;
            let rh = self.bound_below(0.1);
            self.h *= rh;
            for (yh1, f) in izip!(self.yh[1].iter_mut(), &self.savf) {
                *yh1 = self.h * f;
            }
            self.ipup = self.newton();
            self.ialth = 5;
            if self.nq != 1 {
                self.nq = 1;
                self.reset_coefficients();
            }
        }
    }

    // Gives up on the current step with tn and the Nordsieck array already
    // back at the last accepted point; the next call continues from there.
    fn abandon(&mut self) {
        self.hold = self.h;
        self.start = Start::Continue;
    }

    fn accept(&mut self, dsm: f64, pnorm: f64) {
        let error_scale = self.tesco[1];
        self.nst += 1;
        self.hu = self.h;
        self.nqu = self.nq;
        self.mused = self.meth;
        for (row, el) in izip!(self.yh.iter_mut().take(self.nq + 1), self.el) {
            axpy(el, &self.acor, row);
        }

        self.icount -= 1;
        if self.icount < 0 {
            if let Some(rh) = self.consider_method_switch(dsm, pnorm) {
                let rh = self.bound_below(rh);
                self.rescale(rh);
                self.rmax = 10.0;
                self.finish_step(error_scale);
                return;
            }
        }

        // Order and step size are reconsidered every nq + 1 steps.
        self.ialth = self.ialth.saturating_sub(1);
        if self.ialth == 0 {
            let mut rhup = 0.0;
            if self.nq < self.maxord {
                for (s, a, y) in izip!(self.savf.iter_mut(), &self.acor, &self.yh[self.maxord]) {
                    *s = a - y;
                }
                let dup = weighted_max_norm(&self.savf, &self.ewt) / self.tesco[2];
                let exup = 1.0 / (self.nq + 2) as f64;
                rhup = 1.0 / (1.4 * dup.powf(exup) + 0.000_001_4);
            }

            let (change, rh) = self.select_order(rhup, dsm, 0);
            if change != OrderChange::None {
                if change == OrderChange::StepSizeAndOrder {
                    self.reset_coefficients();
                }
                let rh = self.bound_below(rh);
                self.rescale(rh);
                self.rmax = 10.0;
            }
        } else if self.ialth == 1 && self.nq < self.maxord {
            // Keep this correction to estimate the next derivative when the
            // order increase is considered on the following step.
            let maxord = self.maxord;
            self.yh[maxord].copy_from_slice(&self.acor);
        }
        self.finish_step(error_scale);
    }

    fn finish_step(&mut self, error_scale: f64) {
        scale(1.0 / error_scale, &mut self.acor);
        self.hold = self.h;
        self.start = Start::Continue;
    }
}
