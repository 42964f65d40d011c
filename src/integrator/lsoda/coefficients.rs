// Nordsieck coefficients of the variable-order Adams-Moulton and BDF formulas.
//
// For order q the vector `el` (length q + 1) defines the corrector in
// Nordsieck form, and `tesco` holds the local error test constants for the
// orders q - 1, q and q + 1.
//
// A. C. Hindmarsh, ODEPACK, A Systematized Collection of ODE Solvers (1983).
// L. R. Petzold, Automatic Selection of Methods for Solving Stiff and
// Nonstiff Systems of Ordinary Differential Equations, SIAM J. Sci. Stat.
// Comput. 4 (1983).

use serde::{Deserialize, Serialize};

pub const ADAMS_MAX_ORDER: usize = 12;
pub const BDF_MAX_ORDER: usize = 5;

// Absolute stability bounds of the Adams methods: h * |lambda| must stay below
// ADAMS_STABILITY[q] for order q. Index 0 is unused.
pub(super) const ADAMS_STABILITY: [f64; ADAMS_MAX_ORDER + 1] = [
    0.0, 0.5, 0.575, 0.55, 0.45, 0.35, 0.25, 0.2, 0.15, 0.1, 0.075, 0.05, 0.025,
];

/// Linear multistep family in use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum Method {
    /// Adams-Moulton, orders 1 to 12, corrected by functional iteration (non-stiff).
    #[default]
    Adams,
    /// Backward differentiation formulas, orders 1 to 5, corrected by a
    /// modified Newton iteration (stiff).
    Bdf,
}

impl Method {
    pub fn max_order(self) -> usize {
        match self {
            Method::Adams => ADAMS_MAX_ORDER,
            Method::Bdf => BDF_MAX_ORDER,
        }
    }
}

// Coefficients of one family for every order it supports. Rows are indexed by
// the order; row 0 is unused.
#[derive(Debug, Clone)]
pub(super) struct MethodCoefficients {
    pub el: Vec<[f64; ADAMS_MAX_ORDER + 1]>,
    pub tesco: Vec<[f64; 3]>,
}

impl MethodCoefficients {
    pub fn new(method: Method) -> Self {
        match method {
            Method::Adams => Self::adams(),
            Method::Bdf => Self::bdf(),
        }
    }

    // Adams: p(x) = (x + 1)(x + 2)...(x + q - 1) is built up one factor at a
    // time. el is obtained from the integral of p over [-1, 0], and the error
    // constants from the integral of x * p(x).
    fn adams() -> Self {
        let mut el = vec![[0.0; ADAMS_MAX_ORDER + 1]; ADAMS_MAX_ORDER + 1];
        let mut tesco = vec![[0.0; 3]; ADAMS_MAX_ORDER + 1];
        let mut pc = [0.0; ADAMS_MAX_ORDER];

        el[1][0] = 1.0;
        el[1][1] = 1.0;
        tesco[1][0] = 0.0;
        tesco[1][1] = 2.0;
        tesco[2][0] = 1.0;
        tesco[ADAMS_MAX_ORDER][2] = 0.0;
        pc[0] = 1.0;
        let mut rqfac = 1.0;

        for nq in 2..=ADAMS_MAX_ORDER {
            let rq1fac = rqfac;
            rqfac /= nq as f64;
            let fnqm1 = (nq - 1) as f64;

            // Multiply p by (x + nq - 1).
            pc[nq - 1] = 0.0;
            for i in (1..nq).rev() {
                pc[i] = pc[i - 1] + fnqm1 * pc[i];
            }
            pc[0] *= fnqm1;

            let mut pint = pc[0];
            let mut xpin = pc[0] / 2.0;
            let mut tsign = 1.0;
            for i in 2..=nq {
                tsign = -tsign;
                pint += tsign * pc[i - 1] / i as f64;
                xpin += tsign * pc[i - 1] / (i + 1) as f64;
            }

            el[nq][0] = pint * rq1fac;
            el[nq][1] = 1.0;
            for i in 2..=nq {
                el[nq][i] = rq1fac * pc[i - 1] / i as f64;
            }

            let ragq = 1.0 / (rqfac * xpin);
            tesco[nq][1] = ragq;
            if nq < ADAMS_MAX_ORDER {
                tesco[nq + 1][0] = ragq * rqfac / (nq + 1) as f64;
            }
            tesco[nq - 1][2] = ragq;
        }

        Self { el, tesco }
    }

    // BDF: p(x) = (x + 1)(x + 2)...(x + q), el is p's coefficients scaled so
    // that el[1] = 1.
    fn bdf() -> Self {
        let mut el = vec![[0.0; ADAMS_MAX_ORDER + 1]; BDF_MAX_ORDER + 1];
        let mut tesco = vec![[0.0; 3]; BDF_MAX_ORDER + 1];
        let mut pc = [0.0; BDF_MAX_ORDER + 1];

        pc[0] = 1.0;
        let mut rq1fac = 1.0;
        for nq in 1..=BDF_MAX_ORDER {
            let fnq = nq as f64;

            // Multiply p by (x + nq).
            pc[nq] = 0.0;
            for i in (1..=nq).rev() {
                pc[i] = pc[i - 1] + fnq * pc[i];
            }
            pc[0] *= fnq;

            for i in 0..=nq {
                el[nq][i] = pc[i] / pc[1];
            }
            el[nq][1] = 1.0;

            tesco[nq][0] = rq1fac;
            tesco[nq][1] = (nq + 1) as f64 / el[nq][0];
            tesco[nq][2] = (nq + 2) as f64 / el[nq][0];
            rq1fac /= fnq;
        }

        Self { el, tesco }
    }

    // Constant relating the local error estimate at order q to the
    // (q + 1)-th scaled derivative. Ratios of these between families drive
    // the stiffness test.
    pub fn error_constant(&self, nq: usize) -> f64 {
        self.tesco[nq][1] * self.el[nq][nq]
    }
}
