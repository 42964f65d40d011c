// Dense output from the Nordsieck array.

use super::stepper::Stepper;
use crate::integrator::Error;
use crate::integrator::linalg::scale;
use itertools::izip;

impl Stepper {
    /// Evaluates the k-th derivative of the interpolating polynomial at `t`,
    /// which must lie in the last step `[tn - hu, tn]` (with a small roundoff
    /// allowance). The result is written to `dky`.
    ///
    /// With s = (t - tn) / h the polynomial is
    ///     sum_{j=k}^{nq} j! / (j - k)! * s^(j - k) * yh[j] / h^k,
    /// evaluated by nested multiplication.
    pub(super) fn interpolate(&self, t: f64, k: usize, dky: &mut [f64]) -> Result<(), Error> {
        if k > self.nq {
            return Err(Error::InvalidDerivativeOrder { k, order: self.nq });
        }
        let tp = self.tn - self.hu - 100.0 * f64::EPSILON * (abs!(self.tn) + abs!(self.hu)).copysign(self.hu);
        if (t - tp) * (t - self.tn) > 0.0 {
            return Err(Error::InterpolationOutOfRange {
                t,
                start: self.tn - self.hu,
                end: self.tn,
            });
        }

        let s = (t - self.tn) / self.h;
        // j! / (j - k)!
        let falling = |j: usize| ((j + 1 - k)..=j).product::<usize>() as f64;

        let c = falling(self.nq);
        for (d, yh) in izip!(dky.iter_mut(), &self.yh[self.nq]) {
            *d = c * yh;
        }
        for j in (k..self.nq).rev() {
            let c = falling(j);
            for (d, yh) in izip!(dky.iter_mut(), &self.yh[j]) {
                *d = c * yh + s * *d;
            }
        }
        if k > 0 {
            let exponent = i32::try_from(k).unwrap_or(i32::MAX);
            scale(self.h.powi(-exponent), dky);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Nordsieck array of y(t) = t^3 at tn = 1 with h = hu = 0.5, order 3.
    fn cubic() -> Stepper {
        let mut stepper = Stepper::new(1);
        let h: f64 = 0.5;
        stepper.nq = 3;
        stepper.tn = 1.0;
        stepper.h = h;
        stepper.hu = h;
        stepper.yh[0] = vec![1.0];
        stepper.yh[1] = vec![h * 3.0];
        stepper.yh[2] = vec![h.powi(2) * 6.0 / 2.0];
        stepper.yh[3] = vec![h.powi(3) * 6.0 / 6.0];
        stepper
    }

    fn close(a: f64, b: f64) -> bool {
        abs!(a - b) < 1e-13
    }

    #[test]
    fn values_and_derivatives_inside_the_step() {
        let stepper = cubic();
        let mut dky = [0.0];
        for t in [0.5, 0.6, 0.75, 0.9, 1.0] {
            stepper.interpolate(t, 0, &mut dky).unwrap();
            assert!(close(dky[0], t * t * t), "y({t}) = {}", dky[0]);
            stepper.interpolate(t, 1, &mut dky).unwrap();
            assert!(close(dky[0], 3.0 * t * t), "y'({t}) = {}", dky[0]);
            stepper.interpolate(t, 2, &mut dky).unwrap();
            assert!(close(dky[0], 6.0 * t), "y''({t}) = {}", dky[0]);
            stepper.interpolate(t, 3, &mut dky).unwrap();
            assert!(close(dky[0], 6.0));
        }
    }

    #[test]
    fn rejects_times_outside_the_step() {
        let stepper = cubic();
        let mut dky = [0.0];
        assert!(matches!(
            stepper.interpolate(0.4, 0, &mut dky),
            Err(Error::InterpolationOutOfRange { .. })
        ));
        assert!(matches!(
            stepper.interpolate(1.1, 0, &mut dky),
            Err(Error::InterpolationOutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_derivatives_above_the_order() {
        let stepper = cubic();
        let mut dky = [0.0];
        assert!(matches!(
            stepper.interpolate(1.0, 4, &mut dky),
            Err(Error::InvalidDerivativeOrder { k: 4, order: 3 })
        ));
    }

    #[test]
    fn backward_step_window() {
        // y(t) = 2 - t at tn = -1 after a step of -0.5.
        let mut stepper = Stepper::new(1);
        stepper.nq = 1;
        stepper.tn = -1.0;
        stepper.h = -0.5;
        stepper.hu = -0.5;
        stepper.yh[0] = vec![3.0];
        stepper.yh[1] = vec![0.5];
        let mut dky = [0.0];
        stepper.interpolate(-0.75, 0, &mut dky).unwrap();
        assert!(close(dky[0], 2.75));
        assert!(stepper.interpolate(-0.4, 0, &mut dky).is_err());
    }
}
