use lsoda::{Error, Integrator, Lsoda, Method, System, Task, Tolerance};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

// y' = -y
#[derive(Default)]
struct Decay {
    times: Vec<f64>,
}

impl System for Decay {
    fn derive(&mut self, _x: f64, y: &[f64], dy: &mut [f64]) -> Result<(), BoxError> {
        dy[0] = -y[0];
        Ok(())
    }

    fn solout(&mut self, x: f64, _y: &[f64]) -> Result<(), BoxError> {
        self.times.push(x);
        Ok(())
    }
}

// y1' = y2, y2' = -y1
struct Oscillator;

impl System for Oscillator {
    fn derive(&mut self, _x: f64, y: &[f64], dy: &mut [f64]) -> Result<(), BoxError> {
        dy[0] = y[1];
        dy[1] = -y[0];
        Ok(())
    }
}

// Robertson's chemical kinetics, stiff once the fast reaction has equilibrated.
struct Robertson;

impl System for Robertson {
    fn derive(&mut self, _x: f64, y: &[f64], dy: &mut [f64]) -> Result<(), BoxError> {
        dy[0] = -0.04 * y[0] + 1.0e4 * y[1] * y[2];
        dy[2] = 3.0e7 * y[1] * y[1];
        dy[1] = -dy[0] - dy[2];
        Ok(())
    }
}

struct Failing;

impl System for Failing {
    fn derive(&mut self, x: f64, _y: &[f64], dy: &mut [f64]) -> Result<(), BoxError> {
        if x > 0.5 {
            return Err("derivative undefined beyond x = 0.5".into());
        }
        dy[0] = 1.0;
        Ok(())
    }
}

// y' = -y, except that the first evaluation beyond `threshold` fails.
struct InterruptedDecay {
    threshold: f64,
    failed: bool,
}

impl System for InterruptedDecay {
    fn derive(&mut self, x: f64, y: &[f64], dy: &mut [f64]) -> Result<(), BoxError> {
        if !self.failed && x > self.threshold {
            self.failed = true;
            return Err("transient failure".into());
        }
        dy[0] = -y[0];
        Ok(())
    }
}

// y' = y
struct Growth;

impl System for Growth {
    fn derive(&mut self, _x: f64, y: &[f64], dy: &mut [f64]) -> Result<(), BoxError> {
        dy[0] = y[0];
        Ok(())
    }
}

// Constant until x = 0.5, then rising with unit slope.
struct Kink;

impl System for Kink {
    fn derive(&mut self, x: f64, _y: &[f64], dy: &mut [f64]) -> Result<(), BoxError> {
        dy[0] = if x < 0.5 { 0.0 } else { 1.0 };
        Ok(())
    }
}

// y1' = -y1 alongside a component that stays at exactly zero.
struct DecayWithIdleComponent;

impl System for DecayWithIdleComponent {
    fn derive(&mut self, _x: f64, y: &[f64], dy: &mut [f64]) -> Result<(), BoxError> {
        dy[0] = -y[0];
        dy[1] = 0.0;
        Ok(())
    }
}

// y' = -1e6 y, far too stiff for functional iteration at a fixed step of 0.01.
struct StiffDecay;

impl System for StiffDecay {
    fn derive(&mut self, _x: f64, y: &[f64], dy: &mut [f64]) -> Result<(), BoxError> {
        dy[0] = -1.0e6 * y[0];
        Ok(())
    }
}

fn decay_solver(relative: f64, absolute: f64) -> Lsoda {
    let mut lsoda = Lsoda::new();
    lsoda.set_tolerance(Tolerance::new(relative, absolute));
    lsoda
}

fn relative_error(value: f64, exact: f64) -> f64 {
    ((value - exact) / exact).abs()
}

#[test]
fn decay_matches_exact_solution() {
    let mut lsoda = decay_solver(1e-8, 1e-12);
    let mut system = Decay::default();
    lsoda.initialise(0.0, 5.0, &[1.0]).unwrap();
    let stats = lsoda.integrate(&mut system).unwrap();

    let y = lsoda.y_final();
    assert!(relative_error(y[0], (-5.0_f64).exp()) < 5e-6, "y(5) = {}", y[0]);
    assert!(stats.accepted_steps > 0);
    assert!(stats.function_calls > stats.accepted_steps);
    assert_eq!(stats.method_switches, 0);
    assert_eq!(lsoda.method_used(), Method::Adams);
}

#[test]
fn tighter_tolerance_reduces_error_by_more_than_a_constant() {
    let error_at = |relative: f64| {
        let mut lsoda = decay_solver(relative, 1e-14);
        lsoda.initialise(0.0, 5.0, &[1.0]).unwrap();
        let _ = lsoda.integrate(&mut Decay::default()).unwrap();
        (lsoda.y_final()[0] - (-5.0_f64).exp()).abs()
    };
    let loose = error_at(1e-4);
    let tight = error_at(1e-8);
    assert!(loose > 0.0);
    assert!(loose > 100.0 * tight, "loose {loose}, tight {tight}");
}

#[test]
fn robertson_switches_to_bdf() {
    let mut lsoda = Lsoda::new();
    lsoda.set_tolerance(Tolerance {
        relative: vec![1e-4],
        absolute: vec![1e-6, 1e-10, 1e-6],
    });
    lsoda.initialise(0.0, 4e6, &[1.0, 0.0, 0.0]).unwrap();

    let mut tout = 0.4;
    for _ in 0..8 {
        let t = lsoda.advance(&mut Robertson, tout, Task::Exact).unwrap();
        assert_eq!(t, tout);
        let y = lsoda.y();
        assert!((y.iter().sum::<f64>() - 1.0).abs() < 1e-5, "sum at {t}: {y:?}");
        if t == 40.0 {
            assert!((y[0] - 0.7158).abs() < 1e-3, "y1(40) = {}", y[0]);
            assert!((y[2] - 0.2842).abs() < 1e-3, "y3(40) = {}", y[2]);
        }
        tout *= 10.0;
    }

    let stats = lsoda.stats();
    assert!(stats.method_switches >= 1);
    assert!(stats.jacobian_evaluations > 0);
    assert_eq!(lsoda.method_used(), Method::Bdf);
    assert!(lsoda.last_switch_time() > 0.0);
    assert!(lsoda.order_used() <= 5);
}

#[test]
fn accepted_times_are_monotonic() {
    let mut lsoda = decay_solver(1e-6, 1e-10);
    let mut system = Decay::default();
    lsoda.initialise(0.0, 3.0, &[1.0]).unwrap();
    let _ = lsoda.integrate(&mut system).unwrap();

    assert_eq!(system.times[0], 0.0);
    assert!(system.times.windows(2).all(|w| w[1] > w[0]));
    // One call per accepted step after the initial point.
    assert_eq!(system.times.len(), lsoda.stats().accepted_steps + 1);
    assert!(*system.times.last().unwrap() >= 3.0);
}

#[test]
fn backward_integration() {
    let mut lsoda = decay_solver(1e-8, 1e-12);
    let mut system = Decay::default();
    lsoda.initialise(0.0, -2.0, &[1.0]).unwrap();
    let _ = lsoda.integrate(&mut system).unwrap();

    assert!(relative_error(lsoda.y_final()[0], 2.0_f64.exp()) < 1e-5);
    assert!(system.times.windows(2).all(|w| w[1] < w[0]));
    assert!(lsoda.step_used() < 0.0);
}

#[test]
fn resumed_integration_matches_single_call() {
    let configure = || {
        let mut lsoda = decay_solver(1e-7, 1e-10);
        lsoda.set_first_step_size(1e-4);
        lsoda.initialise(0.0, 10.0, &[1.0, 0.0]).unwrap();
        lsoda
    };

    let mut direct = configure();
    let t = direct.advance(&mut Oscillator, 10.0, Task::Exact).unwrap();
    assert_eq!(t, 10.0);

    let mut resumed = configure();
    for tout in 1..=10 {
        let t = resumed.advance(&mut Oscillator, f64::from(tout), Task::Exact).unwrap();
        assert_eq!(t, f64::from(tout));
    }

    for (a, b) in direct.y().iter().zip(resumed.y()) {
        assert!((a - b).abs() < 1e-12, "{a} != {b}");
    }
    assert_eq!(direct.stats(), resumed.stats());
    assert!((direct.y()[0] - 10.0_f64.cos()).abs() < 1e-4);
}

#[test]
fn max_step_size_does_not_change_the_solution() {
    let mut free = decay_solver(1e-6, 1e-10);
    free.initialise(0.0, 5.0, &[1.0]).unwrap();
    let free_stats = free.integrate(&mut Decay::default()).unwrap();

    let mut clamped = decay_solver(1e-6, 1e-10);
    clamped.set_max_step_size(0.01);
    clamped.set_max_integration_steps(10_000);
    clamped.initialise(0.0, 5.0, &[1.0]).unwrap();
    let clamped_stats = clamped.integrate(&mut Decay::default()).unwrap();

    assert!(clamped_stats.accepted_steps >= 500);
    assert!(clamped_stats.accepted_steps > free_stats.accepted_steps);
    assert!(clamped.step_used().abs() <= 0.01 * (1.0 + 1e-12));
    let exact = (-5.0_f64).exp();
    assert!(relative_error(free.y_final()[0], exact) < 1e-4);
    assert!(relative_error(clamped.y_final()[0], exact) < 1e-4);
}

#[test]
fn illegal_input_is_reported() {
    let mut empty = Lsoda::new();
    assert!(matches!(
        empty.initialise(0.0, 1.0, &[]),
        Err(Error::InvalidParameter { .. })
    ));
    assert!(matches!(
        empty.advance(&mut Decay::default(), 1.0, Task::Exact),
        Err(Error::InvalidParameter { .. })
    ));

    let mut negative = decay_solver(-1e-6, 1e-9);
    assert!(matches!(
        negative.initialise(0.0, 1.0, &[1.0]),
        Err(Error::InvalidParameter { .. })
    ));

    let mut same_time = decay_solver(1e-6, 1e-9);
    same_time.initialise(0.0, 0.0, &[1.0]).unwrap();
    assert!(matches!(
        same_time.advance(&mut Decay::default(), 0.0, Task::Exact),
        Err(Error::InvalidParameter { .. })
    ));

    let mut uninitialised = Lsoda::new();
    assert!(matches!(
        uninitialised.advance(&mut Decay::default(), 1.0, Task::Exact),
        Err(Error::InvalidParameter { .. })
    ));

    let mut wrong_direction = decay_solver(1e-6, 1e-9);
    wrong_direction.set_first_step_size(-0.1);
    wrong_direction.initialise(0.0, 1.0, &[1.0]).unwrap();
    assert!(matches!(
        wrong_direction.advance(&mut Decay::default(), 1.0, Task::Exact),
        Err(Error::InvalidParameter { .. })
    ));

    let mut behind = decay_solver(1e-6, 1e-9);
    behind.initialise(0.0, 1.0, &[1.0]).unwrap();
    assert!(matches!(
        behind.advance(&mut Decay::default(), 1.0, Task::ExactCritical { tcrit: 0.5 }),
        Err(Error::InvalidParameter { .. })
    ));
}

#[test]
fn critical_time_is_never_passed() {
    let mut lsoda = decay_solver(1e-6, 1e-10);
    let mut system = Decay::default();
    lsoda.initialise(0.0, 1.0, &[1.0]).unwrap();

    let mut steps = 0;
    loop {
        let t = lsoda
            .advance(&mut system, 1.0, Task::OneStepCritical { tcrit: 1.0 })
            .unwrap();
        assert!(lsoda.current_time() <= 1.0);
        steps += 1;
        if t == 1.0 {
            break;
        }
        assert!(steps < 1000);
    }
    assert!(relative_error(lsoda.y()[0], (-1.0_f64).exp()) < 1e-5);
    assert!(system.times.iter().all(|t| *t <= 1.0));

    let mut exact = decay_solver(1e-6, 1e-10);
    exact.initialise(0.0, 2.0, &[1.0]).unwrap();
    let t = exact
        .advance(&mut Decay::default(), 0.5, Task::ExactCritical { tcrit: 0.6 })
        .unwrap();
    assert_eq!(t, 0.5);
    assert!(exact.current_time() <= 0.6);
    assert!(relative_error(exact.y()[0], (-0.5_f64).exp()) < 1e-5);
}

#[test]
fn one_step_returns_the_internal_solution() {
    let mut lsoda = decay_solver(1e-6, 1e-10);
    lsoda.initialise(0.0, 10.0, &[1.0]).unwrap();

    let mut previous = 0.0;
    for _ in 0..5 {
        let t = lsoda.advance(&mut Decay::default(), 10.0, Task::OneStep).unwrap();
        assert!(t > previous && t < 10.0);
        assert_eq!(t, lsoda.current_time());
        assert!(lsoda.stats().accepted_steps >= 1);

        let mut dky = [0.0];
        lsoda.interpolate(t, 0, &mut dky).unwrap();
        assert_eq!(dky[0], lsoda.y()[0]);
        // y' = -y holds for the interpolated derivative as well.
        lsoda.interpolate(t, 1, &mut dky).unwrap();
        assert!((dky[0] + lsoda.y()[0]).abs() < 1e-4);
        previous = t;
    }
    assert!(lsoda.order_used() >= 1);
    assert!(lsoda.step_used() > 0.0);
    assert!(lsoda.step_next() > 0.0);
}

#[test]
fn overshoot_stops_after_passing_tout() {
    let mut lsoda = decay_solver(1e-6, 1e-10);
    lsoda.initialise(0.0, 2.0, &[1.0]).unwrap();

    let t = lsoda.advance(&mut Decay::default(), 1.0, Task::Overshoot).unwrap();
    assert!(t >= 1.0);
    assert_eq!(t, lsoda.current_time());
    assert!(relative_error(lsoda.y()[0], (-t).exp()) < 1e-4);

    // Already reached: no further step.
    let steps = lsoda.stats().accepted_steps;
    assert_eq!(lsoda.advance(&mut Decay::default(), t, Task::Overshoot).unwrap(), t);
    assert_eq!(lsoda.stats().accepted_steps, steps);

    assert!(matches!(
        lsoda.advance(&mut Decay::default(), 0.1, Task::Overshoot),
        Err(Error::InvalidParameter { .. })
    ));
}

#[test]
fn step_limit_can_be_resumed() {
    let mut lsoda = decay_solver(1e-8, 1e-12);
    lsoda.set_max_integration_steps(10);
    lsoda.initialise(0.0, 5.0, &[1.0]).unwrap();

    match lsoda.advance(&mut Decay::default(), 5.0, Task::Exact) {
        Err(Error::StepLimitReached { x, n_step }) => {
            assert_eq!(n_step, 10);
            assert!(x > 0.0 && x < 5.0);
            assert_eq!(x, lsoda.current_time());
            assert!(relative_error(lsoda.y()[0], (-x).exp()) < 1e-6);
        }
        other => panic!("expected a step limit error, got {other:?}"),
    }

    lsoda.set_max_integration_steps(10_000);
    let t = lsoda.advance(&mut Decay::default(), 5.0, Task::Exact).unwrap();
    assert_eq!(t, 5.0);
    assert!(relative_error(lsoda.y()[0], (-5.0_f64).exp()) < 5e-6);
}

#[test]
fn reconfigured_orders_are_respected() {
    let mut lsoda = decay_solver(1e-10, 1e-14);
    lsoda.initialise(0.0, 4.0, &[1.0]).unwrap();
    let _ = lsoda.advance(&mut Decay::default(), 2.0, Task::Exact).unwrap();
    assert!(lsoda.order_next() > 2);

    // Order 2 needs a few thousand steps at this tolerance.
    lsoda.set_max_order_nonstiff(2);
    lsoda.set_max_integration_steps(10_000);
    let _ = lsoda.advance(&mut Decay::default(), 4.0, Task::Exact).unwrap();
    assert!(lsoda.order_used() <= 2);
    assert!(relative_error(lsoda.y()[0], (-4.0_f64).exp()) < 1e-6);
}

#[test]
fn callback_errors_are_propagated() {
    let mut lsoda = Lsoda::new();
    lsoda.initialise(0.0, 1.0, &[0.0]).unwrap();
    assert!(matches!(
        lsoda.advance(&mut Failing, 1.0, Task::Exact),
        Err(Error::External(_))
    ));
}

#[test]
fn configuration_from_json() {
    let config = r#"{
        "tolerance": { "relative": [1e-8], "absolute": [1e-12] },
        "max_step_size": 0.5,
        "max_order_nonstiff": 6,
        "max_integration_steps": 2000
    }"#;
    let mut lsoda: Lsoda = serde_json::from_str(config).unwrap();
    lsoda.initialise(0.0, 5.0, &[1.0]).unwrap();
    let stats = lsoda.integrate(&mut Decay::default()).unwrap();

    assert!(relative_error(lsoda.y_final()[0], (-5.0_f64).exp()) < 1e-5);
    assert!(lsoda.order_used() <= 6);
    assert!(lsoda.step_used().abs() <= 0.5 * (1.0 + 1e-12));
    assert!(stats.to_string().contains("accepted steps"));

    assert!(serde_json::from_str::<Lsoda>(r#"{ "max_stepsize": 1.0 }"#).is_err());
}

#[test]
fn callback_failure_mid_step_can_be_resumed() {
    let mut clean = decay_solver(1e-8, 1e-12);
    clean.initialise(0.0, 5.0, &[1.0]).unwrap();
    let _ = clean.advance(&mut Decay::default(), 5.0, Task::Exact).unwrap();

    let mut lsoda = decay_solver(1e-8, 1e-12);
    let mut system = InterruptedDecay {
        threshold: 0.35,
        failed: false,
    };
    lsoda.initialise(0.0, 5.0, &[1.0]).unwrap();
    assert!(matches!(
        lsoda.advance(&mut system, 5.0, Task::Exact),
        Err(Error::External(_))
    ));

    // The attempted step is rolled back and y() holds the last accepted point.
    let t = lsoda.current_time();
    assert!(t > 0.0 && t <= 0.35, "t = {t}");
    assert!(relative_error(lsoda.y()[0], (-t).exp()) < 1e-7);

    let t = lsoda.advance(&mut system, 5.0, Task::Exact).unwrap();
    assert_eq!(t, 5.0);
    assert!(relative_error(lsoda.y()[0], clean.y()[0]) < 1e-9);
    assert!(relative_error(lsoda.y()[0], (-5.0_f64).exp()) < 5e-6);
}

#[test]
fn excessive_accuracy_is_reported() {
    let mut lsoda = decay_solver(0.0, 1e-12);
    lsoda.set_max_integration_steps(100_000);
    lsoda.initialise(0.0, 10.0, &[1.0]).unwrap();

    // eps * |y| / atol exceeds 0.01 once y passes about 45, near x = 3.8.
    match lsoda.advance(&mut Growth, 10.0, Task::Exact) {
        Err(Error::AccuracyUnachievable { x, scale }) => {
            assert!(x > 3.8 && x < 4.5, "x = {x}");
            assert!(scale > 2.0);
            assert_eq!(scale, lsoda.tolerance_scale());
            assert_eq!(x, lsoda.current_time());
            assert!(relative_error(lsoda.y()[0], x.exp()) < 1e-6);
        }
        other => panic!("expected an accuracy error, got {other:?}"),
    }
}

#[test]
fn error_test_failure_at_minimum_step() {
    let mut lsoda = decay_solver(1e-6, 1e-9);
    lsoda.set_min_step_size(1e-3);
    lsoda.initialise(0.0, 2.0, &[1.0]).unwrap();

    match lsoda.advance(&mut Kink, 2.0, Task::Exact) {
        Err(Error::ErrorTestFailed { x, h, component }) => {
            assert!((x - 0.5).abs() < 0.01, "x = {x}");
            assert!(h >= 1e-3 * (1.0 - 1e-9), "h = {h}");
            assert_eq!(component, 0);
            assert_eq!(x, lsoda.current_time());
            assert!((lsoda.y()[0] - 1.0).abs() < 1e-3);
        }
        other => panic!("expected an error test failure, got {other:?}"),
    }
    assert!(lsoda.stats().rejected_steps > 0);
}

#[test]
fn corrector_divergence_at_minimum_step() {
    let mut lsoda = decay_solver(1e-6, 1e-9);
    lsoda.set_first_step_size(0.01);
    lsoda.set_min_step_size(0.01);
    lsoda.initialise(0.0, 1.0, &[1.0]).unwrap();

    match lsoda.advance(&mut StiffDecay, 1.0, Task::Exact) {
        Err(Error::ConvergenceFailed { x, h, component }) => {
            assert_eq!(x, 0.0);
            assert_eq!(h, 0.01);
            assert_eq!(component, 0);
        }
        other => panic!("expected a convergence failure, got {other:?}"),
    }
    assert_eq!(lsoda.y(), [1.0]);
    assert_eq!(lsoda.stats().accepted_steps, 0);
}

#[test]
fn vanishing_error_weight_is_reported() {
    let mut lsoda = decay_solver(1e-6, 1e-9);
    lsoda.initialise(0.0, 2.0, &[1.0, 0.0]).unwrap();
    let _ = lsoda.advance(&mut DecayWithIdleComponent, 1.0, Task::Exact).unwrap();

    // Pure relative control of a component sitting at zero.
    lsoda.set_tolerance(Tolerance {
        relative: vec![1e-6],
        absolute: vec![1e-9, 0.0],
    });
    match lsoda.advance(&mut DecayWithIdleComponent, 2.0, Task::Exact) {
        Err(Error::NonPositiveWeight { x, component }) => {
            assert_eq!(component, 1);
            assert_eq!(x, lsoda.current_time());
            assert!(x >= 1.0);
        }
        other => panic!("expected a non-positive weight, got {other:?}"),
    }

    lsoda.set_tolerance(Tolerance::new(1e-6, 1e-9));
    let t = lsoda.advance(&mut DecayWithIdleComponent, 2.0, Task::Exact).unwrap();
    assert_eq!(t, 2.0);
    assert!(relative_error(lsoda.y()[0], (-2.0_f64).exp()) < 1e-4);
    assert_eq!(lsoda.y()[1], 0.0);
}

#[test]
fn negligible_steps_are_counted() {
    // Far from the origin a step of 1e-10 does not change t at all.
    let mut lsoda = decay_solver(1e-6, 1e-9);
    lsoda.set_first_step_size(1e-10);
    lsoda.set_max_step_warnings(1);
    lsoda.initialise(1.0e10, 1.0e10 + 1.0, &[1.0]).unwrap();

    let t = lsoda.advance(&mut Decay::default(), 1.0e10 + 1.0, Task::Exact).unwrap();
    assert_eq!(t, 1.0e10 + 1.0);
    // Counted past the logging limit.
    assert!(lsoda.stats().step_size_warnings >= 2);
    assert!(relative_error(lsoda.y()[0], (-1.0_f64).exp()) < 1e-3);
}
