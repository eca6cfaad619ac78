//! Residual formulations driven by the hybrid solver.
//!
//! A residual maps an `n`-vector to an `n`-vector whose root is sought. Besides a plain user function,
//! three implicit one-step ODE schemes are provided: each wraps a right-hand side `dydt(t, y)` and the
//! old time levels it needs, and its root is the new state.
use nalgebra::DVector;

/// Vector-valued function whose root is sought by the hybrid solver
pub trait ResidualFunction {
    /// Evaluate the residual at `x`; the result must have the same length as `x`.
    fn residual(&self, x: &DVector<f64>) -> DVector<f64>;

    /// Get name for debugging/logging
    fn name(&self) -> &str {
        "residual"
    }
}

/// user function used directly as the residual
pub struct PlainResidual<F>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    func: F,
}

impl<F> PlainResidual<F>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> ResidualFunction for PlainResidual<F>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    fn residual(&self, x: &DVector<f64>) -> DVector<f64> {
        (self.func)(x)
    }

    fn name(&self) -> &str {
        "plain"
    }
}

/// Backward Euler step from `(to, yo)` to `tm`:
/// `F(ym) = ym - yo - (tm - to)*dydt(tm, ym)`
pub struct BackwardEulerResidual<F>
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    dydt: F,
    to: f64,
    yo: DVector<f64>,
    tm: f64,
}

impl<F> BackwardEulerResidual<F>
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    pub fn new(dydt: F, to: f64, yo: DVector<f64>, tm: f64) -> Self {
        Self { dydt, to, yo, tm }
    }
}

impl<F> ResidualFunction for BackwardEulerResidual<F>
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    fn residual(&self, ym: &DVector<f64>) -> DVector<f64> {
        let dt = self.tm - self.to;
        let f = (self.dydt)(self.tm, ym);
        ym - &self.yo - f * dt
    }

    fn name(&self) -> &str {
        "backward Euler"
    }
}

/// Trapezoidal step from `(to, yo)` to `tn`:
/// `F(yn) = yn - yo - 0.5*(tn - to)*(dydt(to, yo) + dydt(tn, yn))`
///
/// Both right-hand sides are evaluated on every call.
pub struct TrapezoidalResidual<F>
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    dydt: F,
    to: f64,
    yo: DVector<f64>,
    tn: f64,
}

impl<F> TrapezoidalResidual<F>
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    pub fn new(dydt: F, to: f64, yo: DVector<f64>, tn: f64) -> Self {
        Self { dydt, to, yo, tn }
    }
}

impl<F> ResidualFunction for TrapezoidalResidual<F>
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    fn residual(&self, yn: &DVector<f64>) -> DVector<f64> {
        let half_dt = 0.5 * (self.tn - self.to);
        let f_old = (self.dydt)(self.to, &self.yo);
        let f_new = (self.dydt)(self.tn, yn);
        yn - &self.yo - (f_old + f_new) * half_dt
    }

    fn name(&self) -> &str {
        "trapezoidal"
    }
}

/// Variable-step BDF2 from `(t1, y1)`, `(t2, y2)` to `t3`.
///
/// With `w = (t3-t2)/(t2-t1)`:
/// `F(y3) = y3 - b*y2 + c*y1 - d*(t3-t2)*dydt(t3, y3)`,
/// `b = (1+w)^2/(1+2w)`, `c = w^2/(1+2w)`, `d = (1+w)/(1+2w)`.
pub struct Bdf2Residual<F>
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    dydt: F,
    t1: f64,
    y1: DVector<f64>,
    t2: f64,
    y2: DVector<f64>,
    t3: f64,
    b: f64,
    c: f64,
    d: f64,
}

impl<F> Bdf2Residual<F>
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    pub fn new(dydt: F, t1: f64, y1: DVector<f64>, t2: f64, y2: DVector<f64>, t3: f64) -> Self {
        let (b, c, d) = bdf2_coefficients(t1, t2, t3);
        Self {
            dydt,
            t1,
            y1,
            t2,
            y2,
            t3,
            b,
            c,
            d,
        }
    }

    /// time levels `(t1, t2, t3)`
    pub fn times(&self) -> (f64, f64, f64) {
        (self.t1, self.t2, self.t3)
    }
}

impl<F> ResidualFunction for Bdf2Residual<F>
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    fn residual(&self, y3: &DVector<f64>) -> DVector<f64> {
        let f = (self.dydt)(self.t3, y3);
        y3 - &self.y2 * self.b + &self.y1 * self.c - f * (self.d * (self.t3 - self.t2))
    }

    fn name(&self) -> &str {
        "BDF2"
    }
}

/// BDF2 weights `(b, c, d)` for the step ratio `w = (t3-t2)/(t2-t1)`
pub fn bdf2_coefficients(t1: f64, t2: f64, t3: f64) -> (f64, f64, f64) {
    let w = (t3 - t2) / (t2 - t1);
    let denom = 1.0 + 2.0 * w;
    let b = (1.0 + w).powi(2) / denom;
    let c = w * w / denom;
    let d = (1.0 + w) / denom;
    (b, c, d)
}

/// `ym - yo - (tm - to)*dydt(tm, ym)`
pub fn backward_euler_residual<F>(dydt: F, to: f64, yo: &DVector<f64>, tm: f64, ym: &DVector<f64>) -> DVector<f64>
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    BackwardEulerResidual::new(dydt, to, yo.clone(), tm).residual(ym)
}

/// `yn - yo - 0.5*(tn - to)*(dydt(to, yo) + dydt(tn, yn))`
pub fn trapezoidal_residual<F>(dydt: F, to: f64, yo: &DVector<f64>, tn: f64, yn: &DVector<f64>) -> DVector<f64>
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    TrapezoidalResidual::new(dydt, to, yo.clone(), tn).residual(yn)
}

/// variable-step BDF2 residual at `y3`, see [`Bdf2Residual`]
pub fn bdf2_residual<F>(
    dydt: F,
    t1: f64,
    y1: &DVector<f64>,
    t2: f64,
    y2: &DVector<f64>,
    t3: f64,
    y3: &DVector<f64>,
) -> DVector<f64>
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    Bdf2Residual::new(dydt, t1, y1.clone(), t2, y2.clone(), t3).residual(y3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::cell::Cell;

    fn decay(_t: f64, y: &DVector<f64>) -> DVector<f64> {
        -y
    }

    #[test]
    fn test_plain_residual() {
        let res = PlainResidual::new(|x: &DVector<f64>| x.map(|v| v * v - 2.0));
        let f = res.residual(&DVector::from_vec(vec![1.0, 2.0]));
        assert_eq!(f, DVector::from_vec(vec![-1.0, 2.0]));
        assert_eq!(res.name(), "plain");
    }

    #[test]
    fn test_backward_euler_residual_vanishes_at_exact_update() {
        let yo = DVector::from_vec(vec![1.0, 2.0]);
        let ym = &yo / 1.1;
        let f = backward_euler_residual(decay, 0.0, &yo, 0.1, &ym);
        assert_relative_eq!(f, DVector::zeros(2), epsilon = 1e-15);
    }

    #[test]
    fn test_trapezoidal_residual_vanishes_at_exact_update() {
        // y' = -y: yn = yo*(1 - dt/2)/(1 + dt/2)
        let yo = DVector::from_vec(vec![1.0]);
        let dt = 0.2;
        let yn = &yo * ((1.0 - 0.5 * dt) / (1.0 + 0.5 * dt));
        let f = trapezoidal_residual(decay, 0.0, &yo, dt, &yn);
        assert_relative_eq!(f[0], 0.0, epsilon = 1e-15);
    }

    #[test]
    fn test_trapezoidal_evaluates_rhs_twice() {
        let calls = Cell::new(0usize);
        let rhs = |_t: f64, y: &DVector<f64>| {
            calls.set(calls.get() + 1);
            y.clone()
        };
        let res = TrapezoidalResidual::new(rhs, 0.0, DVector::from_vec(vec![1.0]), 0.5);
        res.residual(&DVector::from_vec(vec![2.0]));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_bdf2_uniform_step_reduces_to_classic_formula() {
        let (b, c, d) = bdf2_coefficients(0.0, 0.1, 0.2);
        assert_relative_eq!(b, 4.0 / 3.0, epsilon = 1e-14);
        assert_relative_eq!(c, 1.0 / 3.0, epsilon = 1e-14);
        assert_relative_eq!(d, 2.0 / 3.0, epsilon = 1e-14);

        let y1 = DVector::from_vec(vec![1.0]);
        let y2 = DVector::from_vec(vec![0.9]);
        let y3 = DVector::from_vec(vec![0.8]);
        let f = bdf2_residual(decay, 0.0, &y1, 0.1, &y2, 0.2, &y3);
        let classic = 0.8 - 4.0 / 3.0 * 0.9 + 1.0 / 3.0 * 1.0 - 2.0 / 3.0 * 0.1 * (-0.8);
        assert_relative_eq!(f[0], classic, epsilon = 1e-14);
    }

    #[test]
    fn test_bdf2_exact_on_quadratic() {
        // BDF2 integrates y' = 2t exactly for any step ratio
        let rhs = |t: f64, y: &DVector<f64>| DVector::from_element(y.len(), 2.0 * t);
        let (t1, t2, t3) = (0.0, 0.3, 0.45);
        let exact = |t: f64| DVector::from_vec(vec![t * t + 1.0]);
        let f = bdf2_residual(rhs, t1, &exact(t1), t2, &exact(t2), t3, &exact(t3));
        assert_relative_eq!(f[0], 0.0, epsilon = 1e-14);
    }
}
