//! Powell's hybrid method (MINPACK HYBRD) for square nonlinear systems and for the implicit
//! steps of backward Euler, trapezoidal and BDF2 integrators.
///  Example
/// ```
/// use RustedHybrd::numerical::Nonlinear_systems::fsolve::{fsolve_be, SolveStatus};
/// use nalgebra::DVector;
/// // one backward Euler step of y' = -y
/// let yo = DVector::from_vec(vec![1.0]);
/// let mut ym = yo.clone();
/// let mut fvec = DVector::zeros(1);
/// let status = fsolve_be(|_t, y: &DVector<f64>| -y, 0.0, &yo, 0.1, &mut ym, &mut fvec, 1e-10);
/// assert_eq!(status, SolveStatus::Converged);
/// assert!((ym[0] - 1.0 / 1.1).abs() < 1e-10);
/// ```
pub mod fsolve;
/// residual formulations: plain function and implicit ODE steps
pub mod residuals;
/// forward-difference Jacobians, dense and banded
pub mod fdjac;
/// dogleg step inside the scaled trust region
pub mod dogleg;
/// the hybrid trust-region iteration
pub mod hybrd;
