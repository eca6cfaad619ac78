//! Forward-difference approximation of the Jacobian of a residual, dense or banded.
//!
//! For a banded Jacobian (`ml` sub-, `mu` superdiagonals) every `msum = ml + mu + 1`-th variable can
//! be perturbed at once, since the columns they touch do not overlap. This needs `msum` residual
//! evaluations instead of `n`.
use super::residuals::{Bdf2Residual, BackwardEulerResidual, ResidualFunction, TrapezoidalResidual};
use crate::somelinalg::enorm::epsmch;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

/// number of residual evaluations one Jacobian costs: `min(ml + mu + 1, n)`
pub fn jacobian_cost(n: usize, ml: usize, mu: usize) -> usize {
    (ml + mu + 1).min(n)
}

/// relative step `sqrt(max(epsfcn, epsmch))`
fn relative_step(epsfcn: f64) -> f64 {
    epsfcn.max(epsmch::<f64>()).sqrt()
}

/// absolute step `eps*|xj|` for a component with value `xj`, or `eps` itself when `xj == 0`.
///
/// The step is relative to `|xj|` alone, not `max(|xj|, 1)`, so small components get
/// proportionally small steps; the zero fallback covers the case where that would vanish.
#[inline]
fn step_for(eps: f64, xj: f64) -> f64 {
    let h = eps * xj.abs();
    if h == 0.0 { eps } else { h }
}

/// keep only the entries of column `j` inside the band, scaled by `1/h`
#[inline]
fn fill_banded_column(
    fjac: &mut DMatrix<f64>,
    j: usize,
    perturbed: &DVector<f64>,
    fvec: &DVector<f64>,
    h: f64,
    ml: usize,
    mu: usize,
) {
    for i in 0..fjac.nrows() {
        fjac[(i, j)] = if i + mu >= j && i <= j + ml {
            (perturbed[i] - fvec[i]) / h
        } else {
            0.0
        };
    }
}

/// Forward-difference Jacobian of `fcn` at `x`.
///
/// `fvec` must hold the residual at `x`. `x` is perturbed in place and restored before returning.
/// When `ml + mu + 1 >= n` the dense path is taken (one evaluation per column); otherwise columns
/// are grouped by bandwidth and entries outside the band are set to zero.
/// Returns the number of residual evaluations spent.
pub fn fdjac1<R: ResidualFunction + ?Sized>(
    fcn: &R,
    x: &mut DVector<f64>,
    fvec: &DVector<f64>,
    fjac: &mut DMatrix<f64>,
    ml: usize,
    mu: usize,
    epsfcn: f64,
) -> usize {
    let n = x.len();
    let eps = relative_step(epsfcn);
    let msum = ml + mu + 1;

    if msum >= n {
        // dense approximate jacobian
        for j in 0..n {
            let temp = x[j];
            let h = step_for(eps, temp);
            x[j] = temp + h;
            let wa1 = fcn.residual(x);
            x[j] = temp;
            for i in 0..n {
                fjac[(i, j)] = (wa1[i] - fvec[i]) / h;
            }
        }
        n
    } else {
        // banded approximate jacobian
        let mut wa2 = DVector::<f64>::zeros(n);
        for k in 0..msum {
            for j in (k..n).step_by(msum) {
                wa2[j] = x[j];
                x[j] = wa2[j] + step_for(eps, wa2[j]);
            }
            let wa1 = fcn.residual(x);
            for j in (k..n).step_by(msum) {
                x[j] = wa2[j];
                let h = step_for(eps, wa2[j]);
                fill_banded_column(fjac, j, &wa1, fvec, h, ml, mu);
            }
        }
        msum
    }
}

/// [`fdjac1`] with the independent perturbations evaluated on the rayon thread pool.
///
/// Each dense column or banded group gets its own copy of `x`, so the result is identical to the
/// serial version.
pub fn fdjac1_parallel<R: ResidualFunction + Sync + ?Sized>(
    fcn: &R,
    x: &DVector<f64>,
    fvec: &DVector<f64>,
    fjac: &mut DMatrix<f64>,
    ml: usize,
    mu: usize,
    epsfcn: f64,
) -> usize {
    let n = x.len();
    let eps = relative_step(epsfcn);
    let msum = ml + mu + 1;

    if msum >= n {
        let columns: Vec<(f64, DVector<f64>)> = (0..n)
            .into_par_iter()
            .map(|j| {
                let mut xp = x.clone();
                let h = step_for(eps, x[j]);
                xp[j] = x[j] + h;
                (h, fcn.residual(&xp))
            })
            .collect();
        for (j, (h, wa1)) in columns.iter().enumerate() {
            for i in 0..n {
                fjac[(i, j)] = (wa1[i] - fvec[i]) / h;
            }
        }
        n
    } else {
        let groups: Vec<DVector<f64>> = (0..msum)
            .into_par_iter()
            .map(|k| {
                let mut xp = x.clone();
                for j in (k..n).step_by(msum) {
                    xp[j] = x[j] + step_for(eps, x[j]);
                }
                fcn.residual(&xp)
            })
            .collect();
        for (k, wa1) in groups.iter().enumerate() {
            for j in (k..n).step_by(msum) {
                let h = step_for(eps, x[j]);
                fill_banded_column(fjac, j, wa1, fvec, h, ml, mu);
            }
        }
        msum
    }
}

/// forward-difference Jacobian of a backward Euler residual, see [`fdjac1`]
pub fn fdjac_be<F>(
    residual: &BackwardEulerResidual<F>,
    ym: &mut DVector<f64>,
    fvec: &DVector<f64>,
    fjac: &mut DMatrix<f64>,
    ml: usize,
    mu: usize,
    epsfcn: f64,
) -> usize
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    fdjac1(residual, ym, fvec, fjac, ml, mu, epsfcn)
}

/// forward-difference Jacobian of a trapezoidal residual, see [`fdjac1`]
pub fn fdjac_tr<F>(
    residual: &TrapezoidalResidual<F>,
    yn: &mut DVector<f64>,
    fvec: &DVector<f64>,
    fjac: &mut DMatrix<f64>,
    ml: usize,
    mu: usize,
    epsfcn: f64,
) -> usize
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    fdjac1(residual, yn, fvec, fjac, ml, mu, epsfcn)
}

/// forward-difference Jacobian of a BDF2 residual, see [`fdjac1`]
pub fn fdjac_bdf2<F>(
    residual: &Bdf2Residual<F>,
    y3: &mut DVector<f64>,
    fvec: &DVector<f64>,
    fjac: &mut DMatrix<f64>,
    ml: usize,
    mu: usize,
    epsfcn: f64,
) -> usize
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    fdjac1(residual, y3, fvec, fjac, ml, mu, epsfcn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerical::Nonlinear_systems::residuals::PlainResidual;
    use approx::assert_relative_eq;
    use std::cell::Cell;

    /// tridiagonal test system: f_i = (3 - 2 x_i) x_i - x_{i-1} - 2 x_{i+1} + 1
    fn broyden_tridiagonal(x: &DVector<f64>) -> DVector<f64> {
        let n = x.len();
        DVector::from_fn(n, |i, _| {
            let left = if i > 0 { x[i - 1] } else { 0.0 };
            let right = if i + 1 < n { x[i + 1] } else { 0.0 };
            (3.0 - 2.0 * x[i]) * x[i] - left - 2.0 * right + 1.0
        })
    }

    fn broyden_tridiagonal_jacobian(x: &DVector<f64>) -> DMatrix<f64> {
        let n = x.len();
        DMatrix::from_fn(n, n, |i, j| {
            if i == j {
                3.0 - 4.0 * x[i]
            } else if j + 1 == i {
                -1.0
            } else if i + 1 == j {
                -2.0
            } else {
                0.0
            }
        })
    }

    #[test]
    fn test_dense_jacobian_close_to_analytic() {
        let res = PlainResidual::new(broyden_tridiagonal);
        let mut x = DVector::from_fn(6, |i, _| -1.0 + 0.1 * i as f64);
        let x0 = x.clone();
        let fvec = res.residual(&x);
        let mut fjac = DMatrix::zeros(6, 6);
        let nfev = fdjac1(&res, &mut x, &fvec, &mut fjac, 5, 5, 0.0);
        assert_eq!(nfev, 6);
        assert_eq!(x, x0, "x must be restored");
        assert_relative_eq!(fjac, broyden_tridiagonal_jacobian(&x0), epsilon = 1e-6);
    }

    #[test]
    fn test_banded_jacobian_uses_msum_evaluations() {
        let calls = Cell::new(0usize);
        let res = PlainResidual::new(|x: &DVector<f64>| {
            calls.set(calls.get() + 1);
            broyden_tridiagonal(x)
        });
        let n = 20;
        let mut x = DVector::from_element(n, -1.0);
        let fvec = res.residual(&x);
        calls.set(0);
        let mut fjac = DMatrix::from_element(n, n, 7.0);
        let nfev = fdjac1(&res, &mut x, &fvec, &mut fjac, 1, 1, 0.0);
        assert_eq!(nfev, 3);
        assert_eq!(calls.get(), 3);
        // entries outside the band are zeroed, band entries match the analytic jacobian
        assert_relative_eq!(fjac, broyden_tridiagonal_jacobian(&x), epsilon = 1e-6);
        assert_eq!(jacobian_cost(n, 1, 1), 3);
    }

    #[test]
    fn test_banded_matches_dense_for_banded_function() {
        let res = PlainResidual::new(broyden_tridiagonal);
        let n = 9;
        let mut x = DVector::from_fn(n, |i, _| 0.5 - 0.2 * i as f64);
        let fvec = res.residual(&x);
        let mut dense = DMatrix::zeros(n, n);
        let mut banded = DMatrix::zeros(n, n);
        fdjac1(&res, &mut x, &fvec, &mut dense, n - 1, n - 1, 0.0);
        fdjac1(&res, &mut x, &fvec, &mut banded, 1, 1, 0.0);
        assert_relative_eq!(dense, banded, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_component_uses_absolute_step() {
        let res = PlainResidual::new(|x: &DVector<f64>| x.map(|v| v * v + 3.0 * v));
        let mut x = DVector::zeros(2);
        let fvec = res.residual(&x);
        let mut fjac = DMatrix::zeros(2, 2);
        fdjac1(&res, &mut x, &fvec, &mut fjac, 1, 1, 0.0);
        assert!(fjac.iter().all(|v| v.is_finite()));
        assert_relative_eq!(fjac[(0, 0)], 3.0, epsilon = 1e-6);
        assert_relative_eq!(fjac[(1, 1)], 3.0, epsilon = 1e-6);
        assert_eq!(fjac[(0, 1)], 0.0);
    }

    #[test]
    fn test_epsfcn_controls_step() {
        // for a quadratic the forward-difference error is h, so a larger epsfcn gives a larger error
        let res = PlainResidual::new(|x: &DVector<f64>| x.map(|v| v * v));
        let mut x = DVector::from_vec(vec![1.0]);
        let fvec = res.residual(&x);
        let mut fine = DMatrix::zeros(1, 1);
        let mut coarse = DMatrix::zeros(1, 1);
        fdjac1(&res, &mut x, &fvec, &mut fine, 0, 0, 0.0);
        fdjac1(&res, &mut x, &fvec, &mut coarse, 0, 0, 1e-4);
        assert_relative_eq!(coarse[(0, 0)], 2.01, epsilon = 1e-8);
        assert!((fine[(0, 0)] - 2.0).abs() < (coarse[(0, 0)] - 2.0).abs());
    }

    #[test]
    fn test_parallel_matches_serial() {
        let res = PlainResidual::new(broyden_tridiagonal);
        let n = 12;
        let mut x = DVector::from_fn(n, |i, _| (i as f64 * 0.37).sin());
        let fvec = res.residual(&x);
        for (ml, mu) in [(n - 1, n - 1), (1, 1), (2, 0)] {
            let mut serial = DMatrix::zeros(n, n);
            let mut parallel = DMatrix::zeros(n, n);
            let nfev_s = fdjac1(&res, &mut x, &fvec, &mut serial, ml, mu, 0.0);
            let nfev_p = fdjac1_parallel(&res, &x, &fvec, &mut parallel, ml, mu, 0.0);
            assert_eq!(nfev_s, nfev_p);
            assert_eq!(serial, parallel);
        }
    }

    #[test]
    fn test_backward_euler_jacobian() {
        // y' = -y^2: dF/dy = 1 + 2*dt*y
        let rhs = |_t: f64, y: &DVector<f64>| y.map(|v| -v * v);
        let res = BackwardEulerResidual::new(rhs, 0.0, DVector::from_vec(vec![1.0]), 0.1);
        let mut ym = DVector::from_vec(vec![0.9]);
        let fvec = res.residual(&ym);
        let mut fjac = DMatrix::zeros(1, 1);
        let nfev = fdjac_be(&res, &mut ym, &fvec, &mut fjac, 0, 0, 0.0);
        assert_eq!(nfev, 1);
        assert_relative_eq!(fjac[(0, 0)], 1.0 + 2.0 * 0.1 * 0.9, epsilon = 1e-6);
    }

    #[test]
    fn test_trapezoidal_and_bdf2_jacobians() {
        let rhs = |_t: f64, y: &DVector<f64>| -y * 2.0;
        let tr = TrapezoidalResidual::new(rhs, 0.0, DVector::from_vec(vec![1.0, 1.0]), 0.2);
        let mut yn = DVector::from_vec(vec![0.5, 0.7]);
        let fvec = tr.residual(&yn);
        let mut fjac = DMatrix::zeros(2, 2);
        fdjac_tr(&tr, &mut yn, &fvec, &mut fjac, 1, 1, 0.0);
        // dF/dy = I + 0.5*dt*2*I
        assert_relative_eq!(fjac, DMatrix::identity(2, 2) * 1.2, epsilon = 1e-6);

        let bdf = Bdf2Residual::new(
            rhs,
            0.0,
            DVector::from_vec(vec![1.0, 1.0]),
            0.1,
            DVector::from_vec(vec![0.8, 0.8]),
            0.2,
        );
        let mut y3 = DVector::from_vec(vec![0.6, 0.6]);
        let fvec = bdf.residual(&y3);
        fdjac_bdf2(&bdf, &mut y3, &fvec, &mut fjac, 1, 1, 0.0);
        // dF/dy = I + d*h*2*I with d = 2/3, h = 0.1
        assert_relative_eq!(
            fjac,
            DMatrix::identity(2, 2) * (1.0 + 2.0 / 3.0 * 0.1 * 2.0),
            epsilon = 1e-6
        );
    }
}
