use crate::somelinalg::enorm::{enorm, epsmch};
use nalgebra::DVector;
/// Powell's dogleg step for the trust-region subproblem
///
///   min ||qtb - R*x||  subject to  ||diag .* x|| <= delta
///
/// `r` is the `n×n` upper triangular factor packed by rows (length `n(n+1)/2`) and `qtb` holds
/// `Qᵗ*b`. The result is a convex combination of the Gauss-Newton direction and the scaled gradient
/// direction; the Gauss-Newton step is returned unchanged when it lies inside the trust region.
/// A zero diagonal of `R` is replaced by `epsmch` times the largest entry of its column.
pub fn dogleg(r: &DVector<f64>, diag: &DVector<f64>, qtb: &DVector<f64>, delta: f64) -> DVector<f64> {
    let n = diag.len();
    assert_eq!(r.len(), n * (n + 1) / 2, "packed R must have length n(n+1)/2");
    assert_eq!(qtb.len(), n);
    let eps = epsmch::<f64>();

    // STEP 1: Gauss-Newton direction by back substitution
    let mut x = DVector::<f64>::zeros(n);
    let mut jj = n * (n + 1) / 2;
    for k in 1..=n {
        let j = n - k;
        jj -= k;
        let mut l = jj + 1;
        let mut sum = 0.0;
        for i in (j + 1)..n {
            sum += r[l] * x[i];
            l += 1;
        }
        let mut temp = r[jj];
        if temp == 0.0 {
            // singular pivot: scale the largest entry of column j
            let mut l = j;
            for i in 0..=j {
                temp = temp.max(r[l].abs());
                l += n - i - 1;
            }
            temp *= eps;
            if temp == 0.0 {
                temp = eps;
            }
        }
        x[j] = (qtb[j] - sum) / temp;
    }

    // STEP 2: accept the Gauss-Newton direction if it is inside the trust region
    let mut wa1 = DVector::<f64>::zeros(n);
    let mut wa2 = diag.component_mul(&x);
    let qnorm = enorm(&wa2);
    if qnorm <= delta {
        return x;
    }

    // STEP 3: scaled gradient direction Rᵗ*qtb ./ diag
    let mut l = 0;
    for j in 0..n {
        let temp = qtb[j];
        for i in j..n {
            wa1[i] += r[l] * temp;
            l += 1;
        }
        wa1[j] /= diag[j];
    }

    // norm of the scaled gradient; a zero gradient leaves only the Gauss-Newton direction
    let gnorm = enorm(&wa1);
    let mut sgnorm = 0.0;
    let mut alpha = delta / qnorm;
    if gnorm != 0.0 {
        // point along the scaled gradient at which the quadratic is minimized
        for j in 0..n {
            wa1[j] = (wa1[j] / gnorm) / diag[j];
        }
        let mut l = 0;
        for j in 0..n {
            let mut sum = 0.0;
            for i in j..n {
                sum += r[l] * wa1[i];
                l += 1;
            }
            wa2[j] = sum;
        }
        let temp = enorm(&wa2);
        sgnorm = (gnorm / temp) / temp;

        // STEP 4: the gradient minimizer is outside: pure scaled-gradient step (alpha = 0)
        alpha = 0.0;
        if sgnorm < delta {
            // STEP 5: intersect the dogleg path with the trust region boundary
            let bnorm = enorm(qtb);
            let dq = delta / qnorm;
            let sd = sgnorm / delta;
            let mut temp = (bnorm / gnorm) * (bnorm / qnorm) * sd;
            temp = temp - dq * sd * sd
                + ((temp - dq).powi(2) + (1.0 - dq * dq) * (1.0 - sd * sd)).sqrt();
            alpha = (dq * (1.0 - sd * sd)) / temp;
        }
    }

    // convex combination of the Gauss-Newton and scaled gradient directions
    let temp = (1.0 - alpha) * sgnorm.min(delta);
    for j in 0..n {
        x[j] = temp * wa1[j] + alpha * x[j];
    }
    x
}
