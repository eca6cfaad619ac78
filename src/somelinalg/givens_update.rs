//! Rank-one update of a QR factorization with Givens rotations.
//!
//! `r1updt` re-triangularizes `S + u*vᵗ` for a lower trapezoidal `S` (stored packed by columns, which
//! is the row-major packed `R` of an upper triangular factor read as `Rᵗ`), and `r1mpyq` applies the
//! same rotations to any conforming matrix. Both rotation sequences are encoded in two vectors:
//! an entry `tau` stands for `sin = tau, cos = sqrt(1 - tau^2)` when `|tau| <= 1`, and for
//! `cos = 1/tau, sin = sqrt(1 - cos^2)` otherwise.

use crate::somelinalg::enorm::giant;
use nalgebra::{DMatrixViewMut, DVector};

const P5: f64 = 0.5;
const P25: f64 = 0.25;

/// (sin, cos, tau) of the rotation that annihilates `b` against `a`
#[inline]
fn givens(a: f64, b: f64) -> (f64, f64, f64) {
    if a.abs() >= b.abs() {
        let tan = b / a;
        let cos = P5 / (P25 + P25 * tan * tan).sqrt();
        let sin = cos * tan;
        (sin, cos, sin)
    } else {
        let cotan = a / b;
        let sin = P5 / (P25 + P25 * cotan * cotan).sqrt();
        let cos = sin * cotan;
        let tau = if cos.abs() * giant::<f64>() > 1.0 {
            1.0 / cos
        } else {
            1.0
        };
        (sin, cos, tau)
    }
}

/// (cos, sin) recovered from an encoded rotation
#[inline]
fn decode(tau: f64) -> (f64, f64) {
    if tau.abs() > 1.0 {
        let cos = 1.0 / tau;
        (cos, (1.0 - cos * cos).sqrt())
    } else {
        ((1.0 - tau * tau).sqrt(), tau)
    }
}

/// Compute the lower trapezoidal `S'` with `(S + u*vᵗ)*Q = S'` for an orthogonal `Q`.
///
/// `s` holds the `m×n` lower trapezoidal `S` packed by columns, length `n*(2m-n+1)/2`, and is
/// overwritten with `S'`. On return `v` and `w` encode the two rotation sequences that make up `Q`
/// (see [`r1mpyq`]); `w` must have length `m`. Returns `true` when a diagonal entry of `S'` is
/// exactly zero.
pub fn r1updt(
    m: usize,
    n: usize,
    s: &mut DVector<f64>,
    u: &DVector<f64>,
    v: &mut DVector<f64>,
    w: &mut DVector<f64>,
) -> bool {
    assert!(n >= 1 && m >= n, "r1updt needs m >= n >= 1");
    assert_eq!(s.len(), n * (2 * m - n + 1) / 2, "packed length of S");
    assert_eq!(u.len(), m);
    assert_eq!(v.len(), n);
    assert_eq!(w.len(), m);

    // index of the last diagonal element of S
    let mut jj = n * (2 * m - n + 1) / 2 - (m - n) - 1;

    // move the nontrivial part of the last column of s into w
    let mut l = jj;
    for i in (n - 1)..m {
        w[i] = s[l];
        l += 1;
    }

    // rotate v into a multiple of the n-th unit vector, introducing a spike into w
    for j in (0..n - 1).rev() {
        jj -= m - j;
        w[j] = 0.0;
        if v[j] != 0.0 {
            let (sin, cos, tau) = givens(v[n - 1], v[j]);
            v[n - 1] = sin * v[j] + cos * v[n - 1];
            v[j] = tau;

            let mut l = jj;
            for i in j..m {
                let temp = cos * s[l] - sin * w[i];
                w[i] = sin * s[l] + cos * w[i];
                s[l] = temp;
                l += 1;
            }
        }
    }

    // add the spike from the rank one update to w
    for i in 0..m {
        w[i] += v[n - 1] * u[i];
    }

    // eliminate the spike
    let mut sing = false;
    for j in 0..n - 1 {
        if w[j] != 0.0 {
            let (sin, cos, tau) = givens(s[jj], w[j]);
            let mut l = jj;
            for i in j..m {
                let temp = cos * s[l] + sin * w[i];
                w[i] = -sin * s[l] + cos * w[i];
                s[l] = temp;
                l += 1;
            }
            w[j] = tau;
        }
        if s[jj] == 0.0 {
            sing = true;
        }
        jj += m - j;
    }

    // move w back into the last column of the output s
    let mut l = jj;
    for i in (n - 1)..m {
        s[l] = w[i];
        l += 1;
    }
    if s[jj] == 0.0 {
        sing = true;
    }
    sing
}

/// Overwrite the `m×n` matrix `a` with `a*Q`, where `Q` is the product of the rotations encoded
/// in `v` and `w` by [`r1updt`].
///
/// The first sequence rotates column `j` against column `n-1` for `j = n-2, ..., 0`, the second
/// for `j = 0, ..., n-2`.
pub fn r1mpyq(mut a: DMatrixViewMut<'_, f64>, v: &DVector<f64>, w: &DVector<f64>) {
    let (m, n) = a.shape();
    if n < 2 {
        return;
    }
    for j in (0..n - 1).rev() {
        let (cos, sin) = decode(v[j]);
        for i in 0..m {
            let temp = cos * a[(i, j)] - sin * a[(i, n - 1)];
            a[(i, n - 1)] = sin * a[(i, j)] + cos * a[(i, n - 1)];
            a[(i, j)] = temp;
        }
    }
    for j in 0..n - 1 {
        let (cos, sin) = decode(w[j]);
        for i in 0..m {
            let temp = cos * a[(i, j)] + sin * a[(i, n - 1)];
            a[(i, n - 1)] = -sin * a[(i, j)] + cos * a[(i, n - 1)];
            a[(i, j)] = temp;
        }
    }
}

/// [`r1mpyq`] for a single row vector, e.g. `qtf`
pub fn r1mpyq_vector(x: &mut DVector<f64>, v: &DVector<f64>, w: &DVector<f64>) {
    let n = x.len();
    r1mpyq(DMatrixViewMut::from_slice(x.as_mut_slice(), 1, n), v, w);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::somelinalg::qr_householder::{
        pack_upper_triangle, qform, qrfac, unpack_upper_triangle,
    };
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;
    use rand::Rng;

    fn factor(a0: &DMatrix<f64>) -> (DMatrix<f64>, DVector<f64>) {
        let n = a0.ncols();
        let mut q = a0.clone();
        let qr = qrfac(&mut q, false);
        let (r, _) = pack_upper_triangle(&q, &qr.rdiag);
        qform(&mut q, n);
        (q, r)
    }

    /// apply the rank-one update `A + u*vᵗ` to `A = Q*R` and return the new `(Q, R)`
    fn updated(
        q: &DMatrix<f64>,
        r: &DVector<f64>,
        u: &DVector<f64>,
        v: &DVector<f64>,
    ) -> (DMatrix<f64>, DVector<f64>, bool) {
        let n = u.len();
        // A + u*vᵗ = Q*(R + (Qᵗu)*vᵗ); transposed this is S + v*(Qᵗu)ᵗ with S = Rᵗ
        let mut s = r.clone();
        let mut w_spike = q.transpose() * u;
        let mut rot_w = DVector::zeros(n);
        let sing = r1updt(n, n, &mut s, v, &mut w_spike, &mut rot_w);
        let mut q_new = q.clone();
        r1mpyq(q_new.view_mut((0, 0), (n, n)), &w_spike, &rot_w);
        (q_new, s, sing)
    }

    #[test]
    fn test_rank_one_update_reproduces_matrix() {
        let mut rng = rand::rng();
        for n in [1usize, 2, 4, 7, 12] {
            let a0 = DMatrix::from_fn(n, n, |i, j| {
                rng.random_range(-1.0..1.0) + if i == j { 3.0 } else { 0.0 }
            });
            let u = DVector::from_fn(n, |_, _| rng.random_range(-1.0..1.0));
            let v = DVector::from_fn(n, |_, _| rng.random_range(-1.0..1.0));
            let (q, r) = factor(&a0);
            let (q_new, r_new, _sing) = updated(&q, &r, &u, &v);

            let target = &a0 + &u * v.transpose();
            let r_dense = unpack_upper_triangle(&r_new, n);
            assert_relative_eq!(&q_new * &r_dense, target, epsilon = 1e-11);
            // updated Q stays orthogonal
            assert_relative_eq!(
                q_new.transpose() * &q_new,
                DMatrix::identity(n, n),
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn test_rank_one_update_matches_fresh_factorization_up_to_sign() {
        #[rustfmt::skip]
        let a0 = DMatrix::from_row_slice(4, 4, &[
            4.0, 1.0, 0.5, 0.0,
            1.0, 5.0, 1.0, 0.3,
            0.2, 1.0, 6.0, 1.0,
            0.0, 0.4, 1.0, 7.0,
        ]);
        let u = DVector::from_vec(vec![0.3, -0.7, 0.2, 1.1]);
        let v = DVector::from_vec(vec![-0.5, 0.25, 0.9, 0.1]);
        let (q, r) = factor(&a0);
        let (_q_new, r_new, sing) = updated(&q, &r, &u, &v);
        assert!(!sing);

        let (_, r_fresh) = factor(&(&a0 + &u * v.transpose()));
        let r_upd = unpack_upper_triangle(&r_new, 4);
        let r_ref = unpack_upper_triangle(&r_fresh, 4);
        for i in 0..4 {
            let sign = (r_upd[(i, i)] * r_ref[(i, i)]).signum();
            for j in i..4 {
                assert_relative_eq!(r_upd[(i, j)] * sign, r_ref[(i, j)], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_update_to_singular_matrix_sets_flag() {
        // I - e0*e0ᵗ has a zero first column
        let a0 = DMatrix::<f64>::identity(3, 3);
        let u = DVector::from_vec(vec![-1.0, 0.0, 0.0]);
        let v = DVector::from_vec(vec![1.0, 0.0, 0.0]);
        let (q, r) = factor(&a0);
        let (_, _, sing) = updated(&q, &r, &u, &v);
        assert!(sing);
    }

    #[test]
    fn test_r1mpyq_vector_matches_matrix_row() {
        let v = DVector::from_vec(vec![0.3, -2.5, 0.0]);
        let w = DVector::from_vec(vec![1.7, 0.4, 0.0]);
        let x0 = DVector::from_vec(vec![1.0, 2.0, -3.0]);
        let mut x = x0.clone();
        r1mpyq_vector(&mut x, &v, &w);
        let mut row = DMatrix::from_row_slice(1, 3, x0.as_slice());
        r1mpyq(row.view_mut((0, 0), (1, 3)), &v, &w);
        for j in 0..3 {
            assert_relative_eq!(x[j], row[(0, j)], epsilon = 1e-15);
        }
        // rotations preserve the norm
        assert_relative_eq!(x.norm(), x0.norm(), epsilon = 1e-14);
    }

    #[test]
    fn test_decode_round_trip() {
        for (a, b) in [(3.0, 4.0), (4.0, 3.0), (-1.0, 2.0), (1e-3, -5.0)] {
            let (sin, cos, tau) = givens(a, b);
            let (c, s) = decode(tau);
            assert_relative_eq!(c, cos, epsilon = 1e-14);
            assert_relative_eq!(s, sin, epsilon = 1e-14);
        }
    }
}
