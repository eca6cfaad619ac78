//! Householder QR factorization with optional column pivoting and explicit Q accumulation.
//!
//! The factorization works in place: on return the lower trapezoidal part of `a` holds the
//! Householder vectors and the strict upper triangle holds the strict upper part of `R`. The
//! diagonal of `R` is returned separately in [`QrFactors::rdiag`].
#![allow(clippy::excessive_precision)]

use crate::somelinalg::enorm::{enorm, epsmch};
use nalgebra::{DMatrix, DVector};
use std::fmt::Display;

/// Everything `qrfac` produces besides the overwritten matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct QrFactors {
    /// Diagonal entries of `R`
    pub rdiag: DVector<f64>,
    /// Euclidean norms of the columns of the input matrix
    pub acnorm: DVector<f64>,
    /// Column permutation: column `j` of `A*P` is column `ipvt[j]` of `A`.
    /// Identity when pivoting was not requested.
    pub ipvt: Vec<usize>,
}

impl Display for QrFactors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "QrFactors {{")?;
        writeln!(f, "rdiag: {:?}", self.rdiag)?;
        writeln!(f, "acnorm: {:?}", self.acnorm)?;
        writeln!(f, "ipvt: {:?} }}", self.ipvt)
    }
}

/// Householder QR factorization of the `m×n` matrix `a`, `A*P = Q*R`.
///
/// With `pivot` the remaining column of largest partial norm is swapped in at every stage. Partial
/// column norms are downdated after each reflection and recomputed from scratch when the downdate
/// has lost too many digits (`0.05*(rdiag/wa)^2 <= epsmch`).
pub fn qrfac(a: &mut DMatrix<f64>, pivot: bool) -> QrFactors {
    let (m, n) = a.shape();
    let eps = epsmch::<f64>();
    let p05 = 0.05;

    let acnorm = DVector::from_iterator(n, a.column_iter().map(|c| enorm(&c)));
    let mut rdiag = acnorm.clone();
    let mut wa = acnorm.clone();
    let mut ipvt: Vec<usize> = (0..n).collect();

    for j in 0..m.min(n) {
        if pivot {
            // bring the column of largest remaining norm into the pivot position
            let mut kmax = j;
            for k in j..n {
                if rdiag[k] > rdiag[kmax] {
                    kmax = k;
                }
            }
            if kmax != j {
                a.swap_columns(j, kmax);
                rdiag[kmax] = rdiag[j];
                wa[kmax] = wa[j];
                ipvt.swap(j, kmax);
            }
        }

        // Householder transformation reducing the j-th column to a multiple of the j-th unit vector
        let mut ajnorm = enorm(&a.view_range(j.., j));
        if ajnorm != 0.0 {
            if a[(j, j)] < 0.0 {
                ajnorm = -ajnorm;
            }
            for i in j..m {
                a[(i, j)] /= ajnorm;
            }
            a[(j, j)] += 1.0;

            // apply the transformation to the remaining columns and update the norms
            for k in (j + 1)..n {
                let mut sum = 0.0;
                for i in j..m {
                    sum += a[(i, j)] * a[(i, k)];
                }
                let temp = sum / a[(j, j)];
                for i in j..m {
                    a[(i, k)] -= temp * a[(i, j)];
                }
                if pivot && rdiag[k] != 0.0 {
                    let temp = a[(j, k)] / rdiag[k];
                    rdiag[k] *= (1.0 - temp * temp).max(0.0).sqrt();
                    let ratio = rdiag[k] / wa[k];
                    if p05 * ratio * ratio <= eps {
                        rdiag[k] = if j + 1 < m {
                            enorm(&a.view_range(j + 1.., k))
                        } else {
                            0.0
                        };
                        wa[k] = rdiag[k];
                    }
                }
            }
        }
        rdiag[j] = -ajnorm;
    }

    QrFactors {
        rdiag,
        acnorm,
        ipvt,
    }
}

/// Accumulate the orthogonal matrix `Q` from its factored form.
///
/// `q` is `m×m`; on input its first `n` columns hold the output of [`qrfac`], on output it holds
/// `Q` explicitly. When `n < m` the missing columns start from the identity.
pub fn qform(q: &mut DMatrix<f64>, n: usize) {
    let m = q.nrows();
    assert_eq!(q.ncols(), m, "qform works on a square matrix");
    let minmn = m.min(n);

    // zero out the upper triangle of q in the first min(m,n) columns
    for j in 1..minmn {
        for i in 0..j {
            q[(i, j)] = 0.0;
        }
    }
    // initialize the remaining columns to those of the identity matrix
    for j in n..m {
        q.column_mut(j).fill(0.0);
        q[(j, j)] = 1.0;
    }

    let mut wa = DVector::<f64>::zeros(m);
    for k in (0..minmn).rev() {
        for i in k..m {
            wa[i] = q[(i, k)];
            q[(i, k)] = 0.0;
        }
        q[(k, k)] = 1.0;
        if wa[k] != 0.0 {
            for j in k..m {
                let mut sum = 0.0;
                for i in k..m {
                    sum += q[(i, j)] * wa[i];
                }
                let temp = sum / wa[k];
                for i in k..m {
                    q[(i, j)] -= temp * wa[i];
                }
            }
        }
    }
}

/// Overwrite `b` with `Qᵗ*b` using the Householder vectors stored in `a` by [`qrfac`].
pub fn apply_qt(a: &DMatrix<f64>, b: &mut DVector<f64>) {
    let (m, n) = a.shape();
    for j in 0..m.min(n) {
        if a[(j, j)] != 0.0 {
            let mut sum = 0.0;
            for i in j..m {
                sum += a[(i, j)] * b[i];
            }
            let temp = -sum / a[(j, j)];
            for i in j..m {
                b[i] += a[(i, j)] * temp;
            }
        }
    }
}

/// Copy the upper triangle of `R` into row-major packed storage of length `n(n+1)/2`.
///
/// The strict upper part comes from `a`, the diagonal from `rdiag`. The flag is `true` when some
/// diagonal entry is exactly zero.
pub fn pack_upper_triangle(a: &DMatrix<f64>, rdiag: &DVector<f64>) -> (DVector<f64>, bool) {
    let n = a.ncols();
    let mut r = DVector::zeros(n * (n + 1) / 2);
    let mut sing = false;
    for j in 0..n {
        let mut l = j;
        for i in 0..j {
            r[l] = a[(i, j)];
            l += n - i - 1;
        }
        r[l] = rdiag[j];
        if rdiag[j] == 0.0 {
            sing = true;
        }
    }
    (r, sing)
}

/// Expand row-major packed upper triangular storage into a dense `n×n` matrix.
pub fn unpack_upper_triangle(r: &DVector<f64>, n: usize) -> DMatrix<f64> {
    assert_eq!(r.len(), n * (n + 1) / 2, "packed length must be n(n+1)/2");
    let mut out = DMatrix::zeros(n, n);
    let mut l = 0;
    for i in 0..n {
        for j in i..n {
            out[(i, j)] = r[l];
            l += 1;
        }
    }
    out
}
