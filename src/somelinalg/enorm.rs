//! Overflow- and underflow-safe Euclidean norm and the machine constants it relies on.
//!
//! Components are sorted into three magnitude buckets (small, intermediate, large). The small and
//! large buckets keep their sums of squares relative to a running maximum, so no square is ever
//! formed of a number that could leave the representable range.
#![allow(unexpected_cfgs)]

use nalgebra::{DVector, Dim, RealField, U1, Vector, storage::Storage};
use num_traits::float::Float;

cfg_if::cfg_if! {
    if #[cfg(feature = "RUSTC_IS_NIGHTLY")] {
        pub use core::intrinsics::{likely, unlikely};
    } else {
        #[inline]
        pub fn likely(b: bool) -> bool {
            b
        }

        #[inline]
        pub fn unlikely(b: bool) -> bool {
            b
        }
    }
}

/// machine precision
#[inline]
pub fn epsmch<F: RealField>() -> F {
    F::default_epsilon()
}

/// largest representable magnitude
#[inline]
pub fn giant<F: Float>() -> F {
    F::max_value()
}

/// smallest positive normalized magnitude
#[inline]
pub fn dwarf<F: Float>() -> F {
    F::min_positive_value()
}

/// sum of squares kept relative to its largest term, `max^2 * sum`
#[derive(Clone, Copy)]
struct ScaledSum<F> {
    max: F,
    sum: F,
}

impl<F: Float> ScaledSum<F> {
    fn new() -> Self {
        Self {
            max: F::zero(),
            sum: F::zero(),
        }
    }

    #[inline]
    fn add(&mut self, xabs: F) {
        if xabs > self.max {
            self.sum = F::one() + self.sum * Float::powi(self.max / xabs, 2);
            self.max = xabs;
        } else if xabs != F::zero() {
            self.sum = self.sum + Float::powi(xabs / self.max, 2);
        }
    }
}

/// Euclidean norm of `v` without destructive overflow or underflow.
///
/// `rdwarf = sqrt(dwarf)` and `agiant = sqrt(giant) / n` split the components into buckets;
/// the three partial sums are merged at the end. A NaN component is returned as is.
#[inline]
pub fn enorm<F, N, VS>(v: &Vector<F, N, VS>) -> F
where
    F: nalgebra::RealField + Float + Copy,
    N: Dim,
    VS: Storage<F, N, U1>,
{
    let n = v.nrows();
    if n == 0 {
        return F::zero();
    }
    let agiant = Float::sqrt(giant::<F>()) / nalgebra::convert(n as f64);
    let rdwarf = Float::sqrt(dwarf::<F>());

    let mut large = ScaledSum::new();
    let mut small = ScaledSum::new();
    let mut mid = F::zero();
    for xi in v.iter() {
        let xabs = Float::abs(*xi);
        if unlikely(Float::is_nan(xabs)) {
            return xabs;
        }
        if likely(xabs > rdwarf && xabs < agiant) {
            mid = mid + xabs * xabs;
        } else if xabs > rdwarf {
            large.add(xabs);
        } else {
            small.add(xabs);
        }
    }

    // large components dominate; small ones only matter when nothing else is there
    if unlikely(!large.sum.is_zero()) {
        large.max * Float::sqrt(large.sum + (mid / large.max) / large.max)
    } else if mid.is_zero() {
        small.max * Float::sqrt(small.sum)
    } else if mid >= small.max {
        Float::sqrt(mid * (F::one() + (small.max / mid) * (small.max * small.sum)))
    } else {
        Float::sqrt(small.max * ((mid / small.max) + (small.max * small.sum)))
    }
}

/// `enorm(diag .* x)`
pub fn scaled_enorm(diag: &DVector<f64>, x: &DVector<f64>) -> f64 {
    enorm(&diag.component_mul(x))
}
