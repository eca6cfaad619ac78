//! Powell's hybrid method for square nonlinear systems `F(x) = 0`.
//!
//! The Jacobian is approximated by forward differences, factored once per outer iteration and then
//! kept current with Broyden rank-one updates of its QR factors. Each inner iteration takes a dogleg
//! step inside an adaptive trust region; a fresh Jacobian is only computed after two consecutive
//! failures of the updated model.
use super::dogleg::dogleg;
use super::fdjac::{fdjac1, fdjac1_parallel, jacobian_cost};
use super::residuals::{Bdf2Residual, BackwardEulerResidual, ResidualFunction, TrapezoidalResidual};
use crate::somelinalg::enorm::{enorm, epsmch, scaled_enorm};
use crate::somelinalg::givens_update::{r1mpyq, r1mpyq_vector, r1updt};
use crate::somelinalg::qr_householder::{apply_qt, pack_upper_triangle, qform, qrfac};
use log::{debug, error, info};
use nalgebra::{DMatrix, DVector};
use std::collections::HashMap;
use std::fmt;
use strum_macros::{Display, EnumIter};

/// `sqrt(epsmch)` for `f64`
pub const DEFAULT_XTOL: f64 = 1.49012e-8;

////////////////////////////////////////////ERRORS/////////////////////////////////////////////
#[derive(Debug, Clone, PartialEq)]
pub enum HybrdError {
    EmptySystem,
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    NegativeXtol(f64),
    NonPositiveMaxfev,
    NegativeBandwidth {
        name: String,
        value: f64,
    },
    NonPositiveFactor(f64),
    NonPositiveDiag {
        index: usize,
        value: f64,
    },
    NegativeEpsfcn(f64),
    UnknownParameter(String),
}

impl fmt::Display for HybrdError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HybrdError::EmptySystem => write!(f, "System has no unknowns"),
            HybrdError::DimensionMismatch {
                what,
                expected,
                found,
            } => write!(f, "Length of {} is {}, expected {}", what, found, expected),
            HybrdError::NegativeXtol(xtol) => write!(f, "xtol must be non-negative, got {}", xtol),
            HybrdError::NonPositiveMaxfev => write!(f, "maxfev must be positive"),
            HybrdError::NegativeBandwidth { name, value } => {
                write!(f, "Band width {} must be non-negative, got {}", name, value)
            }
            HybrdError::NonPositiveFactor(factor) => {
                write!(f, "factor must be positive, got {}", factor)
            }
            HybrdError::NonPositiveDiag { index, value } => {
                write!(f, "diag[{}] must be positive, got {}", index, value)
            }
            HybrdError::NegativeEpsfcn(epsfcn) => {
                write!(f, "epsfcn must be non-negative, got {}", epsfcn)
            }
            HybrdError::UnknownParameter(key) => write!(f, "Unknown parameter: {}", key),
        }
    }
}

impl std::error::Error for HybrdError {}

////////////////////////////////////////////OPTIONS////////////////////////////////////////////
/// How the variables are scaled in the trust-region norm `||diag .* x||`
#[derive(Debug, Clone, PartialEq)]
pub enum Scaling {
    /// `diag` from the column norms of the first Jacobian, raised monotonically afterwards
    Internal,
    /// fixed positive `diag` given by the caller
    Supplied(DVector<f64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HybrdOptions {
    /// relative error tolerance between two consecutive iterates
    pub xtol: f64,
    /// limit on residual evaluations; `None` means `200*(n+1)`
    pub maxfev: Option<usize>,
    /// sub- and superdiagonals of a banded Jacobian; `None` means dense
    pub ml: Option<usize>,
    pub mu: Option<usize>,
    /// relative error of the residual, sets the forward-difference step
    pub epsfcn: f64,
    pub scaling: Scaling,
    /// initial trust region is `factor*||diag .* x0||`
    pub factor: f64,
    /// log progress every `nprint` Jacobian evaluations, 0 disables
    pub nprint: usize,
}

impl Default for HybrdOptions {
    fn default() -> Self {
        Self {
            xtol: DEFAULT_XTOL,
            maxfev: None,
            ml: None,
            mu: None,
            epsfcn: 0.0,
            scaling: Scaling::Internal,
            factor: 100.0,
            nprint: 0,
        }
    }
}

impl HybrdOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_xtol(mut self, xtol: f64) -> Self {
        self.xtol = xtol;
        self
    }

    pub fn with_maxfev(mut self, maxfev: usize) -> Self {
        self.maxfev = Some(maxfev);
        self
    }

    pub fn with_band(mut self, ml: usize, mu: usize) -> Self {
        self.ml = Some(ml);
        self.mu = Some(mu);
        self
    }

    pub fn with_epsfcn(mut self, epsfcn: f64) -> Self {
        self.epsfcn = epsfcn;
        self
    }

    pub fn with_scaling(mut self, scaling: Scaling) -> Self {
        self.scaling = scaling;
        self
    }

    /// shortcut for `Scaling::Supplied(diag)`
    pub fn with_diag(self, diag: DVector<f64>) -> Self {
        self.with_scaling(Scaling::Supplied(diag))
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_nprint(mut self, nprint: usize) -> Self {
        self.nprint = nprint;
        self
    }

    /// evaluation limit for a system of size `n`
    pub fn maxfev_for(&self, n: usize) -> usize {
        self.maxfev.unwrap_or(200 * (n + 1))
    }

    /// `(ml, mu)` for a system of size `n`; a missing width means the full `n - 1`
    pub fn band_for(&self, n: usize) -> (usize, usize) {
        let full = n.saturating_sub(1);
        (self.ml.unwrap_or(full), self.mu.unwrap_or(full))
    }

    /// Check the options against a system with `n` unknowns.
    pub fn validate(&self, n: usize) -> Result<(), HybrdError> {
        if n == 0 {
            return Err(HybrdError::EmptySystem);
        }
        if !(self.xtol >= 0.0) {
            return Err(HybrdError::NegativeXtol(self.xtol));
        }
        if self.maxfev == Some(0) {
            return Err(HybrdError::NonPositiveMaxfev);
        }
        if !(self.factor > 0.0) {
            return Err(HybrdError::NonPositiveFactor(self.factor));
        }
        if !(self.epsfcn >= 0.0) {
            return Err(HybrdError::NegativeEpsfcn(self.epsfcn));
        }
        if let Scaling::Supplied(diag) = &self.scaling {
            if diag.len() != n {
                return Err(HybrdError::DimensionMismatch {
                    what: "diag",
                    expected: n,
                    found: diag.len(),
                });
            }
            if let Some((index, &value)) = diag.iter().enumerate().find(|(_, d)| !(**d > 0.0)) {
                return Err(HybrdError::NonPositiveDiag { index, value });
            }
        }
        Ok(())
    }

    /// Build options from a string-keyed parameter map.
    ///
    /// Recognized keys: `xtol`, `maxfev`, `ml`, `mu`, `epsfcn`, `factor`, `nprint`. Missing keys keep
    /// their defaults; a negative `nprint` disables progress logging.
    pub fn from_parameters(parameters: &HashMap<String, f64>) -> Result<Self, HybrdError> {
        let mut options = Self::default();
        for (key, &value) in parameters.iter() {
            match key.as_str() {
                "xtol" => options.xtol = value,
                "maxfev" => {
                    if !(value >= 1.0) {
                        return Err(HybrdError::NonPositiveMaxfev);
                    }
                    options.maxfev = Some(value as usize);
                }
                "ml" | "mu" => {
                    if !(value >= 0.0) {
                        return Err(HybrdError::NegativeBandwidth {
                            name: key.clone(),
                            value,
                        });
                    }
                    if key == "ml" {
                        options.ml = Some(value as usize);
                    } else {
                        options.mu = Some(value as usize);
                    }
                }
                "epsfcn" => options.epsfcn = value,
                "factor" => options.factor = value,
                "nprint" => options.nprint = if value > 0.0 { value as usize } else { 0 },
                _ => return Err(HybrdError::UnknownParameter(key.clone())),
            }
        }
        Ok(options)
    }
}

////////////////////////////////////////////REPORT/////////////////////////////////////////////
/// Termination reason of [`hybrd`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum HybrdInfo {
    InvalidInput,
    Converged,
    EvaluationLimitExceeded,
    ToleranceTooSmall,
    /// no progress over the last five Jacobian evaluations
    NoProgressJacobian,
    /// no progress over the last ten iterations
    NoProgressIterations,
}

impl HybrdInfo {
    /// MINPACK `info` code
    pub fn code(&self) -> i32 {
        match self {
            HybrdInfo::InvalidInput => 0,
            HybrdInfo::Converged => 1,
            HybrdInfo::EvaluationLimitExceeded => 2,
            HybrdInfo::ToleranceTooSmall => 3,
            HybrdInfo::NoProgressJacobian => 4,
            HybrdInfo::NoProgressIterations => 5,
        }
    }
}

/// Everything [`hybrd`] leaves behind besides `x` and `fvec`.
#[derive(Debug, Clone, PartialEq)]
pub struct HybrdReport {
    pub info: HybrdInfo,
    /// residual evaluations, including the Jacobian columns
    pub nfev: usize,
    /// finite-difference Jacobians computed
    pub njev: usize,
    /// accepted steps
    pub iterations: usize,
    pub fnorm: f64,
    /// orthogonal `Q` of the final (updated) factorization
    pub fjac: DMatrix<f64>,
    /// upper triangular `R` packed by rows
    pub r: DVector<f64>,
    /// `Qᵗ*fvec`
    pub qtf: DVector<f64>,
    pub diag: DVector<f64>,
}

impl HybrdReport {
    fn invalid_input() -> Self {
        Self {
            info: HybrdInfo::InvalidInput,
            nfev: 0,
            njev: 0,
            iterations: 0,
            fnorm: 0.0,
            fjac: DMatrix::zeros(0, 0),
            r: DVector::zeros(0),
            qtf: DVector::zeros(0),
            diag: DVector::zeros(0),
        }
    }

    pub fn converged(&self) -> bool {
        self.info == HybrdInfo::Converged
    }
}

//////////////////////////////////////////MAIN LOOP////////////////////////////////////////////
fn log_progress(iteration: usize, nfev: usize, fnorm: f64, delta: f64, x: &DVector<f64>) {
    info!(
        "iteration {}, nfev = {}, ||f|| = {:e}, delta = {:e}",
        iteration, nfev, fnorm, delta
    );
    debug!("x = {:?}", x.as_slice());
}

/// The hybrid iteration; `jacobian` fills `fjac` at `x` and returns the evaluations it spent.
fn hybrd_loop<R, J>(
    fcn: &R,
    x: &mut DVector<f64>,
    fvec: &mut DVector<f64>,
    options: &HybrdOptions,
    jacobian: J,
) -> HybrdReport
where
    R: ResidualFunction + ?Sized,
    J: Fn(&R, &mut DVector<f64>, &DVector<f64>, &mut DMatrix<f64>, usize, usize, f64) -> usize,
{
    let n = x.len();
    let checked = options.validate(n).and_then(|_| {
        if fvec.len() == n {
            Ok(())
        } else {
            Err(HybrdError::DimensionMismatch {
                what: "fvec",
                expected: n,
                found: fvec.len(),
            })
        }
    });
    if let Err(e) = checked {
        error!("hybrd ({}): {}", fcn.name(), e);
        return HybrdReport::invalid_input();
    }

    let epsmch = epsmch::<f64>();
    let (ml, mu) = options.band_for(n);
    let maxfev = options.maxfev_for(n);
    let internal_scaling = options.scaling == Scaling::Internal;
    let mut diag = match &options.scaling {
        Scaling::Internal => DVector::from_element(n, 1.0),
        Scaling::Supplied(d) => d.clone(),
    };
    debug!(
        "hybrd ({}): n = {}, ml = {}, mu = {}, {} residual evaluations per Jacobian, maxfev = {}",
        fcn.name(),
        n,
        ml,
        mu,
        jacobian_cost(n, ml, mu),
        maxfev
    );

    // evaluate the function at the starting point
    fvec.copy_from(&fcn.residual(x));
    let mut nfev = 1;
    let mut njev = 0;
    let mut fnorm = enorm(&*fvec);

    let mut fjac = DMatrix::<f64>::zeros(n, n);
    let mut r: DVector<f64>;
    let mut qtf = DVector::<f64>::zeros(n);
    let mut wa1 = DVector::<f64>::zeros(n);
    let mut wa2 = DVector::<f64>::zeros(n);
    let mut wa3 = DVector::<f64>::zeros(n);

    let mut iter = 1;
    let mut ncsuc = 0;
    let mut ncfail = 0;
    let mut nslow1 = 0;
    let mut nslow2 = 0;
    let mut delta = 0.0;
    let mut xnorm = 0.0;

    let info = 'outer: loop {
        let mut jeval = true;

        // calculate the jacobian matrix
        nfev += jacobian(fcn, x, &*fvec, &mut fjac, ml, mu, options.epsfcn);
        njev += 1;

        // compute the qr factorization of the jacobian
        let qr = qrfac(&mut fjac, false);

        // on the first iteration scale according to the column norms and set the trust region
        if iter == 1 {
            if internal_scaling {
                for j in 0..n {
                    diag[j] = if qr.acnorm[j] == 0.0 { 1.0 } else { qr.acnorm[j] };
                }
            }
            xnorm = scaled_enorm(&diag, x);
            delta = options.factor * xnorm;
            if delta == 0.0 {
                delta = options.factor;
            }
        }

        // form (q transpose)*fvec and store in qtf
        qtf.copy_from(&*fvec);
        apply_qt(&fjac, &mut qtf);

        let sing;
        (r, sing) = pack_upper_triangle(&fjac, &qr.rdiag);
        if sing {
            debug!("singular R after Jacobian evaluation {}", njev);
        }
        qform(&mut fjac, n);

        if internal_scaling {
            for j in 0..n {
                diag[j] = diag[j].max(qr.acnorm[j]);
            }
        }

        if options.nprint > 0 && (njev - 1) % options.nprint == 0 {
            log_progress(iter, nfev, fnorm, delta, x);
        }

        // inner loop: steps with the rank-one updated model
        loop {
            // the dogleg direction, negated into the step p
            let p = -dogleg(&r, &diag, &qtf, delta);
            let x_trial = &*x + &p;
            let pnorm = scaled_enorm(&diag, &p);

            // on the first iteration adjust the initial step bound
            if iter == 1 {
                delta = delta.min(pnorm);
            }

            let f_trial = fcn.residual(&x_trial);
            nfev += 1;
            let fnorm1 = enorm(&f_trial);

            // scaled actual reduction
            let actred = if fnorm1 < fnorm {
                1.0 - (fnorm1 / fnorm).powi(2)
            } else {
                -1.0
            };

            // predicted residual of the linear model: qtf + R*p
            let mut l = 0;
            for i in 0..n {
                let mut sum = 0.0;
                for j in i..n {
                    sum += r[l] * p[j];
                    l += 1;
                }
                wa3[i] = qtf[i] + sum;
            }
            let temp = enorm(&wa3);
            let prered = if temp < fnorm {
                1.0 - (temp / fnorm).powi(2)
            } else {
                0.0
            };
            let ratio = if prered > 0.0 { actred / prered } else { 0.0 };

            // update the step bound
            if ratio < 0.1 {
                ncsuc = 0;
                ncfail += 1;
                delta *= 0.5;
            } else {
                ncfail = 0;
                ncsuc += 1;
                if ratio >= 0.5 || ncsuc > 1 {
                    delta = delta.max(pnorm / 0.5);
                }
                if (ratio - 1.0).abs() <= 0.1 {
                    delta = pnorm / 0.5;
                }
            }

            // successful iteration: update x, fvec and their norms
            if ratio >= 1e-4 {
                x.copy_from(&x_trial);
                fvec.copy_from(&f_trial);
                xnorm = scaled_enorm(&diag, x);
                fnorm = fnorm1;
                iter += 1;
            }

            // progress counters
            nslow1 += 1;
            if actred >= 0.001 {
                nslow1 = 0;
            }
            if jeval {
                nslow2 += 1;
            }
            if actred >= 0.1 {
                nslow2 = 0;
            }

            // convergence; among the failure tests the later ones take precedence
            if delta <= options.xtol * xnorm || fnorm == 0.0 {
                break 'outer HybrdInfo::Converged;
            }
            let failure = if nslow1 == 10 {
                Some(HybrdInfo::NoProgressIterations)
            } else if nslow2 == 5 {
                Some(HybrdInfo::NoProgressJacobian)
            } else if 0.1 * (0.1 * delta).max(pnorm) <= epsmch * xnorm {
                Some(HybrdInfo::ToleranceTooSmall)
            } else if nfev >= maxfev {
                Some(HybrdInfo::EvaluationLimitExceeded)
            } else {
                None
            };
            if let Some(info) = failure {
                break 'outer info;
            }

            // two failed steps in a row: recalculate the jacobian
            if ncfail == 2 {
                debug!("two consecutive failures, refreshing the Jacobian");
                continue 'outer;
            }

            // broyden rank-one update of the factorization
            let qtf_new = fjac.tr_mul(&f_trial);
            for j in 0..n {
                wa2[j] = (qtf_new[j] - wa3[j]) / pnorm;
                wa1[j] = diag[j] * ((diag[j] * p[j]) / pnorm);
                if ratio >= 1e-4 {
                    qtf[j] = qtf_new[j];
                }
            }
            let sing = r1updt(n, n, &mut r, &wa1, &mut wa2, &mut wa3);
            if sing {
                debug!("singular R after rank-one update");
            }
            r1mpyq(fjac.view_mut((0, 0), (n, n)), &wa2, &wa3);
            r1mpyq_vector(&mut qtf, &wa2, &wa3);

            jeval = false;
        }
    };

    if options.nprint > 0 {
        log_progress(iter, nfev, fnorm, delta, x);
    }
    info!(
        "hybrd ({}) finished: {} after {} residual evaluations, ||f|| = {:e}",
        fcn.name(),
        info,
        nfev,
        fnorm
    );

    HybrdReport {
        info,
        nfev,
        njev,
        iterations: iter - 1,
        fnorm,
        fjac,
        r,
        qtf,
        diag,
    }
}

/// Find a zero of `fcn` near `x` with Powell's hybrid method.
///
/// On return `x` holds the final estimate and `fvec` the residual there. Invalid options or a
/// `fvec` of the wrong length give `HybrdInfo::InvalidInput` without a single residual evaluation,
/// leaving both buffers untouched.
pub fn hybrd<R: ResidualFunction + ?Sized>(
    fcn: &R,
    x: &mut DVector<f64>,
    fvec: &mut DVector<f64>,
    options: &HybrdOptions,
) -> HybrdReport {
    hybrd_loop(fcn, x, fvec, options, fdjac1::<R>)
}

/// [`hybrd`] with the finite-difference Jacobian evaluated on the rayon thread pool
pub fn hybrd_parallel<R: ResidualFunction + Sync + ?Sized>(
    fcn: &R,
    x: &mut DVector<f64>,
    fvec: &mut DVector<f64>,
    options: &HybrdOptions,
) -> HybrdReport {
    hybrd_loop(fcn, x, fvec, options, |f, x, fvec, fjac, ml, mu, epsfcn| {
        fdjac1_parallel(f, x, fvec, fjac, ml, mu, epsfcn)
    })
}

/// Backward Euler step: solve for `ym` with `ym - yo - (tm - to)*dydt(tm, ym) = 0`
pub fn hybrd_be<F>(
    dydt: F,
    to: f64,
    yo: &DVector<f64>,
    tm: f64,
    ym: &mut DVector<f64>,
    fvec: &mut DVector<f64>,
    options: &HybrdOptions,
) -> HybrdReport
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    let residual = BackwardEulerResidual::new(dydt, to, yo.clone(), tm);
    hybrd(&residual, ym, fvec, options)
}

/// Trapezoidal step: solve for `yn`
pub fn hybrd_tr<F>(
    dydt: F,
    to: f64,
    yo: &DVector<f64>,
    tn: f64,
    yn: &mut DVector<f64>,
    fvec: &mut DVector<f64>,
    options: &HybrdOptions,
) -> HybrdReport
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    let residual = TrapezoidalResidual::new(dydt, to, yo.clone(), tn);
    hybrd(&residual, yn, fvec, options)
}

/// Variable-step BDF2 step: solve for `y3`
#[allow(clippy::too_many_arguments)]
pub fn hybrd_bdf2<F>(
    dydt: F,
    t1: f64,
    y1: &DVector<f64>,
    t2: f64,
    y2: &DVector<f64>,
    t3: f64,
    y3: &mut DVector<f64>,
    fvec: &mut DVector<f64>,
    options: &HybrdOptions,
) -> HybrdReport
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    let residual = Bdf2Residual::new(dydt, t1, y1.clone(), t2, y2.clone(), t3);
    hybrd(&residual, y3, fvec, options)
}
