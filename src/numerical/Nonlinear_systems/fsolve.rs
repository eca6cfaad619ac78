//! Simple entry points around [`hybrd`] with fixed settings, and a configurable front-end with
//! logging and run statistics.
use super::hybrd::{
    HybrdError, HybrdInfo, HybrdOptions, HybrdReport, Scaling, hybrd, hybrd_parallel,
};
use super::residuals::{
    Bdf2Residual, BackwardEulerResidual, PlainResidual, ResidualFunction, TrapezoidalResidual,
};
use crate::Utils::logger::{default_log_name, elapsed_time, init_logger, level_from_str, statistics_table};
use log::{LevelFilter, info, warn};
use nalgebra::DVector;
use std::time::Instant;
use strum_macros::{Display, EnumIter};

/// Outcome of the `fsolve*` functions. Both stagnation tests of [`hybrd`] report as
/// `NotMakingProgress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum SolveStatus {
    InvalidInput,
    Converged,
    EvaluationLimitExceeded,
    ToleranceTooSmall,
    NotMakingProgress,
}

impl SolveStatus {
    pub fn code(&self) -> i32 {
        match self {
            SolveStatus::InvalidInput => 0,
            SolveStatus::Converged => 1,
            SolveStatus::EvaluationLimitExceeded => 2,
            SolveStatus::ToleranceTooSmall => 3,
            SolveStatus::NotMakingProgress => 4,
        }
    }
}

impl From<HybrdInfo> for SolveStatus {
    fn from(info: HybrdInfo) -> Self {
        match info {
            HybrdInfo::InvalidInput => SolveStatus::InvalidInput,
            HybrdInfo::Converged => SolveStatus::Converged,
            HybrdInfo::EvaluationLimitExceeded => SolveStatus::EvaluationLimitExceeded,
            HybrdInfo::ToleranceTooSmall => SolveStatus::ToleranceTooSmall,
            HybrdInfo::NoProgressJacobian | HybrdInfo::NoProgressIterations => {
                SolveStatus::NotMakingProgress
            }
        }
    }
}

/// The settings of the `fsolve*` functions for `n` unknowns: dense Jacobian, `maxfev = 200*(n+1)`,
/// internal scaling, `factor = 100`.
pub fn fsolve_options(n: usize, tol: f64) -> HybrdOptions {
    let full = n.saturating_sub(1);
    HybrdOptions::default()
        .with_xtol(tol)
        .with_maxfev(200 * (n + 1))
        .with_band(full, full)
        .with_epsfcn(0.0)
        .with_scaling(Scaling::Internal)
        .with_factor(100.0)
}

fn run<R: ResidualFunction + ?Sized>(
    fcn: &R,
    x: &mut DVector<f64>,
    fvec: &mut DVector<f64>,
    tol: f64,
) -> SolveStatus {
    let options = fsolve_options(x.len(), tol);
    SolveStatus::from(hybrd(fcn, x, fvec, &options).info)
}

/// Solve `fcn(x) = 0` starting from `x`.
///
/// `tol` is the relative tolerance on `x`; on return `fvec` holds `fcn(x)`.
///  Example
/// ```
/// use RustedHybrd::numerical::Nonlinear_systems::fsolve::{fsolve, SolveStatus};
/// use nalgebra::DVector;
/// let mut x = DVector::from_vec(vec![1.0]);
/// let mut fvec = DVector::zeros(1);
/// let status = fsolve(|x: &DVector<f64>| x.map(|v| v * v - 2.0), &mut x, &mut fvec, 1e-10);
/// assert_eq!(status, SolveStatus::Converged);
/// assert!((x[0] - 2.0f64.sqrt()).abs() < 1e-8);
/// ```
pub fn fsolve<F>(fcn: F, x: &mut DVector<f64>, fvec: &mut DVector<f64>, tol: f64) -> SolveStatus
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    run(&PlainResidual::new(fcn), x, fvec, tol)
}

/// Backward Euler step for `y' = dydt(t, y)` from `(to, yo)` to `tm`; `ym` holds the initial guess
/// and receives the new state.
pub fn fsolve_be<F>(
    dydt: F,
    to: f64,
    yo: &DVector<f64>,
    tm: f64,
    ym: &mut DVector<f64>,
    fvec: &mut DVector<f64>,
    tol: f64,
) -> SolveStatus
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    run(&BackwardEulerResidual::new(dydt, to, yo.clone(), tm), ym, fvec, tol)
}

/// Trapezoidal step from `(to, yo)` to `tn`, the new state goes to `yn`
pub fn fsolve_tr<F>(
    dydt: F,
    to: f64,
    yo: &DVector<f64>,
    tn: f64,
    yn: &mut DVector<f64>,
    fvec: &mut DVector<f64>,
    tol: f64,
) -> SolveStatus
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    run(&TrapezoidalResidual::new(dydt, to, yo.clone(), tn), yn, fvec, tol)
}

/// Variable-step BDF2 step from `(t1, y1)`, `(t2, y2)` to `t3`, the new state goes to `y3`
#[allow(clippy::too_many_arguments)]
pub fn fsolve_bdf2<F>(
    dydt: F,
    t1: f64,
    y1: &DVector<f64>,
    t2: f64,
    y2: &DVector<f64>,
    t3: f64,
    y3: &mut DVector<f64>,
    fvec: &mut DVector<f64>,
    tol: f64,
) -> SolveStatus
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    let residual = Bdf2Residual::new(dydt, t1, y1.clone(), t2, y2.clone(), t3);
    run(&residual, y3, fvec, tol)
}

/////////////////////////////////////////////////////////////////////////////////////////////
//                         CONFIGURABLE FRONT-END
/////////////////////////////////////////////////////////////////////////////////////////////
/// Hybrid solver with full options, logging and statistics
///  Example
/// ```
/// use RustedHybrd::numerical::Nonlinear_systems::fsolve::{HybrdSolver, SolveStatus};
/// use RustedHybrd::numerical::Nonlinear_systems::hybrd::HybrdOptions;
/// use RustedHybrd::numerical::Nonlinear_systems::residuals::PlainResidual;
/// use nalgebra::DVector;
/// let residual = PlainResidual::new(|v: &DVector<f64>| {
///     DVector::from_vec(vec![2.0 * v[0] - v[1] - 1.0, -v[0] + 2.0 * v[1] - 1.0])
/// });
/// let mut solver = HybrdSolver::new()
///     .with_options(HybrdOptions::default().with_xtol(1e-12))
///     .with_loglevel("off");
/// let mut x = DVector::from_vec(vec![0.0, 0.0]);
/// let mut fvec = DVector::zeros(2);
/// let status = solver.solve(&residual, &mut x, &mut fvec);
/// assert_eq!(status, SolveStatus::Converged);
/// assert!((x[0] - 1.0).abs() < 1e-10 && (x[1] - 1.0).abs() < 1e-10);
/// ```
#[derive(Debug, Clone)]
pub struct HybrdSolver {
    pub options: HybrdOptions,
    /// "debug", "info", "warn", "error", "off"/"none"; `None` means "info"
    pub loglevel: Option<String>,
    pub log_file: Option<String>,
    pub parallel: bool,
    report: Option<HybrdReport>,
}

impl Default for HybrdSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl HybrdSolver {
    pub fn new() -> Self {
        HybrdSolver {
            options: HybrdOptions::default(),
            loglevel: None,
            log_file: None,
            parallel: false,
            report: None,
        }
    }

    pub fn with_options(mut self, options: HybrdOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_loglevel(mut self, level: &str) -> Self {
        self.loglevel = Some(level.to_string());
        self
    }

    /// log to `filename` as well, or to a timestamped file if `None`
    pub fn log_to_file(mut self, filename: Option<String>) -> Self {
        self.log_file = Some(filename.unwrap_or_else(default_log_name));
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Check the log level string; unknown names are rejected.
    pub fn set_loglevel(&mut self, level: &str) -> Result<(), HybrdError> {
        if level_from_str(level).is_none() {
            return Err(HybrdError::UnknownParameter(level.to_string()));
        }
        self.loglevel = Some(level.to_string());
        Ok(())
    }

    fn level(&self) -> LevelFilter {
        self.loglevel
            .as_deref()
            .and_then(level_from_str)
            .unwrap_or(LevelFilter::Info)
    }

    /// Set up logging, run the serial solver and log the run statistics.
    ///
    /// The residual need not be `Sync`; a parallel Jacobian requires
    /// [`solve_parallel`](Self::solve_parallel).
    pub fn solve<R: ResidualFunction + ?Sized>(
        &mut self,
        fcn: &R,
        x: &mut DVector<f64>,
        fvec: &mut DVector<f64>,
    ) -> SolveStatus {
        self.start_logging();
        if self.parallel {
            warn!("parallel Jacobian needs solve_parallel, running serially");
        }
        let start = Instant::now();
        let report = hybrd(fcn, x, fvec, &self.options);
        self.finish(report, x.len(), start)
    }

    /// [`solve`](Self::solve) for a `Sync` residual; the Jacobian columns are evaluated on the
    /// rayon pool when `parallel(true)` was set.
    pub fn solve_parallel<R: ResidualFunction + Sync + ?Sized>(
        &mut self,
        fcn: &R,
        x: &mut DVector<f64>,
        fvec: &mut DVector<f64>,
    ) -> SolveStatus {
        self.start_logging();
        let start = Instant::now();
        let report = if self.parallel {
            hybrd_parallel(fcn, x, fvec, &self.options)
        } else {
            hybrd(fcn, x, fvec, &self.options)
        };
        self.finish(report, x.len(), start)
    }

    fn start_logging(&self) {
        init_logger(self.level(), self.log_file.as_deref());
        if let Some(name) = &self.loglevel {
            if level_from_str(name).is_none() {
                warn!("unknown log level {}, using info", name);
            }
        }
    }

    fn finish(&mut self, report: HybrdReport, n: usize, start: Instant) -> SolveStatus {
        let status = SolveStatus::from(report.info);
        self.calc_statistics(&report, n, status);
        elapsed_time(start.elapsed());
        self.report = Some(report);
        status
    }

    fn calc_statistics(&self, report: &HybrdReport, n: usize, status: SolveStatus) {
        let rows = [
            ("number of unknowns", n.to_string()),
            ("residual evaluations", report.nfev.to_string()),
            ("jacobian evaluations", report.njev.to_string()),
            ("accepted steps", report.iterations.to_string()),
            ("final residual norm", format!("{:e}", report.fnorm)),
            ("status", format!("{} ({})", status, report.info)),
        ];
        info!("\n \n CALC STATISTICS \n \n {}", statistics_table(&rows));
    }

    /// report of the last [`solve`](Self::solve)
    pub fn get_report(&self) -> Option<&HybrdReport> {
        self.report.as_ref()
    }
}
