use chrono::Local;
use log::{LevelFilter, info};
use simplelog::{
    ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};
use std::fs::File;
use std::time::Duration;
use tabled::{builder::Builder, settings::Style};

/// map "debug", "info", "warn", "error", "off"/"none" to a level filter
pub fn level_from_str(level: &str) -> Option<LevelFilter> {
    match level.to_lowercase().as_str() {
        "debug" => Some(LevelFilter::Debug),
        "info" => Some(LevelFilter::Info),
        "warn" => Some(LevelFilter::Warn),
        "error" => Some(LevelFilter::Error),
        "off" | "none" => Some(LevelFilter::Off),
        _ => None,
    }
}

/// `hybrd_log_<date>_<time>.txt`
pub fn default_log_name() -> String {
    let date_and_time = Local::now().format("%Y-%m-%d_%H-%M-%S");
    format!("hybrd_log_{}.txt", date_and_time)
}

/// Terminal logger plus an optional file logger, combined.
///
/// Returns `false` if logging is off or a global logger is already installed; the latter is normal
/// when several solves run in one process.
pub fn init_logger(level: LevelFilter, log_file: Option<&str>) -> bool {
    if level == LevelFilter::Off {
        return false;
    }
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(filename) = log_file {
        if let Ok(file) = File::create(filename) {
            loggers.push(WriteLogger::new(level, Config::default(), file));
        }
    }
    CombinedLogger::init(loggers).is_ok()
}

/// log the elapsed time in convenient units and return `(units, value)`
pub fn elapsed_time(elapsed: Duration) -> (String, f64) {
    let time = elapsed.as_millis();
    if time < 1000 {
        info!("Elapsed {} ms", time);
        (" ms".to_string(), time as f64)
    } else if time < 60_000 {
        info!("Elapsed {} s", elapsed.as_secs());
        (" s".to_string(), elapsed.as_secs_f64())
    } else if time < 3_600_000 {
        info!("Elapsed {} min", elapsed.as_secs() / 60);
        (" min".to_string(), elapsed.as_secs_f64() / 60.0)
    } else {
        info!("Elapsed {} h", elapsed.as_secs() / 3600);
        (" h".to_string(), elapsed.as_secs_f64() / 3600.0)
    }
}

/// two-column table of (name, value) rows
pub fn statistics_table(rows: &[(&str, String)]) -> String {
    let mut builder = Builder::default();
    builder.push_record(["statistic".to_string(), "value".to_string()]);
    for (name, value) in rows {
        builder.push_record([name.to_string(), value.clone()]);
    }
    let mut table = builder.build();
    table.with(Style::modern_rounded());
    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_str() {
        assert_eq!(level_from_str("debug"), Some(LevelFilter::Debug));
        assert_eq!(level_from_str("WARN"), Some(LevelFilter::Warn));
        assert_eq!(level_from_str("none"), Some(LevelFilter::Off));
        assert_eq!(level_from_str("verbose"), None);
    }

    #[test]
    fn test_elapsed_time_units() {
        assert_eq!(elapsed_time(Duration::from_millis(250)), (" ms".to_string(), 250.0));
        assert_eq!(elapsed_time(Duration::from_secs(2)), (" s".to_string(), 2.0));
        assert_eq!(elapsed_time(Duration::from_secs(120)), (" min".to_string(), 2.0));
        assert_eq!(elapsed_time(Duration::from_secs(7200)), (" h".to_string(), 2.0));
    }

    #[test]
    fn test_statistics_table_contains_rows() {
        let table = statistics_table(&[("nfev", "12".to_string()), ("status", "Converged".to_string())]);
        assert!(table.contains("nfev"));
        assert!(table.contains("Converged"));
    }

    #[test]
    fn test_logging_off_does_not_install() {
        assert!(!init_logger(LevelFilter::Off, None));
    }

    #[test]
    fn test_default_log_name() {
        let name = default_log_name();
        assert!(name.starts_with("hybrd_log_"));
        assert!(name.ends_with(".txt"));
    }
}
