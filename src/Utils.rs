//! different utility modules used throughout the project
/// logger setup, timing and statistics tables for solver runs
pub mod logger;
