/// nonlinear system solvers
pub mod Nonlinear_systems;
