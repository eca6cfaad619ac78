//! some linear algebra functions used throughout the code
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
/// overflow-safe Euclidean norm and machine constants
pub mod enorm;
/// Householder QR with optional column pivoting
pub mod qr_householder;
/// rank-one update of QR factors by Givens rotations
pub mod givens_update;
