//! Test and demo helpers for `vidbuf`: frame generation, a synthetic camera,
//! and display and transport endpoints that record what they receive.
pub mod camera;
pub mod display;
pub mod framegen;
pub mod transport;
