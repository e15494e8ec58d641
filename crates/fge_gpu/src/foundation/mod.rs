//! Foundation module - Core utilities shared by the GPU core
//!
//! - Logging utilities

pub mod logging;
