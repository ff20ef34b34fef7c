//! Pluggable services the pipeline calls out to.
//!
//! Each one sits behind a trait so tests and alternative backends can stand in.

pub mod classifier;
pub mod resolver;
pub mod sink;
