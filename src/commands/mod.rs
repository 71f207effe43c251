//! Command implementations for the CLI
//!
//! This module contains the implementation of all CLI commands:
//! - run: Drive a pipeline with a synthetic workload
//! - config: Configuration display and validation

pub mod config;
pub mod run;
