//! CLI module for afinar
//!
//! This module provides the command-line interface: command implementations,
//! error types, and logging setup.

pub mod commands;
pub mod error;
pub mod logging;

pub use error::{CliError, CliResult};
