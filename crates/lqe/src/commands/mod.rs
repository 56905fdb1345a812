//! Command implementations for lqe CLI.
//!
//! Each submodule implements the logic for a command group.

pub mod config;
pub mod simulate;
