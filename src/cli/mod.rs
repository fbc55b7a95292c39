//! Command-line front end
//!
//! Drives a [`crate::Session`] and a [`crate::BatchScheduler`] over local
//! files, directories and remote URLs.

mod config;
#[path = "main.rs"]
mod main_impl;

pub use main_impl::{main, Cli, CliBackend, CliMaskConvention, CliOutputFormat};
