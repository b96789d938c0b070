//! CLI module for the geotiler library
//!
//! This module is only available when the "cli" feature is enabled.

mod config;
#[path = "main.rs"]
mod main_impl;

pub use main_impl::{main, AreaArgs, Cli, CliAreaType, CliComposition, Command, TilingArgs};
