//! Common utilities for hbldr crates.
//!
//! This crate provides shared infrastructure used across the workspace:
//!
//! - [`debug`] - Per-component logging controlled via `DEBUG` environment variable
//! - [`error`] - The error taxonomy every component reports through
//! - [`config`] - Platform constants and tunables
//! - [`page`] - Page rounding for remote mappings

pub mod config;
pub mod debug;
pub mod error;
pub mod page;

pub use config::{BridgeConfig, Config, DecoyConfig, HostConfig};
pub use debug::{create_logger, Logger};
pub use error::{ElfFormatError, Error, Pid, Result};
pub use page::{round_page, trunc_page, PAGE_SIZE};
