//! ELF loading into traced processes
//!
//! - [`mapper`] - maps, relocates and protects an image inside the target
//! - [`args`] - environment, cwd, name, stdio, heap and argv[0] setters
//! - [`payload`] - the argument block passed to a payload's entry point
//! - [`exec`] - register patching and release of the prepared process

pub mod args;
pub mod exec;
pub mod mapper;
pub mod payload;

pub use exec::{exec, prepare};
pub use mapper::{load, load_bytes, segment_protection, LoadedImage};
pub use payload::PayloadArgs;
