//! Process hosts for hbldr
//!
//! A host is a traced process stopped just before its main() call, ready
//! to have a payload loaded over it:
//!
//! - [`acquire`] - spawn a helper or capture a launched application
//! - [`checkpoint`] - run a fresh host up to main()
//! - [`decoy`] - the stand-in title used to get a launch
//! - [`engine`] - the launch operations offered to front ends
//! - [`state`] - launch progress and its legal transitions
//! - [`cmdline`] - argument string splitting
//! - [`platform`] - system services outside the tracing facility

pub mod acquire;
pub mod checkpoint;
pub mod cmdline;
pub mod decoy;
pub mod engine;
pub mod platform;
pub mod state;

#[cfg(all(target_os = "freebsd", target_arch = "x86_64"))]
pub mod native;

#[cfg(test)]
mod testing;

pub use cmdline::split_args;
pub use engine::{run_engine, Engine, LaunchRequest};
pub use platform::Platform;
pub use state::{Launch, LaunchState};
