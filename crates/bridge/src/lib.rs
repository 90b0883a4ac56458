//! Remote-call bridge
//!
//! Makes a stopped, traced process execute calls on our behalf. Built on
//! three seams:
//!
//! - [`Tracer`] - raw tracing requests (attach, step, registers, memory)
//! - [`Kernel`] - privileged services outside the tracing facility
//! - [`Resolver`] - symbol lookup inside the target
//!
//! [`TracedProcess`] layers staged function calls and syscalls, remote
//! errno, scratch memory and one-shot breakpoints on top.

pub mod breakpoint;
pub mod call;
pub mod kernel;
pub mod process;
pub mod registers;
pub mod resolver;
pub mod syscalls;
pub mod tracer;

#[cfg(all(target_os = "freebsd", target_arch = "x86_64"))]
pub mod native;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use breakpoint::{BreakpointPatch, INT3};
pub use kernel::{Capabilities, Credentials, Kernel};
pub use process::{Bridge, Disposition, TracedProcess};
pub use registers::Registers;
pub use resolver::{nid, DynlibResolver, Resolver, SymbolTable};
pub use tracer::{LwpInfo, StopReason, Tracer};
