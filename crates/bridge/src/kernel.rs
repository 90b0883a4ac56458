//! Kernel-side services
//!
//! Operations the loader needs that the tracing facility cannot express:
//! loader symbol lookup inside a target, privileged page protection,
//! credential changes, and access to kernel objects. On the console these
//! are backed by a kernel read/write primitive.

use std::io;

use hbldr_common::Pid;

/// Capability bitmap of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities(pub [u8; 16]);

impl Capabilities {
    pub const ALL: Capabilities = Capabilities([0xff; 16]);
}

/// Identity of the loader's own process, saved while it is elevated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub authid: u64,
    pub caps: Capabilities,
}

/// Authority id that grants use of the tracing facility on any process.
pub const DEBUGGER_AUTHID: u64 = 0x4800_0000_0001_0003;

pub trait Kernel: Sync {
    /// Look up `nid` in the library loaded under `handle` in `pid`.
    fn dynlib_resolve(&self, pid: Pid, handle: u32, nid: &str) -> Option<u64>;

    /// Entry address of the module loaded under `handle` in `pid`.
    fn dynlib_entry_addr(&self, pid: Pid, handle: u32) -> Option<u64>;

    /// Change protection of a range in `pid`, bypassing the process's own rules.
    fn mprotect(&self, pid: Pid, addr: u64, len: u64, prot: i32) -> io::Result<()>;

    /// Raise the loader's own authid and capabilities, returning the old ones.
    fn elevate_self(&self) -> io::Result<Credentials>;

    fn restore_self(&self, saved: Credentials) -> io::Result<()>;

    /// Give `pid` full capabilities, returning its previous set.
    fn raise_capabilities(&self, pid: Pid) -> io::Result<Capabilities>;

    fn restore_capabilities(&self, pid: Pid, saved: Capabilities) -> io::Result<()>;

    /// Root the process: root directory, no jail, uid 0, all capabilities.
    fn raise_privileges(&self, pid: Pid) -> io::Result<()>;

    /// Make the pair of sockets in `pid` share kernel option storage, the
    /// basis of the payload's kernel read/write primitive.
    fn overlap_sockets(&self, pid: Pid, master: i32, victim: i32) -> io::Result<()>;

    /// Kernel address of the file object behind `fd` in `pid`.
    fn file_address(&self, pid: Pid, fd: i32) -> Option<u64>;

    /// Base address of the kernel data segment.
    fn data_base(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_capabilities() {
        assert!(Capabilities::ALL.0.iter().all(|b| *b == 0xff));
        assert_ne!(Capabilities([0; 16]), Capabilities::ALL);
    }
}
