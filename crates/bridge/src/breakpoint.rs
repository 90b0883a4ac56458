//! One-shot software breakpoints.

use std::io;

use hbldr_common::{log_detail, trunc_page, Error, Result, PAGE_SIZE};

use crate::process::TracedProcess;
use crate::syscalls::PROT_RWX;

/// `int3`
pub const INT3: u8 = 0xcc;

/// An installed trap byte and the byte it replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointPatch {
    pub address: u64,
    pub original_byte: u8,
}

impl TracedProcess<'_> {
    pub fn breakpoint(&self) -> Option<BreakpointPatch> {
        self.breakpoint
    }

    /// Patch a trap at `addr`. Code pages are not writable through the
    /// tracing facility, so the page is first made RWX by the kernel.
    pub fn insert_breakpoint(&mut self, addr: u64) -> Result<BreakpointPatch> {
        let pid = self.pid();
        if let Some(existing) = self.breakpoint {
            return Err(Error::trace(
                pid,
                "insert breakpoint",
                io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("breakpoint already set at {:#x}", existing.address),
                ),
            ));
        }

        self.bridge()
            .kernel()
            .mprotect(pid, trunc_page(addr), PAGE_SIZE, PROT_RWX)
            .map_err(|e| Error::Mapping {
                pid,
                op: "kernel mprotect",
                errno: e.raw_os_error().unwrap_or(libc::EPERM),
            })?;

        let mut original = [0u8; 1];
        self.read_into(addr, &mut original)?;
        self.write_bytes(addr, &[INT3])?;

        let patch = BreakpointPatch { address: addr, original_byte: original[0] };
        self.breakpoint = Some(patch);
        log_detail!(self.log, "pid {}: breakpoint at {:#x} (was {:#04x})", pid, addr, original[0]);
        Ok(patch)
    }

    /// Put the original byte back.
    pub fn remove_breakpoint(&mut self) -> Result<Option<BreakpointPatch>> {
        let Some(patch) = self.breakpoint else {
            return Ok(None);
        };
        self.write_bytes(patch.address, &[patch.original_byte])?;
        self.breakpoint = None;
        Ok(Some(patch))
    }

    /// Resume until the installed breakpoint traps, then restore the byte and
    /// rewind the instruction pointer onto it.
    pub fn run_to_breakpoint(&mut self, signal: i32) -> Result<()> {
        let pid = self.pid();
        let Some(patch) = self.breakpoint else {
            return Err(Error::trace(
                pid,
                "run to breakpoint",
                io::Error::new(io::ErrorKind::NotFound, "no breakpoint installed"),
            ));
        };

        self.cont(signal)?;
        let sig = self.wait_stop("run to breakpoint")?;
        self.remove_breakpoint()?;

        let mut regs = self.get_registers()?;
        if regs.rip != patch.address + 1 {
            return Err(Error::trace(
                pid,
                "run to breakpoint",
                io::Error::new(
                    io::ErrorKind::Other,
                    format!("stopped by signal {sig} at {:#x}, not at the breakpoint", regs.rip),
                ),
            ));
        }
        regs.rip = patch.address;
        self.set_registers(&regs)?;
        log_detail!(self.log, "pid {}: reached {:#x}", pid, patch.address);
        Ok(())
    }
}
