//! Tracing facility abstraction
//!
//! The [`Tracer`] trait is the narrow interface over the kernel's process
//! tracing requests. Everything above it (staged calls, breakpoints, image
//! mapping) is written against the trait so it can run against the native
//! backend or a simulated target.

use std::io;

use hbldr_common::Pid;

use crate::registers::Registers;

/// Reason a traced process reported to the tracer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Stopped by a signal and still alive
    Stopped(i32),
    /// Exited with status code
    Exited(i32),
    /// Killed by signal
    Signaled(i32),
}

impl StopReason {
    pub fn is_alive(&self) -> bool {
        matches!(self, StopReason::Stopped(_))
    }
}

/// Details of the most recent stop, as reported by the LWP info request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LwpInfo {
    /// The stop is the parent side of a fork
    pub forked: bool,
    /// The stop follows a successful exec
    pub exec: bool,
    /// New child when `forked` is set
    pub child_pid: Pid,
}

/// Raw tracing requests against a process.
///
/// Implementations do not elevate their own credentials; callers go through
/// [`crate::TracedProcess`], which brackets every request with an elevation.
pub trait Tracer: Sync {
    /// Attach to a running process. The process stops with a signal that the
    /// caller collects through [`Tracer::wait`].
    fn attach(&self, pid: Pid) -> io::Result<()>;

    fn detach(&self, pid: Pid, signal: i32) -> io::Result<()>;

    /// Execute one instruction. The stop is collected through [`Tracer::wait`].
    fn step(&self, pid: Pid) -> io::Result<()>;

    fn cont(&self, pid: Pid, signal: i32) -> io::Result<()>;

    /// Report forks of the process and trace the resulting children.
    fn follow_fork(&self, pid: Pid, enable: bool) -> io::Result<()>;

    /// Report lifecycle events (exec, thread birth and death) as stops.
    fn lwp_events(&self, pid: Pid, enable: bool) -> io::Result<()>;

    fn lwp_info(&self, pid: Pid) -> io::Result<LwpInfo>;

    fn get_regs(&self, pid: Pid) -> io::Result<Registers>;

    fn set_regs(&self, pid: Pid, regs: &Registers) -> io::Result<()>;

    fn read_word(&self, pid: Pid, addr: u64) -> io::Result<u64>;

    fn write_word(&self, pid: Pid, addr: u64, word: u64) -> io::Result<()>;

    /// Read `buf.len()` bytes starting at `addr`.
    fn read_memory(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < buf.len() {
            let word = self.read_word(pid, addr + offset as u64)?;
            let bytes = word.to_le_bytes();
            let copy_len = std::cmp::min(8, buf.len() - offset);
            buf[offset..offset + copy_len].copy_from_slice(&bytes[..copy_len]);
            offset += 8;
        }
        Ok(())
    }

    /// Write `data` starting at `addr`.
    fn write_memory(&self, pid: Pid, addr: u64, data: &[u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let remaining = data.len() - offset;
            let target = addr + offset as u64;

            // Partial trailing word: merge with what is already there
            let mut word_bytes = if remaining < 8 {
                self.read_word(pid, target)?.to_le_bytes()
            } else {
                [0u8; 8]
            };

            let copy_len = std::cmp::min(8, remaining);
            word_bytes[..copy_len].copy_from_slice(&data[offset..offset + copy_len]);
            self.write_word(pid, target, u64::from_le_bytes(word_bytes))?;
            offset += 8;
        }
        Ok(())
    }

    /// Block until the process reports a stop or terminates.
    fn wait(&self, pid: Pid) -> io::Result<StopReason>;

    /// Deliver SIGKILL outside the tracing facility.
    fn kill(&self, pid: Pid) -> io::Result<()>;
}
