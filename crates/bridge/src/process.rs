//! Traced process handles
//!
//! A [`Bridge`] bundles the tracing, kernel and resolver seams. Attaching
//! through it yields a [`TracedProcess`], the exclusive handle every remote
//! operation goes through. Mutating operations take `&mut self`, so
//! operations on one pid cannot interleave.

use std::io;

use hbldr_common::{
    create_logger, log, log_detail, log_fail, BridgeConfig, Error, Logger, Pid, Result, PAGE_SIZE,
};

use crate::breakpoint::BreakpointPatch;
use crate::kernel::{Capabilities, Kernel};
use crate::registers::Registers;
use crate::resolver::Resolver;
use crate::tracer::{LwpInfo, StopReason, Tracer};

/// Fate of a target whose handle is dropped while still attached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Kill the target. A half-prepared process must never run.
    Kill,
    /// Detach without a signal.
    Release,
}

#[derive(Clone, Copy)]
pub struct Bridge<'a> {
    tracer: &'a dyn Tracer,
    kernel: &'a dyn Kernel,
    resolver: &'a dyn Resolver,
    config: &'a BridgeConfig,
}

impl<'a> Bridge<'a> {
    pub fn new(
        tracer: &'a dyn Tracer,
        kernel: &'a dyn Kernel,
        resolver: &'a dyn Resolver,
        config: &'a BridgeConfig,
    ) -> Self {
        Self { tracer, kernel, resolver, config }
    }

    pub fn tracer(&self) -> &'a dyn Tracer {
        self.tracer
    }

    pub fn kernel(&self) -> &'a dyn Kernel {
        self.kernel
    }

    pub fn resolver(&self) -> &'a dyn Resolver {
        self.resolver
    }

    pub fn config(&self) -> &'a BridgeConfig {
        self.config
    }

    /// Run one tracing request with the loader's own credentials elevated.
    ///
    /// The elevation never outlives the request.
    pub(crate) fn privileged<R>(
        &self,
        pid: Pid,
        op: &'static str,
        request: impl FnOnce(&dyn Tracer) -> io::Result<R>,
    ) -> Result<R> {
        let saved = self
            .kernel
            .elevate_self()
            .map_err(|source| Error::Privilege { pid, op, source })?;
        let result = request(self.tracer);
        let restored = self.kernel.restore_self(saved);

        let value = result.map_err(|source| Error::trace(pid, op, source))?;
        restored.map_err(|source| Error::Privilege { pid, op, source })?;
        Ok(value)
    }

    /// Attach to a running process and wait for it to stop.
    ///
    /// The handle kills the process if dropped while attached; use
    /// [`TracedProcess::set_disposition`] for processes that must survive.
    pub fn attach(&self, pid: Pid) -> Result<TracedProcess<'a>> {
        self.privileged(pid, "attach", |t| t.attach(pid))?;
        let mut process = TracedProcess::new(*self, pid);
        process.wait_stop("attach")?;
        Ok(process)
    }

    /// Take over a process that is already traced by us and stopped, such
    /// as a spawned child or the child side of a followed fork.
    pub fn adopt(&self, pid: Pid) -> TracedProcess<'a> {
        TracedProcess::new(*self, pid)
    }
}

pub struct TracedProcess<'a> {
    bridge: Bridge<'a>,
    pid: Pid,
    attached: bool,
    disposition: Disposition,
    pub(crate) breakpoint: Option<BreakpointPatch>,
    pub(crate) syscall_stub: Option<u64>,
    pub(crate) log: Logger,
}

impl std::fmt::Debug for TracedProcess<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracedProcess")
            .field("pid", &self.pid)
            .field("attached", &self.attached)
            .field("disposition", &self.disposition)
            .finish_non_exhaustive()
    }
}

impl<'a> TracedProcess<'a> {
    fn new(bridge: Bridge<'a>, pid: Pid) -> Self {
        Self {
            bridge,
            pid,
            attached: true,
            disposition: Disposition::Kill,
            breakpoint: None,
            syscall_stub: None,
            log: create_logger("bridge"),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn bridge(&self) -> &Bridge<'a> {
        &self.bridge
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    pub fn set_disposition(&mut self, disposition: Disposition) {
        self.disposition = disposition;
    }

    fn privileged<R>(
        &self,
        op: &'static str,
        request: impl FnOnce(&dyn Tracer) -> io::Result<R>,
    ) -> Result<R> {
        self.bridge.privileged(self.pid, op, request)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn detach_inner(&mut self, signal: i32) -> Result<()> {
        if !self.attached {
            return Ok(());
        }
        if self.breakpoint.is_some() {
            self.remove_breakpoint()?;
        }
        let pid = self.pid;
        self.attached = false;
        self.privileged("detach", |t| t.detach(pid, signal))
    }

    /// Detach, delivering `signal` (0 for none) as the process resumes.
    pub fn detach(mut self, signal: i32) -> Result<()> {
        log_detail!(self.log, "detach pid {} signal {}", self.pid, signal);
        self.detach_inner(signal)
    }

    /// Terminate the target.
    pub fn kill(mut self) -> Result<()> {
        log!(self.log, "killing pid {}", self.pid);
        self.terminate()
    }

    fn terminate(&mut self) -> Result<()> {
        // The patched byte does not matter to a process about to die
        self.breakpoint = None;
        let pid = self.pid;
        let detached = if self.attached {
            self.attached = false;
            self.privileged("detach", |t| t.detach(pid, libc::SIGKILL))
        } else {
            Ok(())
        };
        if detached.is_err() {
            self.bridge.tracer.kill(pid).map_err(|e| Error::trace(pid, "kill", e))?;
        }
        Ok(())
    }

    /// Report forks of this process and trace the children.
    pub fn follow_forks(&mut self) -> Result<()> {
        let pid = self.pid;
        self.privileged("follow fork", |t| t.follow_fork(pid, true))?;
        self.privileged("lwp events", |t| t.lwp_events(pid, true))
    }

    /// Report exec as a stop.
    pub fn follow_exec(&mut self) -> Result<()> {
        let pid = self.pid;
        self.privileged("lwp events", |t| t.lwp_events(pid, true))
    }

    // ------------------------------------------------------------------
    // Execution control
    // ------------------------------------------------------------------

    /// Execute one instruction and wait for the resulting stop.
    pub fn step(&mut self) -> Result<()> {
        let pid = self.pid;
        self.privileged("step", |t| t.step(pid))?;
        self.wait_stop("step").map(|_| ())
    }

    /// Resume with `signal`. The next stop is collected with [`Self::wait_stop`].
    pub fn cont(&mut self, signal: i32) -> Result<()> {
        let pid = self.pid;
        self.privileged("continue", |t| t.cont(pid, signal))
    }

    /// Wait for the next stop, returning its signal. Termination is a fault.
    pub fn wait_stop(&mut self, op: &'static str) -> Result<i32> {
        let pid = self.pid;
        let reason = self.bridge.tracer.wait(pid).map_err(|e| Error::trace(pid, op, e))?;
        match reason {
            StopReason::Stopped(sig) => Ok(sig),
            StopReason::Exited(code) => {
                self.attached = false;
                log_fail!(self.log, "pid {} exited with {} during {}", pid, code, op);
                Err(Error::trace(pid, op, io::Error::new(io::ErrorKind::Other, format!("exited with {code}"))))
            }
            StopReason::Signaled(sig) => {
                self.attached = false;
                log_fail!(self.log, "pid {} killed by signal {} during {}", pid, sig, op);
                Err(Error::trace(pid, op, io::Error::new(io::ErrorKind::Other, format!("killed by signal {sig}"))))
            }
        }
    }

    pub fn lwp_info(&self) -> Result<LwpInfo> {
        let pid = self.pid;
        self.privileged("lwp info", |t| t.lwp_info(pid))
    }

    /// Wait for this process to fork and return the traced, stopped child.
    ///
    /// Requires [`Self::follow_forks`]. Stops that are not a fork are skipped.
    pub fn await_forked_child(&mut self) -> Result<TracedProcess<'a>> {
        let child = loop {
            self.wait_stop("await fork")?;
            let info = self.lwp_info()?;
            if info.forked {
                break info.child_pid;
            }
            log_detail!(self.log, "pid {}: skipping non-fork stop", self.pid);
        };

        let mut child = self.bridge.adopt(child);
        child.wait_stop("await fork")?;
        log!(self.log, "pid {} forked {}", self.pid, child.pid);
        Ok(child)
    }

    /// Wait until this process has executed a new image.
    ///
    /// Requires [`Self::follow_exec`]. Cached symbol addresses are dropped.
    pub fn await_exec(&mut self) -> Result<()> {
        loop {
            self.wait_stop("await exec")?;
            if self.lwp_info()?.exec {
                break;
            }
        }
        self.syscall_stub = None;
        self.breakpoint = None;
        log!(self.log, "pid {} executed a new image", self.pid);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Registers and memory
    // ------------------------------------------------------------------

    pub fn get_registers(&self) -> Result<Registers> {
        let pid = self.pid;
        self.privileged("get registers", |t| t.get_regs(pid))
    }

    pub fn set_registers(&mut self, regs: &Registers) -> Result<()> {
        let pid = self.pid;
        self.privileged("set registers", |t| t.set_regs(pid, regs))
    }

    pub fn read_word(&self, addr: u64) -> Result<u64> {
        let pid = self.pid;
        self.privileged("read", |t| t.read_word(pid, addr))
    }

    pub fn write_word(&mut self, addr: u64, value: u64) -> Result<()> {
        let pid = self.pid;
        self.privileged("write", |t| t.write_word(pid, addr, value))
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.read_into(addr, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) -> Result<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    pub fn read_into(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let pid = self.pid;
        self.privileged("read", |t| t.read_memory(pid, addr, buf))
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(addr, &mut buf)?;
        Ok(buf)
    }

    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let pid = self.pid;
        self.privileged("write", |t| t.write_memory(pid, addr, data))
    }

    /// Write `s` followed by a NUL byte.
    pub fn write_cstring(&mut self, addr: u64, s: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        self.write_bytes(addr, &bytes)
    }

    /// Read a NUL-terminated string of at most `max` bytes.
    pub fn read_cstring(&self, addr: u64, max: usize) -> Result<String> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 64];
        while out.len() < max {
            let at = addr + out.len() as u64;
            // Never read across a page boundary the string does not reach
            let len = std::cmp::min(chunk.len() as u64, PAGE_SIZE - at % PAGE_SIZE) as usize;
            self.read_into(at, &mut chunk[..len])?;
            match chunk[..len].iter().position(|b| *b == 0) {
                Some(end) => {
                    out.extend_from_slice(&chunk[..end]);
                    break;
                }
                None => out.extend_from_slice(&chunk[..len]),
            }
        }
        out.truncate(max);
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    // ------------------------------------------------------------------
    // Symbols and privileges
    // ------------------------------------------------------------------

    pub fn resolve(&self, nid: &str) -> Result<u64> {
        self.bridge
            .resolver
            .resolve(self.pid, nid)
            .ok_or_else(|| Error::Resolution { pid: self.pid, nid: nid.to_string() })
    }

    /// Root the target: root directory, no jail, uid 0, all capabilities.
    pub fn raise_privileges(&mut self) -> Result<()> {
        let pid = self.pid;
        self.bridge
            .kernel
            .raise_privileges(pid)
            .map_err(|source| Error::Privilege { pid, op: "raise privileges", source })
    }

    /// Give the target all capabilities, returning the set to restore.
    pub fn raise_capabilities(&mut self) -> Result<Capabilities> {
        let pid = self.pid;
        self.bridge
            .kernel
            .raise_capabilities(pid)
            .map_err(|source| Error::Privilege { pid, op: "raise capabilities", source })
    }

    pub fn restore_capabilities(&mut self, saved: Capabilities) -> Result<()> {
        let pid = self.pid;
        self.bridge
            .kernel
            .restore_capabilities(pid, saved)
            .map_err(|source| Error::Privilege { pid, op: "restore capabilities", source })
    }
}

impl Drop for TracedProcess<'_> {
    fn drop(&mut self) {
        if !self.attached {
            return;
        }
        let result = match self.disposition {
            Disposition::Kill => {
                log_fail!(self.log, "pid {} abandoned, killing", self.pid);
                self.terminate()
            }
            Disposition::Release => self.detach_inner(0),
        };
        if let Err(e) = result {
            log_fail!(self.log, "pid {} cleanup failed: {}", self.pid, e);
        }
    }
}
