//! Remote syscall and libc wrappers
//!
//! Each wrapper stages one call inside the target and turns a failure
//! result into an error carrying the target's own errno.

use hbldr_common::{log_detail, log_fail, round_page, Error, Result};

use crate::process::TracedProcess;
use crate::resolver::nid;

pub const SYS_CLOSE: i64 = 6;
pub const SYS_CHDIR: i64 = 12;
pub const SYS_GETPID: i64 = 20;
pub const SYS_MSYNC: i64 = 65;
pub const SYS_MUNMAP: i64 = 73;
pub const SYS_MPROTECT: i64 = 74;
pub const SYS_DUP2: i64 = 90;
pub const SYS_SOCKET: i64 = 97;
pub const SYS_SETSOCKOPT: i64 = 105;
pub const SYS_THR_SET_NAME: i64 = 464;
pub const SYS_MMAP: i64 = 477;
pub const SYS_JITSHM_CREATE: i64 = 0x215;
pub const SYS_JITSHM_ALIAS: i64 = 0x216;
pub const SYS_BUDGET_SET: i64 = 0x23b;
pub const SYS_RDUP: i64 = 0x25b;
/// Lets the kernel finish runtime parameters (process param, libc param)
/// of a process stopped at its loader entry.
pub const SYS_DYNLIB_PROCESS_NEEDED_AND_RELOCATE: i64 = 599;

pub const PROT_READ: i32 = 0x1;
pub const PROT_WRITE: i32 = 0x2;
pub const PROT_EXEC: i32 = 0x4;
pub const PROT_RWX: i32 = PROT_READ | PROT_WRITE | PROT_EXEC;

pub const MAP_SHARED: i32 = 0x1;
pub const MAP_PRIVATE: i32 = 0x2;
pub const MAP_FIXED: i32 = 0x10;
pub const MAP_ANON: i32 = 0x1000;

pub const MS_SYNC: i32 = 0;

pub const AF_INET6: i32 = 28;
pub const SOCK_DGRAM: i32 = 2;
pub const IPPROTO_UDP: i32 = 17;
pub const IPPROTO_IPV6: i32 = 41;
pub const IPV6_2292PKTOPTIONS: i32 = 25;
pub const IPV6_PKTINFO: i32 = 46;
pub const IPV6_TCLASS: i32 = 61;

/// Failure class of a remote call.
#[derive(Clone, Copy)]
enum Class {
    Mapping,
    Other,
}

impl TracedProcess<'_> {
    /// Current value of the target's errno.
    pub fn errno(&mut self) -> Result<i32> {
        let errno_fn = self.resolve(nid::ERRNO)?;
        let cell = self.call(errno_fn, &[])?;
        Ok(self.read_u32(cell)? as i32)
    }

    fn check(&mut self, op: &'static str, class: Class, ret: i64) -> Result<i64> {
        if ret != -1 {
            return Ok(ret);
        }
        let errno = match self.errno() {
            Ok(errno) => errno,
            Err(e) if e.is_trace_fault() => return Err(e),
            Err(_) => libc::EIO,
        };
        log_fail!(self.log, "pid {}: remote {} failed, errno {}", self.pid(), op, errno);
        let pid = self.pid();
        Err(match class {
            Class::Mapping => Error::Mapping { pid, op, errno },
            Class::Other => Error::RemoteSyscall { pid, op, errno },
        })
    }

    fn checked_syscall(&mut self, op: &'static str, class: Class, sysno: i64, args: &[u64]) -> Result<i64> {
        let ret = self.syscall(sysno, args)?;
        self.check(op, class, ret)
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    pub fn mmap(&mut self, addr: u64, len: u64, prot: i32, flags: i32, fd: i32, offset: u64) -> Result<u64> {
        let args = [addr, len, prot as u64, flags as u64, fd as i64 as u64, offset];
        let ret = self.checked_syscall("mmap", Class::Mapping, SYS_MMAP, &args)?;
        log_detail!(self.log, "pid {}: mmap {:#x} bytes prot {} at {:#x}", self.pid(), len, prot, ret);
        Ok(ret as u64)
    }

    pub fn munmap(&mut self, addr: u64, len: u64) -> Result<()> {
        self.checked_syscall("munmap", Class::Mapping, SYS_MUNMAP, &[addr, len]).map(|_| ())
    }

    pub fn msync(&mut self, addr: u64, len: u64, flags: i32) -> Result<()> {
        self.checked_syscall("msync", Class::Mapping, SYS_MSYNC, &[addr, len, flags as u64]).map(|_| ())
    }

    pub fn mprotect(&mut self, addr: u64, len: u64, prot: i32) -> Result<()> {
        self.checked_syscall("mprotect", Class::Mapping, SYS_MPROTECT, &[addr, len, prot as u64]).map(|_| ())
    }

    /// Create an anonymous jit memory object; returns its descriptor.
    pub fn jitshm_create(&mut self, name: u64, size: u64, max_prot: i32) -> Result<i32> {
        let args = [name, size, max_prot as u64];
        self.checked_syscall("jitshm_create", Class::Mapping, SYS_JITSHM_CREATE, &args)
            .map(|fd| fd as i32)
    }

    /// Open a second descriptor onto a jit object with reduced protection.
    pub fn jitshm_alias(&mut self, fd: i32, max_prot: i32) -> Result<i32> {
        let args = [fd as u64, max_prot as u64];
        self.checked_syscall("jitshm_alias", Class::Mapping, SYS_JITSHM_ALIAS, &args)
            .map(|fd| fd as i32)
    }

    /// Map a private read/write page range for temporary use.
    pub fn alloc_scratch(&mut self, len: u64) -> Result<u64> {
        let len = round_page(len.max(1));
        self.mmap(0, len, PROT_READ | PROT_WRITE, MAP_ANON | MAP_PRIVATE, -1, 0)
    }

    /// Sync and unmap a scratch range.
    pub fn release_scratch(&mut self, addr: u64, len: u64) -> Result<()> {
        let len = round_page(len.max(1));
        self.msync(addr, len, MS_SYNC)?;
        self.munmap(addr, len)
    }

    /// Run `body` with a scratch range that is released afterwards.
    ///
    /// A release failure is reported only when `body` succeeded.
    pub fn with_scratch<T>(&mut self, len: u64, body: impl FnOnce(&mut Self, u64) -> Result<T>) -> Result<T> {
        let addr = self.alloc_scratch(len)?;
        let result = body(self, addr);
        if !self.is_attached() {
            return result;
        }
        let released = self.release_scratch(addr, len);
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release)) => {
                log_fail!(self.log, "pid {}: scratch {:#x} leaked: {}", self.pid(), addr, release);
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Descriptors and process state
    // ------------------------------------------------------------------

    pub fn close(&mut self, fd: i32) -> Result<()> {
        self.checked_syscall("close", Class::Other, SYS_CLOSE, &[fd as u64]).map(|_| ())
    }

    pub fn dup2(&mut self, from: i32, to: i32) -> Result<i32> {
        self.checked_syscall("dup2", Class::Other, SYS_DUP2, &[from as u64, to as u64])
            .map(|fd| fd as i32)
    }

    /// Duplicate descriptor `fd` of process `owner` into the target.
    pub fn rdup(&mut self, owner: i32, fd: i32) -> Result<i32> {
        self.checked_syscall("rdup", Class::Other, SYS_RDUP, &[owner as u64, fd as u64])
            .map(|fd| fd as i32)
    }

    /// Change directory to the path stored at `path`.
    pub fn chdir(&mut self, path: u64) -> Result<()> {
        self.checked_syscall("chdir", Class::Other, SYS_CHDIR, &[path]).map(|_| ())
    }

    /// Rename the calling thread to the string stored at `name`.
    pub fn set_thread_name(&mut self, name: u64) -> Result<()> {
        self.checked_syscall("thr_set_name", Class::Other, SYS_THR_SET_NAME, &[u64::MAX, name])
            .map(|_| ())
    }

    pub fn getpid(&mut self) -> Result<i32> {
        self.checked_syscall("getpid", Class::Other, SYS_GETPID, &[]).map(|pid| pid as i32)
    }

    pub fn socket(&mut self, domain: i32, ty: i32, protocol: i32) -> Result<i32> {
        let args = [domain as u64, ty as u64, protocol as u64];
        self.checked_syscall("socket", Class::Other, SYS_SOCKET, &args).map(|fd| fd as i32)
    }

    pub fn setsockopt(&mut self, fd: i32, level: i32, name: i32, value: u64, len: u64) -> Result<()> {
        let args = [fd as u64, level as u64, name as u64, value, len];
        self.checked_syscall("setsockopt", Class::Other, SYS_SETSOCKOPT, &args).map(|_| ())
    }

    /// Let the kernel finish the runtime parameters of a process stopped at
    /// its loader entry.
    pub fn finish_runtime_parameters(&mut self) -> Result<()> {
        let ret = self.syscall(SYS_DYNLIB_PROCESS_NEEDED_AND_RELOCATE, &[])?;
        if ret != 0 {
            return self.check("dynlib_process_needed_and_relocate", Class::Other, -1).map(|_| ());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // libc functions
    // ------------------------------------------------------------------

    /// Create a pipe; the two descriptors are written to `fds`.
    pub fn pipe(&mut self, fds: u64) -> Result<()> {
        let pipe_fn = self.resolve(nid::PIPE)?;
        let ret = self.call(pipe_fn, &[fds])? as i32;
        self.check("pipe", Class::Other, ret as i64).map(|_| ())
    }

    /// Address of the process parameter block.
    pub fn proc_param(&mut self) -> Result<u64> {
        let func = self.resolve(nid::GET_PROC_PARAM)?;
        match self.call(func, &[])? {
            0 => Err(Error::RemoteSyscall { pid: self.pid(), op: "sceKernelGetProcParam", errno: libc::ENOENT }),
            addr => Ok(addr),
        }
    }

    /// Address of the process's argv table.
    pub fn argv_table(&mut self) -> Result<u64> {
        let func = self.resolve(nid::GET_ARGV)?;
        match self.call(func, &[])? {
            0 => Err(Error::RemoteSyscall { pid: self.pid(), op: "getargv", errno: libc::ENOENT }),
            addr => Ok(addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Bridge;
    use crate::testing::{Event, FakeTarget, FAKE_PID};
    use hbldr_common::BridgeConfig;

    #[test]
    fn test_mmap_failure_carries_target_errno() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);
        fake.fail_syscall(SYS_MMAP, libc::ENOMEM);

        let mut process = bridge.attach(FAKE_PID).unwrap();
        let err = process.alloc_scratch(0x1000).unwrap_err();
        assert!(matches!(err, Error::Mapping { op: "mmap", errno: libc::ENOMEM, .. }));
        process.detach(0).unwrap();
    }

    #[test]
    fn test_non_mapping_failure_class() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);

        let mut process = bridge.attach(FAKE_PID).unwrap();
        let err = process.close(77).unwrap_err();
        assert!(matches!(err, Error::RemoteSyscall { op: "close", errno: libc::EBADF, .. }));
        process.detach(0).unwrap();
    }

    #[test]
    fn test_scratch_is_released() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);

        let mut process = bridge.attach(FAKE_PID).unwrap();
        let baseline = fake.mapped_pages(FAKE_PID);
        let seen = process
            .with_scratch(10, |p, addr| {
                p.write_cstring(addr, "scratch")?;
                Ok(addr)
            })
            .unwrap();
        assert_eq!(fake.mapped_pages(FAKE_PID), baseline);
        assert!(fake.events().contains(&Event::Syscall(FAKE_PID, SYS_MSYNC)));
        assert!(process.read_word(seen).is_err());
        process.detach(0).unwrap();
    }

    #[test]
    fn test_scratch_released_when_body_fails() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);

        let mut process = bridge.attach(FAKE_PID).unwrap();
        let baseline = fake.mapped_pages(FAKE_PID);
        let err = process.with_scratch(10, |p, _| p.close(99).map(|_| ())).unwrap_err();
        assert!(matches!(err, Error::RemoteSyscall { op: "close", .. }));
        assert_eq!(fake.mapped_pages(FAKE_PID), baseline);
        process.detach(0).unwrap();
    }

    #[test]
    fn test_pipe_writes_two_descriptors() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);

        let mut process = bridge.attach(FAKE_PID).unwrap();
        let fds = fake.data_page() + 0x900;
        process.pipe(fds).unwrap();
        let read_end = process.read_u32(fds).unwrap() as i32;
        let write_end = process.read_u32(fds + 4).unwrap() as i32;
        assert!(read_end >= 3 && write_end > read_end);
        process.close(read_end).unwrap();
        process.close(write_end).unwrap();
        process.detach(0).unwrap();
    }

    #[test]
    fn test_runtime_parameters() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);

        // Freshly spawned: stopped at the loader entry, parameters unfinished
        let pid = fake.spawn_traced();
        let mut process = bridge.adopt(pid);
        process.wait_stop("spawn").unwrap();
        assert!(process.proc_param().is_err());
        process.finish_runtime_parameters().unwrap();
        assert_eq!(process.proc_param().unwrap(), fake.data_page() + 0x100);
        fake.fail_syscall(SYS_DYNLIB_PROCESS_NEEDED_AND_RELOCATE, libc::EINVAL);
        let err = process.finish_runtime_parameters().unwrap_err();
        assert_eq!(err.raw_os_error(), libc::EINVAL);
        process.detach(0).unwrap();
    }
}
