//! Native backend: the FreeBSD tracing facility and the console's kernel
//! read/write routines.

use std::ffi::CString;
use std::io;
use std::mem;

use hbldr_common::Pid;

use crate::kernel::{Capabilities, Credentials, Kernel, DEBUGGER_AUTHID};
use crate::registers::Registers;
use crate::tracer::{LwpInfo, StopReason, Tracer};

const PT_READ_D: libc::c_int = 2;
const PT_WRITE_D: libc::c_int = 5;
const PT_CONTINUE: libc::c_int = 7;
const PT_STEP: libc::c_int = 9;
const PT_ATTACH: libc::c_int = 10;
const PT_DETACH: libc::c_int = 11;
const PT_IO: libc::c_int = 12;
const PT_LWPINFO: libc::c_int = 13;
const PT_FOLLOW_FORK: libc::c_int = 23;
const PT_LWP_EVENTS: libc::c_int = 24;
const PT_GETREGS: libc::c_int = 33;
const PT_SETREGS: libc::c_int = 34;

const PIOD_READ_D: libc::c_int = 1;
const PIOD_WRITE_D: libc::c_int = 2;

const PL_FLAG_EXEC: libc::c_int = 0x10;
const PL_FLAG_FORKED: libc::c_int = 0x40;

#[repr(C)]
struct PtraceIoDesc {
    piod_op: libc::c_int,
    piod_offs: *mut libc::c_void,
    piod_addr: *mut libc::c_void,
    piod_len: libc::size_t,
}

#[repr(C)]
struct PtraceLwpInfo {
    pl_lwpid: i32,
    pl_event: libc::c_int,
    pl_flags: libc::c_int,
    pl_sigmask: libc::sigset_t,
    pl_siglist: libc::sigset_t,
    pl_siginfo: libc::siginfo_t,
    pl_tdname: [libc::c_char; 20],
    pl_child_pid: libc::pid_t,
    pl_syscall_code: u32,
    pl_syscall_narg: u32,
}

fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Tracing through ptrace(2).
#[derive(Debug, Default)]
pub struct PtraceTracer;

impl PtraceTracer {
    fn request(&self, request: libc::c_int, pid: Pid, addr: *mut libc::c_char, data: libc::c_int) -> io::Result<libc::c_int> {
        check(unsafe { libc::ptrace(request, pid, addr, data) })
    }
}

impl Tracer for PtraceTracer {
    fn attach(&self, pid: Pid) -> io::Result<()> {
        self.request(PT_ATTACH, pid, std::ptr::null_mut(), 0).map(|_| ())
    }

    fn detach(&self, pid: Pid, signal: i32) -> io::Result<()> {
        self.request(PT_DETACH, pid, std::ptr::null_mut(), signal).map(|_| ())
    }

    fn step(&self, pid: Pid) -> io::Result<()> {
        // addr 1: resume where the thread stopped
        self.request(PT_STEP, pid, 1 as *mut libc::c_char, 0).map(|_| ())
    }

    fn cont(&self, pid: Pid, signal: i32) -> io::Result<()> {
        self.request(PT_CONTINUE, pid, 1 as *mut libc::c_char, signal).map(|_| ())
    }

    fn follow_fork(&self, pid: Pid, enable: bool) -> io::Result<()> {
        self.request(PT_FOLLOW_FORK, pid, std::ptr::null_mut(), enable as libc::c_int).map(|_| ())
    }

    fn lwp_events(&self, pid: Pid, enable: bool) -> io::Result<()> {
        self.request(PT_LWP_EVENTS, pid, std::ptr::null_mut(), enable as libc::c_int).map(|_| ())
    }

    fn lwp_info(&self, pid: Pid) -> io::Result<LwpInfo> {
        let mut info: PtraceLwpInfo = unsafe { mem::zeroed() };
        self.request(
            PT_LWPINFO,
            pid,
            &mut info as *mut PtraceLwpInfo as *mut libc::c_char,
            mem::size_of::<PtraceLwpInfo>() as libc::c_int,
        )?;
        Ok(LwpInfo {
            forked: info.pl_flags & PL_FLAG_FORKED != 0,
            exec: info.pl_flags & PL_FLAG_EXEC != 0,
            child_pid: info.pl_child_pid,
        })
    }

    fn get_regs(&self, pid: Pid) -> io::Result<Registers> {
        let mut regs = Registers::default();
        self.request(PT_GETREGS, pid, &mut regs as *mut Registers as *mut libc::c_char, 0)?;
        Ok(regs)
    }

    fn set_regs(&self, pid: Pid, regs: &Registers) -> io::Result<()> {
        let mut copy = *regs;
        self.request(PT_SETREGS, pid, &mut copy as *mut Registers as *mut libc::c_char, 0).map(|_| ())
    }

    fn read_word(&self, pid: Pid, addr: u64) -> io::Result<u64> {
        let mut word = [0u8; 8];
        self.read_memory(pid, addr, &mut word)?;
        Ok(u64::from_le_bytes(word))
    }

    fn write_word(&self, pid: Pid, addr: u64, word: u64) -> io::Result<()> {
        self.write_memory(pid, addr, &word.to_le_bytes())
    }

    fn read_memory(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut desc = PtraceIoDesc {
            piod_op: PIOD_READ_D,
            piod_offs: addr as *mut libc::c_void,
            piod_addr: buf.as_mut_ptr() as *mut libc::c_void,
            piod_len: buf.len(),
        };
        self.request(PT_IO, pid, &mut desc as *mut PtraceIoDesc as *mut libc::c_char, 0)?;
        if desc.piod_len != buf.len() {
            return Err(io::Error::from_raw_os_error(libc::EFAULT));
        }
        Ok(())
    }

    fn write_memory(&self, pid: Pid, addr: u64, data: &[u8]) -> io::Result<()> {
        let mut desc = PtraceIoDesc {
            piod_op: PIOD_WRITE_D,
            piod_offs: addr as *mut libc::c_void,
            piod_addr: data.as_ptr() as *mut libc::c_void,
            piod_len: data.len(),
        };
        self.request(PT_IO, pid, &mut desc as *mut PtraceIoDesc as *mut libc::c_char, 0)?;
        if desc.piod_len != data.len() {
            return Err(io::Error::from_raw_os_error(libc::EFAULT));
        }
        Ok(())
    }

    fn wait(&self, pid: Pid) -> io::Result<StopReason> {
        let mut status: libc::c_int = 0;
        let result = unsafe { libc::waitpid(pid, &mut status, 0) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        if libc::WIFEXITED(status) {
            Ok(StopReason::Exited(libc::WEXITSTATUS(status)))
        } else if libc::WIFSIGNALED(status) {
            Ok(StopReason::Signaled(libc::WTERMSIG(status)))
        } else if libc::WIFSTOPPED(status) {
            Ok(StopReason::Stopped(libc::WSTOPSIG(status)))
        } else {
            Ok(StopReason::Stopped(0))
        }
    }

    fn kill(&self, pid: Pid) -> io::Result<()> {
        check(unsafe { libc::kill(pid, libc::SIGKILL) }).map(|_| ())
    }
}

// Kernel read/write routines provided by the payload SDK.
extern "C" {
    fn kernel_dynlib_resolve(pid: libc::pid_t, handle: u32, nid: *const libc::c_char) -> libc::intptr_t;
    fn kernel_dynlib_entry_addr(pid: libc::pid_t, handle: u32) -> libc::intptr_t;
    fn kernel_mprotect(pid: libc::pid_t, addr: libc::intptr_t, len: libc::size_t, prot: libc::c_int) -> libc::c_int;
    fn kernel_get_ucred_authid(pid: libc::pid_t) -> u64;
    fn kernel_set_ucred_authid(pid: libc::pid_t, authid: u64) -> libc::c_int;
    fn kernel_get_ucred_caps(pid: libc::pid_t, caps: *mut u8) -> libc::c_int;
    fn kernel_set_ucred_caps(pid: libc::pid_t, caps: *const u8) -> libc::c_int;
    fn kernel_set_ucred_uid(pid: libc::pid_t, uid: libc::uid_t) -> libc::c_int;
    fn kernel_get_root_vnode() -> libc::intptr_t;
    fn kernel_set_proc_rootdir(pid: libc::pid_t, vnode: libc::intptr_t) -> libc::c_int;
    fn kernel_set_proc_jaildir(pid: libc::pid_t, vnode: libc::intptr_t) -> libc::c_int;
    fn kernel_overlap_sockets(pid: libc::pid_t, master: libc::c_int, victim: libc::c_int) -> libc::c_int;
    fn kernel_get_proc_file(pid: libc::pid_t, fd: libc::c_int) -> libc::intptr_t;

    static KERNEL_ADDRESS_DATA_BASE: libc::intptr_t;
}

fn kernel_result(ret: libc::c_int, what: &str) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, format!("{what} failed")))
    }
}

/// Kernel services on the console.
#[derive(Debug, Default)]
pub struct Ps5Kernel;

impl Ps5Kernel {
    fn caps(&self, pid: Pid) -> io::Result<Capabilities> {
        let mut caps = [0u8; 16];
        kernel_result(unsafe { kernel_get_ucred_caps(pid, caps.as_mut_ptr()) }, "kernel_get_ucred_caps")?;
        Ok(Capabilities(caps))
    }

    fn set_caps(&self, pid: Pid, caps: &Capabilities) -> io::Result<()> {
        kernel_result(unsafe { kernel_set_ucred_caps(pid, caps.0.as_ptr()) }, "kernel_set_ucred_caps")
    }
}

impl Kernel for Ps5Kernel {
    fn dynlib_resolve(&self, pid: Pid, handle: u32, nid: &str) -> Option<u64> {
        let nid = CString::new(nid).ok()?;
        match unsafe { kernel_dynlib_resolve(pid, handle, nid.as_ptr()) } {
            0 => None,
            addr => Some(addr as u64),
        }
    }

    fn dynlib_entry_addr(&self, pid: Pid, handle: u32) -> Option<u64> {
        match unsafe { kernel_dynlib_entry_addr(pid, handle) } {
            0 => None,
            addr => Some(addr as u64),
        }
    }

    fn mprotect(&self, pid: Pid, addr: u64, len: u64, prot: i32) -> io::Result<()> {
        kernel_result(
            unsafe { kernel_mprotect(pid, addr as libc::intptr_t, len as libc::size_t, prot) },
            "kernel_mprotect",
        )
    }

    fn elevate_self(&self) -> io::Result<Credentials> {
        let me = unsafe { libc::getpid() };
        let authid = unsafe { kernel_get_ucred_authid(me) };
        if authid == 0 {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "kernel_get_ucred_authid failed"));
        }
        let caps = self.caps(me)?;
        kernel_result(unsafe { kernel_set_ucred_authid(me, DEBUGGER_AUTHID) }, "kernel_set_ucred_authid")?;
        self.set_caps(me, &Capabilities::ALL)?;
        Ok(Credentials { authid, caps })
    }

    fn restore_self(&self, saved: Credentials) -> io::Result<()> {
        let me = unsafe { libc::getpid() };
        kernel_result(unsafe { kernel_set_ucred_authid(me, saved.authid) }, "kernel_set_ucred_authid")?;
        self.set_caps(me, &saved.caps)
    }

    fn raise_capabilities(&self, pid: Pid) -> io::Result<Capabilities> {
        let saved = self.caps(pid)?;
        self.set_caps(pid, &Capabilities::ALL)?;
        Ok(saved)
    }

    fn restore_capabilities(&self, pid: Pid, saved: Capabilities) -> io::Result<()> {
        self.set_caps(pid, &saved)
    }

    fn raise_privileges(&self, pid: Pid) -> io::Result<()> {
        let vnode = unsafe { kernel_get_root_vnode() };
        if vnode == 0 {
            return Err(io::Error::new(io::ErrorKind::NotFound, "kernel_get_root_vnode failed"));
        }
        kernel_result(unsafe { kernel_set_proc_rootdir(pid, vnode) }, "kernel_set_proc_rootdir")?;
        kernel_result(unsafe { kernel_set_proc_jaildir(pid, 0) }, "kernel_set_proc_jaildir")?;
        kernel_result(unsafe { kernel_set_ucred_uid(pid, 0) }, "kernel_set_ucred_uid")?;
        self.set_caps(pid, &Capabilities::ALL)
    }

    fn overlap_sockets(&self, pid: Pid, master: i32, victim: i32) -> io::Result<()> {
        kernel_result(unsafe { kernel_overlap_sockets(pid, master, victim) }, "kernel_overlap_sockets")
    }

    fn file_address(&self, pid: Pid, fd: i32) -> Option<u64> {
        match unsafe { kernel_get_proc_file(pid, fd) } {
            0 => None,
            addr => Some(addr as u64),
        }
    }

    fn data_base(&self) -> u64 {
        unsafe { KERNEL_ADDRESS_DATA_BASE as u64 }
    }
}
