//! Platform services of the console's system libraries.

use std::ffi::{CStr, CString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;

use hbldr_bridge::native::{Ps5Kernel, PtraceTracer};
use hbldr_bridge::syscalls::SYS_BUDGET_SET;
use hbldr_common::{debug, Config, Pid};

use crate::engine::{run_engine, Engine};
use crate::platform::Platform;

const CTL_KERN: libc::c_int = 1;
const KERN_PROC: libc::c_int = 14;
const KERN_PROC_PROC: libc::c_int = 8;
/// Offsets into `struct kinfo_proc`.
const KI_PID: usize = 72;
const KI_TDNAME: usize = 447;
const KI_TDNAME_LEN: usize = 20;

const RFPROC: libc::c_int = 1 << 4;
const RFMEM: libc::c_int = 1 << 5;
const RFCFDG: libc::c_int = 1 << 12;
const PT_TRACE_ME: libc::c_int = 0;
const SPAWN_STACK_SIZE: usize = 0x4000;

const MNT_UPDATE: libc::c_int = 0x0001_0000;

#[repr(C)]
struct AppLaunchCtx {
    structsize: u32,
    user_id: u32,
    app_opt: u32,
    crash_report: u64,
    check_flag: u32,
}

extern "C" {
    fn sceUserServiceGetForegroundUser(user_id: *mut u32) -> libc::c_int;
    fn sceSystemServiceGetAppIdOfRunningBigApp() -> libc::c_int;
    fn sceSystemServiceKillApp(app_id: libc::c_int, how: libc::c_int, reason: libc::c_int, core_dump: libc::c_int) -> libc::c_int;
    fn sceSystemServiceLaunchApp(title_id: *const libc::c_char, argv: *mut *mut libc::c_char, ctx: *mut AppLaunchCtx) -> libc::c_int;
    fn sceKernelGetAppState(app_id: libc::c_int, a: *mut libc::c_int, b: *mut libc::c_int) -> libc::c_int;
    fn rfork_thread(
        flags: libc::c_int,
        stack: *mut libc::c_void,
        func: extern "C" fn(*mut libc::c_void) -> libc::c_int,
        arg: *mut libc::c_void,
    ) -> libc::pid_t;
    fn nmount(iov: *mut libc::iovec, niov: libc::c_uint, flags: libc::c_int) -> libc::c_int;
}

fn sce_error(what: &str, code: libc::c_int) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("{what} returned {code:#x}"))
}

fn cstring(s: &str) -> io::Result<CString> {
    CString::new(s).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn path_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Everything the spawned child touches; it shares our memory until exec.
struct SpawnContext {
    helper: CString,
    devices: [CString; 3],
    argv: Vec<*mut libc::c_char>,
}

extern "C" fn spawn_entry(arg: *mut libc::c_void) -> libc::c_int {
    // SAFETY: arg is the SpawnContext kept alive by the parent until the
    // child has stopped after its exec
    let ctx = unsafe { &*(arg as *const SpawnContext) };
    unsafe {
        if libc::syscall(SYS_BUDGET_SET as libc::c_int, 0) != 0 {
            return -1;
        }
        let modes = [libc::O_RDONLY, libc::O_WRONLY, libc::O_WRONLY];
        for (device, mode) in ctx.devices.iter().zip(modes) {
            if libc::open(device.as_ptr(), mode) < 0 {
                return -1;
            }
        }
        if libc::ptrace(PT_TRACE_ME, 0, ptr::null_mut(), 0) != 0 {
            return -1;
        }
        libc::execve(ctx.helper.as_ptr(), ctx.argv.as_ptr() as *const *const libc::c_char, ptr::null());
    }
    -1
}

fn wait_for(pid: Pid) -> io::Result<libc::c_int> {
    let mut status = 0;
    loop {
        // SAFETY: status is a valid out pointer
        if unsafe { libc::waitpid(pid, &mut status, 0) } >= 0 {
            return Ok(status);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Run `body` with an engine over the console's own services.
///
/// Installs the stderr log backend and reads configuration overrides from
/// the environment first.
pub fn run_on_console<R>(body: impl FnOnce(&Engine<'_>) -> R) -> R {
    debug::init();
    let config = Config::from_env();
    run_engine(&PtraceTracer, &Ps5Kernel, &Ps5Platform, &config, body)
}

/// The console's system services.
#[derive(Debug, Default)]
pub struct Ps5Platform;

impl Ps5Platform {
    pub fn new() -> Self {
        Self
    }

    fn process_table() -> io::Result<Vec<u8>> {
        let mib = [CTL_KERN, KERN_PROC, KERN_PROC_PROC, 0];
        let mut size: libc::size_t = 0;
        // SAFETY: a null buffer asks only for the size
        let ret = unsafe { libc::sysctl(mib.as_ptr(), 4, ptr::null_mut(), &mut size, ptr::null(), 0) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        let mut buf = vec![0u8; size];
        // SAFETY: buf holds size bytes
        let ret = unsafe { libc::sysctl(mib.as_ptr(), 4, buf.as_mut_ptr().cast(), &mut size, ptr::null(), 0) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        buf.truncate(size);
        Ok(buf)
    }
}

impl Platform for Ps5Platform {
    fn own_pid(&self) -> Pid {
        std::process::id() as Pid
    }

    fn find_pid(&self, name: &str) -> Option<Pid> {
        let table = Self::process_table().ok()?;
        let own = self.own_pid();
        let mut found = None;
        let mut offset = 0;
        while offset + KI_TDNAME + KI_TDNAME_LEN <= table.len() {
            let entry = &table[offset..];
            let size = i32::from_ne_bytes(entry[..4].try_into().ok()?) as usize;
            let pid = i32::from_ne_bytes(entry[KI_PID..KI_PID + 4].try_into().ok()?);
            let tdname = CStr::from_bytes_until_nul(&entry[KI_TDNAME..KI_TDNAME + KI_TDNAME_LEN]).ok();
            if pid != own && tdname.and_then(|n| n.to_str().ok()) == Some(name) {
                found = Some(pid);
            }
            if size == 0 {
                break;
            }
            offset += size;
        }
        found
    }

    fn foreground_user(&self) -> io::Result<u32> {
        let mut user = 0;
        // SAFETY: user is a valid out pointer
        match unsafe { sceUserServiceGetForegroundUser(&mut user) } {
            0 => Ok(user),
            code => Err(sce_error("sceUserServiceGetForegroundUser", code)),
        }
    }

    fn running_big_app(&self) -> Option<i32> {
        let app_id = unsafe { sceSystemServiceGetAppIdOfRunningBigApp() };
        (app_id > 0).then_some(app_id)
    }

    fn kill_app(&self, app_id: i32) -> io::Result<()> {
        match unsafe { sceSystemServiceKillApp(app_id, -1, 0, 0) } {
            0 => Ok(()),
            code => Err(sce_error("sceSystemServiceKillApp", code)),
        }
    }

    fn app_running(&self, app_id: i32) -> bool {
        unsafe { sceKernelGetAppState(app_id, ptr::null_mut(), ptr::null_mut()) == 0 }
    }

    fn launch_app(&self, title_id: &str, argv: &[String], user: u32) -> io::Result<()> {
        let title = cstring(title_id)?;
        let args = argv.iter().map(|a| cstring(a)).collect::<io::Result<Vec<_>>>()?;
        let mut pointers: Vec<*mut libc::c_char> = args.iter().map(|a| a.as_ptr() as *mut _).collect();
        pointers.push(ptr::null_mut());
        let mut ctx = AppLaunchCtx { structsize: 0, user_id: user, app_opt: 0, crash_report: 0, check_flag: 0 };
        // SAFETY: title, args and ctx outlive the call
        match unsafe { sceSystemServiceLaunchApp(title.as_ptr(), pointers.as_mut_ptr(), &mut ctx) } {
            0 => Ok(()),
            code => Err(sce_error("sceSystemServiceLaunchApp", code)),
        }
    }

    fn spawn_traced(&self, helper: &Path, devices: &[PathBuf; 3], argv: &[String]) -> io::Result<Pid> {
        let args = argv.iter().map(|a| cstring(a)).collect::<io::Result<Vec<_>>>()?;
        let mut ctx = SpawnContext {
            helper: path_cstring(helper)?,
            devices: [path_cstring(&devices[0])?, path_cstring(&devices[1])?, path_cstring(&devices[2])?],
            argv: args.iter().map(|a| a.as_ptr() as *mut _).collect(),
        };
        ctx.argv.push(ptr::null_mut());

        let mut stack = vec![0u8; SPAWN_STACK_SIZE];
        // SAFETY: the child runs on `stack` and reads `ctx`, both alive
        // until waitpid reports the post-exec stop
        let pid = unsafe {
            let top = stack.as_mut_ptr().add(SPAWN_STACK_SIZE - 16);
            rfork_thread(RFPROC | RFCFDG | RFMEM, top.cast(), spawn_entry, &mut ctx as *mut SpawnContext as *mut _)
        };
        if pid < 0 {
            return Err(io::Error::last_os_error());
        }
        let status = match wait_for(pid) {
            Ok(status) => status,
            Err(e) => {
                // The child still shares `stack` and `ctx`; it must be gone
                // before either is dropped
                unsafe { libc::kill(pid, libc::SIGKILL) };
                let _ = wait_for(pid);
                return Err(e);
            }
        };
        if !libc::WIFSTOPPED(status) {
            return Err(io::Error::new(io::ErrorKind::Other, format!("helper {pid} did not stop (status {status:#x})")));
        }
        Ok(pid)
    }

    fn remount_system(&self) -> io::Result<()> {
        let pairs: [(&CStr, Option<&CStr>); 7] = [
            (c"from", Some(c"/dev/ssd0.system_ex")),
            (c"fspath", Some(c"/system_ex")),
            (c"fstype", Some(c"exfatfs")),
            (c"large", Some(c"yes")),
            (c"timezone", Some(c"static")),
            (c"async", None),
            (c"ignoreacl", None),
        ];
        let mut iov = Vec::with_capacity(pairs.len() * 2);
        for (key, value) in pairs {
            iov.push(libc::iovec { iov_base: key.as_ptr() as *mut _, iov_len: key.to_bytes_with_nul().len() });
            iov.push(match value {
                Some(v) => libc::iovec { iov_base: v.as_ptr() as *mut _, iov_len: v.to_bytes_with_nul().len() },
                None => libc::iovec { iov_base: ptr::null_mut(), iov_len: 0 },
            });
        }
        // SAFETY: every iovec points at a static string or is empty
        if unsafe { nmount(iov.as_mut_ptr(), iov.len() as libc::c_uint, MNT_UPDATE) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
