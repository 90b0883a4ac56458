//! Simulated target processes
//!
//! [`FakeTarget`] implements [`Tracer`] and [`Kernel`] over a set of
//! in-memory processes. Single steps execute a tiny instruction model: the
//! syscall stub and a handful of library functions are emulated, anything
//! else is a one-byte no-op. It is detailed enough to drive staged calls,
//! image mapping, breakpoints, and the fork/exec sequence of a hijack.
//!
//! Every simulated process shares one address map:
//!
//! | range            | contents                                       |
//! |------------------|------------------------------------------------|
//! | `LIBKERNEL_BASE` | getpid (stub at +0xa), __error, pipe, procparam |
//! | `LIBC_BASE`      | getargv                                        |
//! | `LOADER_ENTRY`   | one R+X page of no-ops                         |
//! | `DATA_PAGE`      | errno, environ, process and libc parameters    |
//! | `STACK_BASE`     | 64 KiB stack growing down                      |

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use hashbrown::{HashMap, HashSet};
use hbldr_common::{round_page, trunc_page, BridgeConfig, Pid, PAGE_SIZE};

use crate::kernel::{Capabilities, Credentials, Kernel, DEBUGGER_AUTHID};
use crate::registers::Registers;
use crate::resolver::{nid, DynlibResolver};
use crate::syscalls::*;
use crate::tracer::{LwpInfo, StopReason, Tracer};

/// Ordinary running process, not traced until attached.
pub const FAKE_PID: Pid = 1000;
/// Process that forks launched applications.
pub const SUPERVISOR_PID: Pid = 50;

const LIBKERNEL: u32 = 0x1;
const LIBC: u32 = 0x2001;

const LIBKERNEL_BASE: u64 = 0x8_0000_0000;
const GETPID_FN: u64 = LIBKERNEL_BASE;
const STUB_OFFSET: u64 = 0xa;
const ERRNO_FN: u64 = LIBKERNEL_BASE + 0x100;
const PIPE_FN: u64 = LIBKERNEL_BASE + 0x200;
const PROC_PARAM_FN: u64 = LIBKERNEL_BASE + 0x300;
const HANG_FN: u64 = LIBKERNEL_BASE + 0x400;
const EXIT_FN: u64 = LIBKERNEL_BASE + 0x500;
const LIBC_BASE: u64 = 0x8_1000_0000;
const GETARGV_FN: u64 = LIBC_BASE;

const LOADER_ENTRY: u64 = 0x8_2000_0000;
const LOADER_MAIN_CALL: u64 = 58;
const DATA_PAGE: u64 = 0x8_3000_0000;
const STACK_BASE: u64 = 0x7ff0_0000_0000;
const STACK_SIZE: u64 = 0x10000;
const MMAP_BASE: u64 = 0x2_0000_0000;
const INTERRUPTED_RIP: u64 = 0x4_0000_1234;

const ERRNO_CELL: u64 = DATA_PAGE;
const ENVIRON_CELL: u64 = DATA_PAGE + 0x8;
const PROC_PARAM: u64 = DATA_PAGE + 0x100;
const LIBC_PARAM: u64 = DATA_PAGE + 0x200;
const HEAP_SIZE_CELL: u64 = DATA_PAGE + 0x300;
const ARGV_TABLE: u64 = DATA_PAGE + 0x400;
const ARGV0: u64 = DATA_PAGE + 0x500;

/// Heap size limit of a fresh process.
pub const DEFAULT_HEAP_SIZE: u64 = 0x1000_0000;
/// Value stored at libc param + 72.
pub const NEED_SCE_LIBC: u64 = 1;
pub const KERNEL_DATA_BASE: u64 = 0xffff_ffff_8200_0000;
const KERNEL_FILE_BASE: u64 = 0xffff_9000_0000_0000;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Operations observed by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Attach(Pid),
    Detach(Pid, i32),
    Continue(Pid, i32),
    Kill(Pid),
    SetRegs(Pid),
    Write(Pid, u64, usize),
    Syscall(Pid, i64),
    Call(Pid, u64),
    KernelMprotect(Pid, u64, u64, i32),
    RaisePrivileges(Pid),
    RaiseCapabilities(Pid),
    RestoreCapabilities(Pid),
    OverlapSockets(Pid, i32, i32),
    Launch,
}

impl Event {
    /// True for anything that changes state inside process `pid`.
    fn touches(&self, pid: Pid) -> bool {
        match self {
            Event::SetRegs(p)
            | Event::Write(p, ..)
            | Event::Syscall(p, _)
            | Event::Call(p, _)
            | Event::KernelMprotect(p, ..) => *p == pid,
            _ => false,
        }
    }
}

/// What a descriptor in a simulated process refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FdKind {
    Device,
    Pipe,
    Socket { domain: i32 },
    Shm { object: usize, max_prot: i32 },
    /// Duplicated from another process
    Remote { owner: Pid, fd: i32 },
}

#[derive(Debug)]
enum Backing {
    Anon(Box<[u8]>),
    Object { object: usize, index: u64 },
}

#[derive(Debug)]
struct Page {
    prot: i32,
    backing: Backing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    /// Child of the supervisor, not yet executed its image
    Forked,
    AtLoaderEntry,
    Supervisor,
}

struct Proc {
    pid: Pid,
    phase: Phase,
    exit: Option<StopReason>,
    traced: bool,
    running: bool,
    regs: Registers,
    ret_at: Option<u64>,
    pages: BTreeMap<u64, Page>,
    objects: Vec<Vec<u8>>,
    fds: BTreeMap<i32, FdKind>,
    next_map: u64,
    pending: VecDeque<StopReason>,
    lwp: LwpInfo,
    lwp_events: bool,
    follow_fork: bool,
    runtime_ready: bool,
    caps: Capabilities,
    rooted: bool,
    cwd: String,
    thread_name: String,
    socket_options: Vec<(i32, i32, i32, Vec<u8>)>,
}

impl Proc {
    fn new(pid: Pid, phase: Phase) -> Self {
        let mut proc = Proc {
            pid,
            phase,
            exit: None,
            traced: false,
            running: false,
            regs: Registers::default(),
            ret_at: None,
            pages: BTreeMap::new(),
            objects: Vec::new(),
            fds: BTreeMap::new(),
            next_map: MMAP_BASE,
            pending: VecDeque::new(),
            lwp: LwpInfo::default(),
            lwp_events: false,
            follow_fork: false,
            runtime_ready: phase != Phase::AtLoaderEntry,
            caps: Capabilities([0x11; 16]),
            rooted: false,
            cwd: "/app0".to_string(),
            thread_name: "main".to_string(),
            socket_options: Vec::new(),
        };
        for fd in 0..3 {
            proc.fds.insert(fd, FdKind::Device);
        }
        proc.lay_out();
        proc
    }

    /// Fresh image: stack, data page, loader entry and initial registers.
    fn lay_out(&mut self) {
        self.pages.clear();
        self.objects.clear();
        self.next_map = MMAP_BASE;
        self.ret_at = None;

        self.map_anon(STACK_BASE - STACK_SIZE, STACK_SIZE, PROT_READ | PROT_WRITE);
        self.map_anon(DATA_PAGE, PAGE_SIZE, PROT_READ | PROT_WRITE);
        self.map_anon(LOADER_ENTRY, PAGE_SIZE, PROT_READ | PROT_EXEC);

        self.poke(LOADER_ENTRY, &[0x90; PAGE_SIZE as usize]);
        // call main
        self.poke(LOADER_ENTRY + LOADER_MAIN_CALL, &[0xe8]);

        self.poke(PROC_PARAM + 56, &LIBC_PARAM.to_le_bytes());
        self.poke(LIBC_PARAM + 16, &HEAP_SIZE_CELL.to_le_bytes());
        self.poke(LIBC_PARAM + 72, &NEED_SCE_LIBC.to_le_bytes());
        self.poke(HEAP_SIZE_CELL, &DEFAULT_HEAP_SIZE.to_le_bytes());
        self.poke(ARGV_TABLE, &ARGV0.to_le_bytes());
        self.poke(ARGV0, b"eboot.bin\0");

        let rsp = STACK_BASE - 0x1000;
        self.regs = Registers {
            rsp,
            rbp: rsp + 0x40,
            rbx: 0x1111_1111,
            rcx: 0xc0ff_ee,
            r12: 0x1212_1212,
            rflags: 0x246,
            rip: match self.phase {
                Phase::AtLoaderEntry => LOADER_ENTRY,
                _ => INTERRUPTED_RIP,
            },
            ..Registers::default()
        };
    }

    fn alive(&self) -> bool {
        self.exit.is_none()
    }

    fn end(&mut self, reason: StopReason) {
        self.exit = Some(reason);
        self.pending.clear();
        if self.traced {
            self.pending.push_back(reason);
        }
    }

    fn map_anon(&mut self, addr: u64, len: u64, prot: i32) {
        for page in (addr..addr + round_page(len)).step_by(PAGE_SIZE as usize) {
            let data = vec![0u8; PAGE_SIZE as usize].into_boxed_slice();
            self.pages.insert(page, Page { prot, backing: Backing::Anon(data) });
        }
    }

    fn byte(&self, addr: u64) -> Option<u8> {
        let page = self.pages.get(&trunc_page(addr))?;
        let off = (addr % PAGE_SIZE) as usize;
        Some(match &page.backing {
            Backing::Anon(data) => data[off],
            Backing::Object { object, index } => self.objects[*object][(*index * PAGE_SIZE) as usize + off],
        })
    }

    fn set_byte(&mut self, addr: u64, value: u8) -> bool {
        let off = (addr % PAGE_SIZE) as usize;
        let Some(page) = self.pages.get_mut(&trunc_page(addr)) else {
            return false;
        };
        match &mut page.backing {
            Backing::Anon(data) => data[off] = value,
            Backing::Object { object, index } => {
                let at = (*index * PAGE_SIZE) as usize + off;
                self.objects[*object][at] = value;
            }
        }
        true
    }

    fn peek(&self, addr: u64, buf: &mut [u8]) -> bool {
        for (i, b) in buf.iter_mut().enumerate() {
            match self.byte(addr + i as u64) {
                Some(v) => *b = v,
                None => return false,
            }
        }
        true
    }

    /// Write bypassing protections, as the kernel does.
    fn poke(&mut self, addr: u64, data: &[u8]) -> bool {
        data.iter().enumerate().all(|(i, b)| self.set_byte(addr + i as u64, *b))
    }

    fn peek_u64(&self, addr: u64) -> Option<u64> {
        let mut word = [0u8; 8];
        self.peek(addr, &mut word).then(|| u64::from_le_bytes(word))
    }

    fn cstring(&self, addr: u64) -> Option<String> {
        let mut out = Vec::new();
        loop {
            match self.byte(addr + out.len() as u64)? {
                0 => return Some(String::from_utf8_lossy(&out).into_owned()),
                b => out.push(b),
            }
        }
    }

    fn tracer_read(&self, addr: u64, buf: &mut [u8]) -> io::Result<()> {
        if self.peek(addr, buf) {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::EFAULT))
        }
    }

    /// Tracer writes cannot reach executable pages that are not writable.
    fn tracer_write(&mut self, addr: u64, data: &[u8]) -> io::Result<()> {
        let first = trunc_page(addr);
        let last = trunc_page(addr + data.len().max(1) as u64 - 1);
        for page in (first..=last).step_by(PAGE_SIZE as usize) {
            match self.pages.get(&page) {
                None => return Err(io::Error::from_raw_os_error(libc::EFAULT)),
                Some(p) if p.prot & PROT_EXEC != 0 && p.prot & PROT_WRITE == 0 => {
                    return Err(io::Error::from_raw_os_error(libc::EACCES))
                }
                Some(_) => {}
            }
        }
        self.poke(addr, data);
        Ok(())
    }

    fn alloc_fd(&mut self, kind: FdKind) -> i32 {
        let fd = (3..).find(|fd| !self.fds.contains_key(fd)).unwrap_or(3);
        self.fds.insert(fd, kind);
        fd
    }

    fn range_mapped(&self, addr: u64, len: u64) -> bool {
        (addr..addr + round_page(len)).step_by(PAGE_SIZE as usize).all(|p| self.pages.contains_key(&p))
    }

    fn complete(&mut self, result: Result<u64, i32>) {
        match result {
            Ok(value) => self.regs.rax = value,
            Err(errno) => {
                self.poke(ERRNO_CELL, &(errno as u32).to_le_bytes());
                self.regs.rax = u64::MAX;
            }
        }
    }

    fn syscall(&mut self, sysno: i64, args: [u64; 6], directories: &HashSet<String>) -> Result<u64, i32> {
        match sysno {
            SYS_GETPID => Ok(self.pid as u64),
            SYS_MMAP => self.sys_mmap(args[0], args[1], args[2] as i32, args[3] as i32, args[4] as i32, args[5]),
            SYS_MUNMAP => {
                if args[0] % PAGE_SIZE != 0 || args[1] == 0 {
                    return Err(libc::EINVAL);
                }
                for page in (args[0]..args[0] + round_page(args[1])).step_by(PAGE_SIZE as usize) {
                    self.pages.remove(&page);
                }
                Ok(0)
            }
            SYS_MSYNC => {
                if self.range_mapped(args[0], args[1]) {
                    Ok(0)
                } else {
                    Err(libc::ENOMEM)
                }
            }
            SYS_MPROTECT => {
                let (addr, len, prot) = (args[0], args[1], args[2] as i32);
                if !self.range_mapped(addr, len) {
                    return Err(libc::ENOMEM);
                }
                for page in (addr..addr + round_page(len)).step_by(PAGE_SIZE as usize) {
                    if let Some(p) = self.pages.get_mut(&page) {
                        // Only jit objects may become executable
                        if prot & PROT_EXEC != 0 && matches!(p.backing, Backing::Anon(_)) {
                            return Err(libc::EACCES);
                        }
                        p.prot = prot;
                    }
                }
                Ok(0)
            }
            SYS_JITSHM_CREATE => {
                self.objects.push(vec![0u8; round_page(args[1].max(1)) as usize]);
                let object = self.objects.len() - 1;
                Ok(self.alloc_fd(FdKind::Shm { object, max_prot: args[2] as i32 & PROT_RWX }) as u64)
            }
            SYS_JITSHM_ALIAS => match self.fds.get(&(args[0] as i32)) {
                Some(FdKind::Shm { object, .. }) => {
                    let object = *object;
                    Ok(self.alloc_fd(FdKind::Shm { object, max_prot: args[1] as i32 & PROT_RWX }) as u64)
                }
                _ => Err(libc::EBADF),
            },
            SYS_CLOSE => self.fds.remove(&(args[0] as i32)).map(|_| 0).ok_or(libc::EBADF),
            SYS_DUP2 => {
                let (from, to) = (args[0] as i32, args[1] as i32);
                let kind = self.fds.get(&from).cloned().ok_or(libc::EBADF)?;
                self.fds.insert(to, kind);
                Ok(to as u64)
            }
            SYS_RDUP => {
                let kind = FdKind::Remote { owner: args[0] as Pid, fd: args[1] as i32 };
                Ok(self.alloc_fd(kind) as u64)
            }
            SYS_CHDIR => {
                let path = self.cstring(args[0]).ok_or(libc::EFAULT)?;
                if !directories.contains(&path) {
                    return Err(libc::ENOENT);
                }
                self.cwd = path;
                Ok(0)
            }
            SYS_THR_SET_NAME => {
                self.thread_name = self.cstring(args[1]).ok_or(libc::EFAULT)?;
                Ok(0)
            }
            SYS_SOCKET => Ok(self.alloc_fd(FdKind::Socket { domain: args[0] as i32 }) as u64),
            SYS_SETSOCKOPT => {
                let fd = args[0] as i32;
                match self.fds.get(&fd) {
                    Some(FdKind::Socket { .. }) => {}
                    Some(_) => return Err(libc::ENOTSOCK),
                    None => return Err(libc::EBADF),
                }
                let mut value = vec![0u8; args[4] as usize];
                if !self.peek(args[3], &mut value) {
                    return Err(libc::EFAULT);
                }
                self.socket_options.push((fd, args[1] as i32, args[2] as i32, value));
                Ok(0)
            }
            SYS_BUDGET_SET => Ok(0),
            SYS_DYNLIB_PROCESS_NEEDED_AND_RELOCATE => {
                if self.runtime_ready {
                    return Err(libc::EINVAL);
                }
                self.runtime_ready = true;
                Ok(0)
            }
            _ => Err(libc::ENOSYS),
        }
    }

    fn sys_mmap(&mut self, addr: u64, len: u64, prot: i32, flags: i32, fd: i32, offset: u64) -> Result<u64, i32> {
        if len == 0 || offset % PAGE_SIZE != 0 {
            return Err(libc::EINVAL);
        }
        let len = round_page(len);
        let object = if flags & MAP_ANON != 0 {
            if prot & PROT_EXEC != 0 {
                return Err(libc::EACCES);
            }
            None
        } else {
            match self.fds.get(&fd) {
                Some(FdKind::Shm { object, max_prot }) => {
                    if prot & !max_prot != 0 {
                        return Err(libc::EACCES);
                    }
                    if offset + len > self.objects[*object].len() as u64 {
                        return Err(libc::EINVAL);
                    }
                    Some(*object)
                }
                Some(_) => return Err(libc::ENODEV),
                None => return Err(libc::EBADF),
            }
        };

        let base = if flags & MAP_FIXED != 0 {
            if addr % PAGE_SIZE != 0 {
                return Err(libc::EINVAL);
            }
            addr
        } else {
            let base = self.next_map;
            self.next_map += len + PAGE_SIZE;
            base
        };

        for i in 0..len / PAGE_SIZE {
            let backing = match object {
                Some(object) => Backing::Object { object, index: offset / PAGE_SIZE + i },
                None => Backing::Anon(vec![0u8; PAGE_SIZE as usize].into_boxed_slice()),
            };
            self.pages.insert(base + i * PAGE_SIZE, Page { prot, backing });
        }
        Ok(base)
    }

    /// Emulated library functions; `None` if `addr` is not one.
    fn function(&mut self, addr: u64, args: [u64; 6]) -> Option<Result<u64, i32>> {
        Some(match addr {
            ERRNO_FN => Ok(ERRNO_CELL),
            PIPE_FN => {
                let read_end = self.alloc_fd(FdKind::Pipe);
                let write_end = self.alloc_fd(FdKind::Pipe);
                let mut fds = (read_end as u32).to_le_bytes().to_vec();
                fds.extend_from_slice(&(write_end as u32).to_le_bytes());
                if self.poke(args[0], &fds) {
                    Ok(0)
                } else {
                    Err(libc::EFAULT)
                }
            }
            PROC_PARAM_FN => Ok(if self.runtime_ready { PROC_PARAM } else { 0 }),
            GETARGV_FN => Ok(ARGV_TABLE),
            _ => return None,
        })
    }

    fn step(&mut self, events: &mut Vec<Event>, failures: &HashMap<i64, i32>, directories: &HashSet<String>) {
        let rip = self.regs.rip;
        if self.ret_at == Some(rip) {
            self.ret_at = None;
            match self.peek_u64(self.regs.rsp) {
                Some(target) => {
                    self.regs.rip = target;
                    self.regs.rsp += 8;
                }
                None => {
                    self.end(StopReason::Signaled(libc::SIGSEGV));
                    return;
                }
            }
        } else if rip == GETPID_FN + STUB_OFFSET {
            let sysno = self.regs.rax as i64;
            events.push(Event::Syscall(self.pid, sysno));
            let result = match failures.get(&sysno) {
                Some(errno) => Err(*errno),
                None => self.syscall(sysno, self.regs.syscall_args(), directories),
            };
            self.complete(result);
            // jb cerror; ret
            self.regs.rip = rip + 2;
            self.ret_at = Some(rip + 2);
        } else if rip == EXIT_FN {
            self.end(StopReason::Exited(0));
            return;
        } else if rip == HANG_FN {
            // jmp .
        } else if let Some(result) = self.function(rip, self.regs.call_args()) {
            events.push(Event::Call(self.pid, rip));
            self.complete(result);
            self.regs.rip = rip + 1;
            self.ret_at = Some(rip + 1);
        } else {
            self.regs.rip = rip + 1;
        }
        self.pending.push_back(StopReason::Stopped(libc::SIGTRAP));
    }

    fn resume(&mut self) {
        match self.phase {
            Phase::Supervisor => self.running = true,
            Phase::Forked => {
                // The child execs the launched title
                self.phase = Phase::AtLoaderEntry;
                self.lay_out();
                self.runtime_ready = true;
                self.lwp = LwpInfo { exec: true, ..LwpInfo::default() };
                self.pending.push_back(StopReason::Stopped(libc::SIGTRAP));
            }
            Phase::Running | Phase::AtLoaderEntry => {
                let site = LOADER_ENTRY + LOADER_MAIN_CALL;
                if self.byte(site) == Some(crate::breakpoint::INT3) {
                    self.regs.rip = site + 1;
                    self.lwp = LwpInfo::default();
                    self.pending.push_back(StopReason::Stopped(libc::SIGTRAP));
                } else {
                    self.end(StopReason::Exited(0));
                }
            }
        }
    }
}

struct World {
    procs: HashMap<Pid, Proc>,
    events: Vec<Event>,
    failures: HashMap<i64, i32>,
    directories: HashSet<String>,
    next_pid: Pid,
    launch_requested: bool,
    elevation_depth: i32,
    max_elevation_depth: i32,
    elevations: usize,
}

impl World {
    fn live(&mut self, pid: Pid) -> io::Result<&mut Proc> {
        match self.procs.get_mut(&pid) {
            Some(proc) if proc.alive() => Ok(proc),
            _ => Err(io::Error::from_raw_os_error(libc::ESRCH)),
        }
    }

    fn traced(&mut self, pid: Pid) -> io::Result<&mut Proc> {
        let proc = self.live(pid)?;
        if !proc.traced {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        Ok(proc)
    }

    fn fork_supervisor_child(&mut self, parent: Pid) -> Pid {
        let child = self.next_pid;
        self.next_pid += 1;
        let mut proc = Proc::new(child, Phase::Forked);
        proc.traced = true;
        proc.pending.push_back(StopReason::Stopped(libc::SIGSTOP));
        self.procs.insert(child, proc);
        if let Some(parent) = self.procs.get_mut(&parent) {
            parent.running = false;
            parent.lwp = LwpInfo { forked: true, exec: false, child_pid: child };
        }
        child
    }
}

/// A set of simulated processes behind the tracing and kernel seams.
pub struct FakeTarget {
    world: Mutex<World>,
    launched: Condvar,
}

impl Default for FakeTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTarget {
    /// One running process ([`FAKE_PID`]) and the supervisor ([`SUPERVISOR_PID`]).
    pub fn new() -> Self {
        let mut procs = HashMap::new();
        procs.insert(FAKE_PID, Proc::new(FAKE_PID, Phase::Running));
        procs.insert(SUPERVISOR_PID, Proc::new(SUPERVISOR_PID, Phase::Supervisor));
        let directories = ["/", "/data", "/data/homebrew", "/app0"].into_iter().map(String::from).collect();
        Self {
            world: Mutex::new(World {
                procs,
                events: Vec::new(),
                failures: HashMap::new(),
                directories,
                next_pid: 2000,
                launch_requested: false,
                elevation_depth: 0,
                max_elevation_depth: 0,
                elevations: 0,
            }),
            launched: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, World> {
        match self.world.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn with_proc<R>(&self, pid: Pid, f: impl FnOnce(&Proc) -> R) -> Option<R> {
        self.lock().procs.get(&pid).map(f)
    }

    pub fn resolver(&self, config: &BridgeConfig) -> DynlibResolver<'_> {
        DynlibResolver::new(self, config.library_handles)
    }

    // ------------------------------------------------------------------
    // Scenario setup
    // ------------------------------------------------------------------

    /// Add an untraced running process.
    pub fn add_process(&self) -> Pid {
        let mut world = self.lock();
        let pid = world.next_pid;
        world.next_pid += 1;
        world.procs.insert(pid, Proc::new(pid, Phase::Running));
        pid
    }

    /// Add a freshly spawned, traced process stopped at its loader entry
    /// after exec, with runtime parameters not yet finished.
    pub fn spawn_traced(&self) -> Pid {
        let mut world = self.lock();
        let pid = world.next_pid;
        world.next_pid += 1;
        let mut proc = Proc::new(pid, Phase::AtLoaderEntry);
        proc.traced = true;
        proc.pending.push_back(StopReason::Stopped(libc::SIGTRAP));
        world.procs.insert(pid, proc);
        pid
    }

    /// Have the supervisor fork an application, as the launcher does.
    pub fn request_launch(&self) {
        let mut world = self.lock();
        world.launch_requested = true;
        world.events.push(Event::Launch);
        self.launched.notify_all();
    }

    pub fn add_directory(&self, path: &str) {
        self.lock().directories.insert(path.to_string());
    }

    /// Make every later syscall `sysno` fail with `errno`.
    pub fn fail_syscall(&self, sysno: i64, errno: i32) {
        self.lock().failures.insert(sysno, errno);
    }

    pub fn clear_failure(&self, sysno: i64) {
        self.lock().failures.remove(&sysno);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.lock().events.clear();
    }

    /// Number of events that changed state inside `pid`.
    pub fn remote_operations(&self, pid: Pid) -> usize {
        self.lock().events.iter().filter(|e| e.touches(pid)).count()
    }

    pub fn syscall_count(&self, pid: Pid, sysno: i64) -> usize {
        self.lock().events.iter().filter(|e| **e == Event::Syscall(pid, sysno)).count()
    }

    pub fn elevations(&self) -> usize {
        self.lock().elevations
    }

    pub fn elevation_depth(&self) -> i32 {
        self.lock().elevation_depth
    }

    pub fn max_elevation_depth(&self) -> i32 {
        self.lock().max_elevation_depth
    }

    pub fn is_alive(&self, pid: Pid) -> bool {
        self.with_proc(pid, |p| p.alive()).unwrap_or(false)
    }

    pub fn is_traced(&self, pid: Pid) -> bool {
        self.with_proc(pid, |p| p.traced).unwrap_or(false)
    }

    pub fn is_rooted(&self, pid: Pid) -> bool {
        self.with_proc(pid, |p| p.rooted).unwrap_or(false)
    }

    pub fn capabilities(&self, pid: Pid) -> Option<Capabilities> {
        self.with_proc(pid, |p| p.caps)
    }

    pub fn registers(&self, pid: Pid) -> Option<Registers> {
        self.with_proc(pid, |p| p.regs)
    }

    pub fn mapped_pages(&self, pid: Pid) -> usize {
        self.with_proc(pid, |p| p.pages.len()).unwrap_or(0)
    }

    /// Protection of the page holding `addr`.
    pub fn page_prot(&self, pid: Pid, addr: u64) -> Option<i32> {
        self.with_proc(pid, |p| p.pages.get(&trunc_page(addr)).map(|page| page.prot)).flatten()
    }

    /// True if the page holding `addr` is backed by a jit object.
    pub fn is_shared(&self, pid: Pid, addr: u64) -> bool {
        self.with_proc(pid, |p| {
            p.pages
                .get(&trunc_page(addr))
                .is_some_and(|page| matches!(page.backing, Backing::Object { .. }))
        })
        .unwrap_or(false)
    }

    /// Read memory bypassing protections. Unmapped bytes read as zero.
    pub fn peek(&self, pid: Pid, addr: u64, len: usize) -> Vec<u8> {
        self.with_proc(pid, |p| (0..len).map(|i| p.byte(addr + i as u64).unwrap_or(0)).collect())
            .unwrap_or_else(|| vec![0; len])
    }

    pub fn peek_u64(&self, pid: Pid, addr: u64) -> u64 {
        let bytes = self.peek(pid, addr, 8);
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes);
        u64::from_le_bytes(word)
    }

    pub fn peek_cstring(&self, pid: Pid, addr: u64) -> Option<String> {
        self.with_proc(pid, |p| p.cstring(addr)).flatten()
    }

    pub fn descriptor(&self, pid: Pid, fd: i32) -> Option<FdKind> {
        self.with_proc(pid, |p| p.fds.get(&fd).cloned()).flatten()
    }

    pub fn open_descriptors(&self, pid: Pid) -> usize {
        self.with_proc(pid, |p| p.fds.len()).unwrap_or(0)
    }

    pub fn cwd(&self, pid: Pid) -> Option<String> {
        self.with_proc(pid, |p| p.cwd.clone())
    }

    /// Options set on sockets of `pid`, as (fd, level, name, value).
    pub fn socket_options(&self, pid: Pid) -> Vec<(i32, i32, i32, Vec<u8>)> {
        self.with_proc(pid, |p| p.socket_options.clone()).unwrap_or_default()
    }

    pub fn thread_name(&self, pid: Pid) -> Option<String> {
        self.with_proc(pid, |p| p.thread_name.clone())
    }

    // ------------------------------------------------------------------
    // Address map
    // ------------------------------------------------------------------

    pub fn symbol(&self, name: &str) -> u64 {
        symbol(name).map(|(_, addr)| addr).unwrap_or(0)
    }

    pub fn data_page(&self) -> u64 {
        DATA_PAGE
    }

    pub fn loader_entry(&self) -> u64 {
        LOADER_ENTRY
    }

    pub fn environ_cell(&self) -> u64 {
        ENVIRON_CELL
    }

    pub fn libc_param(&self) -> u64 {
        LIBC_PARAM
    }

    pub fn heap_size_cell(&self) -> u64 {
        HEAP_SIZE_CELL
    }

    pub fn argv_table(&self) -> u64 {
        ARGV_TABLE
    }

    /// A function that never returns.
    pub fn hang_address(&self) -> u64 {
        HANG_FN
    }

    /// A function that terminates the process.
    pub fn exit_address(&self) -> u64 {
        EXIT_FN
    }
}

fn symbol(name: &str) -> Option<(u32, u64)> {
    Some(match name {
        nid::GETPID => (LIBKERNEL, GETPID_FN),
        nid::ERRNO => (LIBKERNEL, ERRNO_FN),
        nid::PIPE => (LIBKERNEL, PIPE_FN),
        nid::GET_PROC_PARAM => (LIBKERNEL, PROC_PARAM_FN),
        nid::ENVIRON => (LIBC, ENVIRON_CELL),
        nid::GET_ARGV => (LIBC, GETARGV_FN),
        _ => return None,
    })
}

impl Tracer for FakeTarget {
    fn attach(&self, pid: Pid) -> io::Result<()> {
        let mut world = self.lock();
        let proc = world.live(pid)?;
        if proc.traced {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        proc.traced = true;
        proc.pending.push_back(StopReason::Stopped(libc::SIGSTOP));
        world.events.push(Event::Attach(pid));
        Ok(())
    }

    fn detach(&self, pid: Pid, signal: i32) -> io::Result<()> {
        let mut world = self.lock();
        let proc = world.traced(pid)?;
        proc.traced = false;
        proc.pending.clear();
        proc.follow_fork = false;
        proc.lwp_events = false;
        if signal == libc::SIGKILL {
            proc.end(StopReason::Signaled(libc::SIGKILL));
        }
        world.events.push(Event::Detach(pid, signal));
        Ok(())
    }

    fn step(&self, pid: Pid) -> io::Result<()> {
        let mut guard = self.lock();
        let World { procs, events, failures, directories, .. } = &mut *guard;
        match procs.get_mut(&pid) {
            Some(proc) if proc.alive() && proc.traced => {
                proc.step(events, failures, directories);
                Ok(())
            }
            _ => Err(io::Error::from_raw_os_error(libc::ESRCH)),
        }
    }

    fn cont(&self, pid: Pid, signal: i32) -> io::Result<()> {
        let mut world = self.lock();
        world.traced(pid)?.resume();
        world.events.push(Event::Continue(pid, signal));
        Ok(())
    }

    fn follow_fork(&self, pid: Pid, enable: bool) -> io::Result<()> {
        self.lock().traced(pid)?.follow_fork = enable;
        Ok(())
    }

    fn lwp_events(&self, pid: Pid, enable: bool) -> io::Result<()> {
        self.lock().traced(pid)?.lwp_events = enable;
        Ok(())
    }

    fn lwp_info(&self, pid: Pid) -> io::Result<LwpInfo> {
        Ok(self.lock().traced(pid)?.lwp)
    }

    fn get_regs(&self, pid: Pid) -> io::Result<Registers> {
        Ok(self.lock().traced(pid)?.regs)
    }

    fn set_regs(&self, pid: Pid, regs: &Registers) -> io::Result<()> {
        let mut world = self.lock();
        world.traced(pid)?.regs = *regs;
        world.events.push(Event::SetRegs(pid));
        Ok(())
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
        self.lock().traced(pid)?.tracer_read(addr, buf)
    }

    fn write_memory(&self, pid: Pid, addr: u64, data: &[u8]) -> io::Result<()> {
        let mut world = self.lock();
        world.traced(pid)?.tracer_write(addr, data)?;
        world.events.push(Event::Write(pid, addr, data.len()));
        Ok(())
    }

    fn wait(&self, pid: Pid) -> io::Result<StopReason> {
        let mut guard = self.lock();
        loop {
            let world = &mut *guard;
            let Some(proc) = world.procs.get_mut(&pid) else {
                return Err(io::Error::from_raw_os_error(libc::ECHILD));
            };
            if let Some(reason) = proc.pending.pop_front() {
                return Ok(reason);
            }
            if !(proc.phase == Phase::Supervisor && proc.running && proc.traced) {
                return Err(io::Error::from_raw_os_error(libc::ECHILD));
            }
            let follows = proc.follow_fork;
            if world.launch_requested {
                world.launch_requested = false;
                if follows {
                    world.fork_supervisor_child(pid);
                    return Ok(StopReason::Stopped(libc::SIGTRAP));
                }
                continue;
            }

            let (next, timeout) = match self.launched.wait_timeout(guard, WAIT_TIMEOUT) {
                Ok(r) => r,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard = next;
            if timeout.timed_out() && !guard.launch_requested {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no launch observed"));
            }
        }
    }

    fn kill(&self, pid: Pid) -> io::Result<()> {
        let mut world = self.lock();
        world.live(pid)?.end(StopReason::Signaled(libc::SIGKILL));
        world.events.push(Event::Kill(pid));
        Ok(())
    }
}

impl Kernel for FakeTarget {
    fn dynlib_resolve(&self, pid: Pid, handle: u32, nid: &str) -> Option<u64> {
        if !self.is_alive(pid) {
            return None;
        }
        symbol(nid).filter(|(h, _)| *h == handle).map(|(_, addr)| addr)
    }

    fn dynlib_entry_addr(&self, pid: Pid, handle: u32) -> Option<u64> {
        (handle == 0 && self.is_alive(pid)).then_some(LOADER_ENTRY)
    }

    fn mprotect(&self, pid: Pid, addr: u64, len: u64, prot: i32) -> io::Result<()> {
        let mut world = self.lock();
        let proc = world.live(pid)?;
        if !proc.range_mapped(addr, len) {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        for page in (trunc_page(addr)..addr + len).step_by(PAGE_SIZE as usize) {
            if let Some(p) = proc.pages.get_mut(&page) {
                p.prot = prot;
            }
        }
        world.events.push(Event::KernelMprotect(pid, addr, len, prot));
        Ok(())
    }

    fn elevate_self(&self) -> io::Result<Credentials> {
        let mut world = self.lock();
        world.elevations += 1;
        world.elevation_depth += 1;
        world.max_elevation_depth = world.max_elevation_depth.max(world.elevation_depth);
        Ok(Credentials { authid: DEBUGGER_AUTHID ^ 0xff, caps: Capabilities([0x22; 16]) })
    }

    fn restore_self(&self, _saved: Credentials) -> io::Result<()> {
        self.lock().elevation_depth -= 1;
        Ok(())
    }

    fn raise_capabilities(&self, pid: Pid) -> io::Result<Capabilities> {
        let mut world = self.lock();
        let proc = world.live(pid)?;
        let saved = proc.caps;
        proc.caps = Capabilities::ALL;
        world.events.push(Event::RaiseCapabilities(pid));
        Ok(saved)
    }

    fn restore_capabilities(&self, pid: Pid, saved: Capabilities) -> io::Result<()> {
        let mut world = self.lock();
        world.live(pid)?.caps = saved;
        world.events.push(Event::RestoreCapabilities(pid));
        Ok(())
    }

    fn raise_privileges(&self, pid: Pid) -> io::Result<()> {
        let mut world = self.lock();
        let proc = world.live(pid)?;
        proc.rooted = true;
        proc.caps = Capabilities::ALL;
        world.events.push(Event::RaisePrivileges(pid));
        Ok(())
    }

    fn overlap_sockets(&self, pid: Pid, master: i32, victim: i32) -> io::Result<()> {
        let mut world = self.lock();
        let proc = world.live(pid)?;
        let is_socket = |fd| matches!(proc.fds.get(&fd), Some(FdKind::Socket { .. }));
        if !is_socket(master) || !is_socket(victim) {
            return Err(io::Error::from_raw_os_error(libc::ENOTSOCK));
        }
        world.events.push(Event::OverlapSockets(pid, master, victim));
        Ok(())
    }

    fn file_address(&self, pid: Pid, fd: i32) -> Option<u64> {
        self.with_proc(pid, |p| p.fds.contains_key(&fd))
            .unwrap_or(false)
            .then(|| KERNEL_FILE_BASE + fd as u64 * 0x100)
    }

    fn data_base(&self) -> u64 {
        KERNEL_DATA_BASE
    }
}
