//! Launch engine
//!
//! The operations the front end calls: spawn an image into a fresh host,
//! load one into an existing process, launch homebrew through the decoy
//! title, or launch an installed title as is.

use std::fs::{self, File};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;

use hbldr_bridge::{Bridge, DynlibResolver, Kernel, TracedProcess, Tracer};
use hbldr_common::{create_logger, log, log_detail, log_fail, Config, Error, HostConfig, Logger, Pid, Result};
use hbldr_elf::ElfImage;
use hbldr_loader::args;

use crate::acquire;
use crate::checkpoint::{self, RuntimeParameters};
use crate::cmdline::split_args;
use crate::decoy;
use crate::platform::Platform;
use crate::state::{Launch, LaunchState};

/// Caller input for one launch.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    /// Working directory of the new process; `/` when absent.
    pub cwd: Option<String>,
    /// Descriptor of ours that becomes the process's stdout and stderr.
    pub stdio: Option<RawFd>,
    pub argv: Vec<String>,
    pub envp: Vec<String>,
}

pub struct Engine<'a> {
    bridge: Bridge<'a>,
    platform: &'a dyn Platform,
    config: &'a HostConfig,
    log: Logger,
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn resolve_path(cwd: Option<&str>, path: &str) -> PathBuf {
    match cwd {
        Some(cwd) if !path.starts_with('/') => Path::new(cwd).join(path),
        _ => PathBuf::from(path),
    }
}

fn pipe() -> io::Result<(File, OwnedFd)> {
    let mut fds = [0; 2];
    // SAFETY: fds has room for the two descriptors
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe() returned two fresh descriptors we now own
    unsafe { Ok((File::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

#[cfg(target_os = "freebsd")]
fn no_sigpipe(stream: &UnixStream) -> io::Result<()> {
    let on: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &on as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "freebsd"))]
fn no_sigpipe(_stream: &UnixStream) -> io::Result<()> {
    Ok(())
}

/// Assemble an engine over the given services and hand it to `body`.
///
/// Symbols are resolved through the kernel's dynlib lookup with the
/// configured library handles.
pub fn run_engine<R>(
    tracer: &dyn Tracer,
    kernel: &dyn Kernel,
    platform: &dyn Platform,
    config: &Config,
    body: impl FnOnce(&Engine<'_>) -> R,
) -> R {
    let resolver = DynlibResolver::new(kernel, config.bridge.library_handles);
    let bridge = Bridge::new(tracer, kernel, &resolver, &config.bridge);
    body(&Engine::new(bridge, platform, &config.host))
}

impl<'a> Engine<'a> {
    pub fn new(bridge: Bridge<'a>, platform: &'a dyn Platform, config: &'a HostConfig) -> Self {
        Self { bridge, platform, config, log: create_logger("engine") }
    }

    pub fn config(&self) -> &HostConfig {
        self.config
    }

    /// Run `elf` in a freshly spawned host.
    ///
    /// The image is validated before any process exists. Once one does, any
    /// failure kills it.
    pub fn spawn(&self, elf: &[u8], request: &LaunchRequest) -> Result<Pid> {
        let image = ElfImage::parse(elf)?;
        let mut launch = Launch::new();
        let result = self.spawn_host(&mut launch, &image, request);
        if let Err(e) = &result {
            log_fail!(self.log, "spawn failed: {}", e);
            launch.fail();
        }
        result
    }

    fn spawn_host(&self, launch: &mut Launch, image: &ElfImage<'_>, request: &LaunchRequest) -> Result<Pid> {
        let mut process = acquire::spawn(&self.bridge, self.platform, self.config, &request.argv)?;
        launch.advance(LaunchState::Spawned)?;

        process.raise_privileges()?;
        checkpoint::run_to_main(&mut process, self.config, RuntimeParameters::Pending)?;
        launch.advance(LaunchState::StoppedAtEntry)?;

        let name = request.argv.first().map_or(self.config.default_process_name.as_str(), String::as_str);
        args::set_process_name(&mut process, name)?;
        self.configure(&mut process, request)?;
        self.release(launch, process, image)
    }

    /// Launch homebrew at `path` through the decoy title.
    ///
    /// Relative paths are taken from the request's cwd. Any running big
    /// application is terminated first.
    pub fn hijack(&self, path: &str, request: &LaunchRequest) -> Result<Pid> {
        decoy::ensure(&self.config.decoy, || self.platform.remount_system())?;
        let user = self.platform.foreground_user().map_err(|e| Error::host("foreground user", e))?;
        self.terminate_big_app()?;

        let file = resolve_path(request.cwd.as_deref(), path);
        let elf = fs::read(&file)?;
        let image = ElfImage::parse(&elf)?;

        let mut launch = Launch::new();
        let result = self.hijack_host(&mut launch, user, path, &image, request);
        if let Err(e) = &result {
            log_fail!(self.log, "launching {} failed: {}", file.display(), e);
            launch.fail();
        }
        result
    }

    fn hijack_host(
        &self,
        launch: &mut Launch,
        user: u32,
        path: &str,
        image: &ElfImage<'_>,
        request: &LaunchRequest,
    ) -> Result<Pid> {
        let mut process = acquire::hijack(&self.bridge, self.platform, self.config, user, &request.argv)?;
        launch.advance(LaunchState::Hijacked)?;

        process.raise_privileges()?;
        checkpoint::run_to_main(&mut process, self.config, RuntimeParameters::MaybeAssigned)?;
        launch.advance(LaunchState::StoppedAtEntry)?;

        args::set_argv0(&mut process, path)?;
        args::set_process_name(&mut process, basename(path))?;
        self.configure(&mut process, request)?;
        self.release(launch, process, image)
    }

    fn configure(&self, process: &mut TracedProcess<'_>, request: &LaunchRequest) -> Result<()> {
        args::set_environ(process, &request.envp)?;
        args::set_cwd(process, request.cwd.as_deref())?;
        if let Some(fd) = request.stdio {
            args::set_stdio(process, self.platform.own_pid(), fd)?;
        }
        Ok(())
    }

    fn release(&self, launch: &mut Launch, mut process: TracedProcess<'_>, image: &ElfImage<'_>) -> Result<Pid> {
        let saved = process.raise_capabilities()?;
        let loaded = hbldr_loader::prepare(&mut process, image)?;
        launch.advance(LaunchState::Patched)?;
        process.restore_capabilities(saved)?;

        let pid = process.pid();
        process.detach(libc::SIGCONT)?;
        launch.advance(LaunchState::Running)?;
        log!(self.log, "pid {} running {:#x}+{:#x}", pid, loaded.base, loaded.size);
        Ok(pid)
    }

    /// Load `elf` into the running process `pid`.
    pub fn exec_into(&self, pid: Pid, elf: &[u8]) -> Result<()> {
        let image = ElfImage::parse(elf)?;
        let mut process = self.bridge.attach(pid)?;
        process.raise_privileges()?;
        let saved = process.raise_capabilities()?;
        let loaded = hbldr_loader::prepare(&mut process, &image)?;
        process.restore_capabilities(saved)?;
        process.detach(libc::SIGCONT)?;
        log!(self.log, "pid {} now running {:#x}", pid, loaded.entry);
        Ok(())
    }

    /// Launch an installed title without loading anything into it.
    pub fn launch_hosted_title(&self, title_id: &str, argv: &[String]) -> Result<()> {
        let user = self.platform.foreground_user().map_err(|e| Error::host("foreground user", e))?;
        self.terminate_big_app()?;
        self.platform.launch_app(title_id, argv, user).map_err(|e| Error::host("launch title", e))?;
        log!(self.log, "launched {} for user {:#x}", title_id, user);
        Ok(())
    }

    /// Spawn `elf` with its output on a pipe. `args` and `env` are split
    /// with [`split_args`].
    pub fn launch_payload(&self, cwd: Option<&str>, elf: &[u8], args: &str, env: &str) -> Result<(Pid, File)> {
        let (read, write) = pipe()?;
        let request = LaunchRequest {
            cwd: cwd.map(str::to_string),
            stdio: Some(write.as_raw_fd()),
            argv: split_args(args),
            envp: split_args(env),
        };
        let pid = self.spawn(elf, &request)?;
        drop(write);
        Ok((pid, read))
    }

    /// Launch homebrew at `path` with its output on a socket.
    pub fn launch_homebrew(&self, cwd: Option<&str>, path: &str, args: &str, env: &str) -> Result<(Pid, UnixStream)> {
        let (read, write) = UnixStream::pair()?;
        no_sigpipe(&write)?;
        let request = LaunchRequest {
            cwd: cwd.map(str::to_string),
            stdio: Some(write.as_raw_fd()),
            argv: split_args(args),
            envp: split_args(env),
        };
        let pid = self.hijack(path, &request)?;
        drop(write);
        Ok((pid, read))
    }

    /// Kill the running big application, if any, and wait for it to go.
    fn terminate_big_app(&self) -> Result<()> {
        let Some(app_id) = self.platform.running_big_app() else {
            return Ok(());
        };
        self.platform.kill_app(app_id).map_err(|e| Error::host("kill app", e))?;
        for _ in 0..self.config.app_exit_attempts {
            if !self.platform.app_running(app_id) {
                log_detail!(self.log, "app {:#x} terminated", app_id);
                return Ok(());
            }
            log_detail!(self.log, "waiting for app {:#x} to terminate", app_id);
            thread::sleep(self.config.app_exit_poll);
        }
        let still_running = io::Error::new(io::ErrorKind::TimedOut, format!("app {app_id:#x} still running"));
        Err(Error::host("await app exit", still_running))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use hbldr_bridge::syscalls::SYS_CHDIR;
    use hbldr_bridge::testing::{Event, FakeTarget, FdKind, FAKE_PID, SUPERVISOR_PID};
    use hbldr_common::{BridgeConfig, DecoyConfig};
    use hbldr_elf::{ImageBuilder, ET_DYN, PF_R, PF_X};
    use tempfile::TempDir;

    use crate::testing::{FakePlatform, FOREGROUND_USER, OWN_PID};

    fn payload() -> Vec<u8> {
        ImageBuilder::new(ET_DYN).segment(0, PF_R | PF_X, vec![0x90; 0x10], 0x10).entry(4).build()
    }

    fn host_config(dir: &TempDir) -> HostConfig {
        let base = dir.path().join("base.bin");
        fs::write(&base, b"\x7fELF").unwrap();
        HostConfig {
            app_exit_poll: Duration::from_millis(1),
            app_exit_attempts: 5,
            decoy: DecoyConfig { root: dir.path().join("FAKE00000"), base_executable: base, ..DecoyConfig::default() },
            ..HostConfig::default()
        }
    }

    fn with_engine(
        platform: impl FnOnce(FakePlatform<'_>) -> FakePlatform<'_>,
        test: impl FnOnce(&FakeTarget, &FakePlatform<'_>, &Engine<'_>, &TempDir),
    ) {
        let dir = TempDir::new().unwrap();
        let fake = FakeTarget::new();
        let platform = platform(FakePlatform::new(&fake));
        let bridge_config = BridgeConfig::default();
        let resolver = fake.resolver(&bridge_config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &bridge_config);
        let config = host_config(&dir);
        let engine = Engine::new(bridge, &platform, &config);
        test(&fake, &platform, &engine, &dir);
    }

    fn spawned_pids(fake: &FakeTarget) -> Vec<Pid> {
        let mut pids: Vec<Pid> = fake
            .events()
            .iter()
            .filter_map(|e| match e {
                Event::Syscall(pid, _) | Event::Call(pid, _) => Some(*pid),
                _ => None,
            })
            .filter(|pid| *pid != FAKE_PID && *pid != SUPERVISOR_PID)
            .collect();
        pids.dedup();
        pids
    }

    #[test]
    fn test_run_engine_uses_config() {
        let fake = FakeTarget::new();
        let platform = FakePlatform::new(&fake);
        let mut config = Config::default();
        config.host.default_process_name = "from-config".to_string();

        let pid = run_engine(&fake, &fake, &platform, &config, |engine| {
            assert_eq!(engine.config().default_process_name, "from-config");
            engine.spawn(&payload(), &LaunchRequest::default()).unwrap()
        });
        assert!(fake.is_alive(pid));
        assert_eq!(fake.thread_name(pid).as_deref(), Some("from-config"));
    }

    #[test]
    fn test_spawn_runs_payload() {
        with_engine(|p| p, |fake, platform, engine, _| {
            let request = LaunchRequest {
                cwd: Some("/data".to_string()),
                stdio: Some(5),
                argv: vec!["hello.elf".to_string(), "-v".to_string()],
                envp: vec!["LANG=C".to_string()],
            };
            let pid = engine.spawn(&payload(), &request).unwrap();

            assert!(fake.is_alive(pid));
            assert!(!fake.is_traced(pid));
            assert!(fake.is_rooted(pid));
            assert_eq!(platform.spawned(), vec![request.argv.clone()]);
            assert_eq!(fake.thread_name(pid).as_deref(), Some("hello.elf"));
            assert_eq!(fake.cwd(pid).as_deref(), Some("/data"));
            assert_eq!(fake.descriptor(pid, 1), Some(FdKind::Remote { owner: OWN_PID, fd: 5 }));
            assert_eq!(fake.peek_u64(pid, fake.heap_size_cell()), u64::MAX);
            assert!(fake.events().contains(&Event::Detach(pid, libc::SIGCONT)));
        });
    }

    #[test]
    fn test_spawn_default_name() {
        with_engine(|p| p, |fake, _, engine, _| {
            let pid = engine.spawn(&payload(), &LaunchRequest::default()).unwrap();
            assert_eq!(fake.thread_name(pid).as_deref(), Some("payload"));
            assert_eq!(fake.cwd(pid).as_deref(), Some("/"));
        });
    }

    #[test]
    fn test_spawn_rejects_bad_image_first() {
        with_engine(|p| p, |fake, platform, engine, _| {
            let err = engine.spawn(b"MZ\x90\x00", &LaunchRequest::default()).unwrap_err();
            assert!(matches!(err, Error::ElfFormat(_)));
            assert_eq!(err.raw_os_error(), libc::ENOEXEC);
            assert!(platform.spawned().is_empty());
            assert!(fake.events().is_empty());
        });
    }

    #[test]
    fn test_spawn_failure_kills_host() {
        with_engine(|p| p, |fake, _, engine, _| {
            fake.fail_syscall(SYS_CHDIR, libc::EACCES);
            let request = LaunchRequest { cwd: Some("/data".to_string()), ..LaunchRequest::default() };
            let err = engine.spawn(&payload(), &request).unwrap_err();
            assert_eq!(err.raw_os_error(), libc::EACCES);

            let pids = spawned_pids(fake);
            assert_eq!(pids.len(), 1);
            assert!(!fake.is_alive(pids[0]));
            assert!(fake.events().contains(&Event::Detach(pids[0], libc::SIGKILL)));
        });
    }

    #[test]
    fn test_exec_into_running_process() {
        with_engine(|p| p, |fake, _, engine, _| {
            engine.exec_into(FAKE_PID, &payload()).unwrap();
            assert!(fake.is_alive(FAKE_PID));
            assert!(fake.is_rooted(FAKE_PID));
            assert!(!fake.is_traced(FAKE_PID));
            assert!(fake.events().contains(&Event::Detach(FAKE_PID, libc::SIGCONT)));
        });
    }

    #[test]
    fn test_hijack_runs_homebrew() {
        with_engine(|p| p.with_big_app(0x60, 2), |fake, platform, engine, dir| {
            let cwd = dir.path().to_str().unwrap().to_string();
            fs::write(dir.path().join("app.elf"), payload()).unwrap();
            fake.add_directory(&cwd);

            let request = LaunchRequest {
                cwd: Some(cwd.clone()),
                stdio: Some(9),
                argv: vec!["app.elf".to_string()],
                envp: vec![],
            };
            let pid = engine.hijack("app.elf", &request).unwrap();

            assert!(platform.big_app_killed());
            assert_eq!(platform.launches(), vec![("FAKE00000".to_string(), request.argv.clone(), FOREGROUND_USER)]);
            assert!(dir.path().join("FAKE00000/sce_sys/param.json").exists());
            assert_eq!(platform.remounts(), 0);

            assert!(fake.is_alive(pid));
            assert!(!fake.is_traced(pid));
            assert!(!fake.is_traced(SUPERVISOR_PID));
            let argv0 = fake.peek_u64(pid, fake.argv_table());
            assert_eq!(fake.peek_cstring(pid, argv0).as_deref(), Some("app.elf"));
            assert_eq!(fake.thread_name(pid).as_deref(), Some("app.elf"));
            assert_eq!(fake.cwd(pid), Some(cwd));
            assert_eq!(fake.descriptor(pid, 2), Some(FdKind::Remote { owner: OWN_PID, fd: 9 }));
        });
    }

    #[test]
    fn test_hijack_missing_file() {
        with_engine(|p| p, |fake, platform, engine, dir| {
            let request = LaunchRequest { cwd: dir.path().to_str().map(str::to_string), ..LaunchRequest::default() };
            let err = engine.hijack("absent.elf", &request).unwrap_err();
            assert!(matches!(err, Error::Io(_)));
            assert_eq!(err.raw_os_error(), libc::ENOENT);
            assert!(platform.launches().is_empty());
            assert!(fake.events().is_empty());
        });
    }

    #[test]
    fn test_big_app_that_never_exits() {
        with_engine(|p| p.with_big_app(0x60, 100), |_, platform, engine, _| {
            let err = engine.launch_hosted_title("PPSA00000", &[]).unwrap_err();
            assert!(matches!(err, Error::HostAcquisition { stage: "await app exit", .. }));
            assert!(platform.launches().is_empty());
        });
    }

    #[test]
    fn test_launch_hosted_title() {
        with_engine(|p| p.with_big_app(0x60, 0), |fake, platform, engine, _| {
            let argv = vec!["--mode".to_string()];
            engine.launch_hosted_title("PPSA01234", &argv).unwrap();
            assert!(platform.big_app_killed());
            assert_eq!(platform.launches(), vec![("PPSA01234".to_string(), argv, FOREGROUND_USER)]);
            assert!(fake.events().iter().all(|e| *e == Event::Launch));
        });
    }

    #[test]
    fn test_launch_payload_wires_pipe() {
        with_engine(|p| p, |fake, platform, engine, _| {
            let (pid, _read) = engine.launch_payload(Some("/data"), &payload(), r"prog a\ b", "X=1 Y=2").unwrap();
            assert_eq!(platform.spawned(), vec![vec!["prog".to_string(), "a b".to_string()]]);
            assert!(matches!(fake.descriptor(pid, 1), Some(FdKind::Remote { owner: OWN_PID, .. })));
            assert_eq!(fake.cwd(pid).as_deref(), Some("/data"));
        });
    }

    #[test]
    fn test_launch_homebrew_wires_socket() {
        with_engine(|p| p, |fake, _, engine, dir| {
            let path = dir.path().join("hb.elf");
            fs::write(&path, payload()).unwrap();
            let path = path.to_str().unwrap().to_string();

            let (pid, _read) = engine.launch_homebrew(None, &path, "hb.elf", "").unwrap();
            assert!(matches!(fake.descriptor(pid, 1), Some(FdKind::Remote { owner: OWN_PID, .. })));
            assert_eq!(fake.thread_name(pid).as_deref(), Some("hb.elf"));
            assert_eq!(fake.cwd(pid).as_deref(), Some("/"));
        });
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(basename("/data/homebrew/app.elf"), "app.elf");
        assert_eq!(basename("app.elf"), "app.elf");
        assert_eq!(resolve_path(Some("/data"), "x.elf"), PathBuf::from("/data/x.elf"));
        assert_eq!(resolve_path(Some("/data"), "/abs/x.elf"), PathBuf::from("/abs/x.elf"));
        assert_eq!(resolve_path(None, "x.elf"), PathBuf::from("x.elf"));
    }
}
