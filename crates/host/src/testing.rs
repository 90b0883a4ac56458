//! Platform double backed by the simulated target.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use hbldr_bridge::testing::{FakeTarget, SUPERVISOR_PID};
use hbldr_bridge::Tracer;
use hbldr_common::Pid;

use crate::platform::Platform;

pub const OWN_PID: Pid = 10;
pub const FOREGROUND_USER: u32 = 0x1000_0001;

struct BigApp {
    id: i32,
    killed: bool,
    /// Polls that still report the app running after the kill.
    lingering: u32,
}

pub struct FakePlatform<'a> {
    target: &'a FakeTarget,
    supervisor: Option<Pid>,
    fail_launch: bool,
    big_app: Mutex<Option<BigApp>>,
    launches: Mutex<Vec<(String, Vec<String>, u32)>>,
    spawned: Mutex<Vec<Vec<String>>>,
    remounts: AtomicUsize,
}

impl<'a> FakePlatform<'a> {
    pub fn new(target: &'a FakeTarget) -> Self {
        Self {
            target,
            supervisor: Some(SUPERVISOR_PID),
            fail_launch: false,
            big_app: Mutex::new(None),
            launches: Mutex::new(Vec::new()),
            spawned: Mutex::new(Vec::new()),
            remounts: AtomicUsize::new(0),
        }
    }

    pub fn without_supervisor(mut self) -> Self {
        self.supervisor = None;
        self
    }

    /// The launcher errors out without the supervisor forking.
    pub fn failing_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    /// A big app that keeps running for `lingering` polls after being killed.
    pub fn with_big_app(self, id: i32, lingering: u32) -> Self {
        *self.big_app.lock().unwrap() = Some(BigApp { id, killed: false, lingering });
        self
    }

    pub fn big_app_killed(&self) -> bool {
        self.big_app.lock().unwrap().as_ref().map_or(false, |app| app.killed)
    }

    pub fn launches(&self) -> Vec<(String, Vec<String>, u32)> {
        self.launches.lock().unwrap().clone()
    }

    pub fn spawned(&self) -> Vec<Vec<String>> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn remounts(&self) -> usize {
        self.remounts.load(Ordering::SeqCst)
    }
}

impl Platform for FakePlatform<'_> {
    fn own_pid(&self) -> Pid {
        OWN_PID
    }

    fn find_pid(&self, name: &str) -> Option<Pid> {
        (name == "SceSysCore.elf").then_some(self.supervisor).flatten()
    }

    fn foreground_user(&self) -> io::Result<u32> {
        Ok(FOREGROUND_USER)
    }

    fn running_big_app(&self) -> Option<i32> {
        self.big_app.lock().unwrap().as_ref().filter(|app| !app.killed).map(|app| app.id)
    }

    fn kill_app(&self, app_id: i32) -> io::Result<()> {
        match self.big_app.lock().unwrap().as_mut() {
            Some(app) if app.id == app_id => {
                app.killed = true;
                Ok(())
            }
            _ => Err(io::Error::from_raw_os_error(libc::ESRCH)),
        }
    }

    fn app_running(&self, app_id: i32) -> bool {
        let mut app = self.big_app.lock().unwrap();
        match app.as_mut() {
            Some(app) if app.id == app_id => {
                if !app.killed {
                    return true;
                }
                if app.lingering == 0 {
                    return false;
                }
                app.lingering -= 1;
                true
            }
            _ => false,
        }
    }

    fn launch_app(&self, title_id: &str, argv: &[String], user: u32) -> io::Result<()> {
        self.launches.lock().unwrap().push((title_id.to_string(), argv.to_vec(), user));
        if self.fail_launch {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        self.target.request_launch();
        Ok(())
    }

    fn spawn_traced(&self, _helper: &Path, _devices: &[PathBuf; 3], argv: &[String]) -> io::Result<Pid> {
        self.spawned.lock().unwrap().push(argv.to_vec());
        let pid = self.target.spawn_traced();
        // the child has already stopped after its exec
        self.target.wait(pid)?;
        Ok(pid)
    }

    fn remount_system(&self) -> io::Result<()> {
        self.remounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
