//! Platform services used to obtain a host process.

use std::io;
use std::path::{Path, PathBuf};

use hbldr_common::Pid;

/// System services outside the tracing facility.
///
/// Implementations must be shareable across threads: launching an
/// application blocks, so it runs beside the thread awaiting the fork.
pub trait Platform: Sync {
    /// Pid of the engine's own process.
    fn own_pid(&self) -> Pid;

    /// A process whose main thread is called `name`, other than our own.
    fn find_pid(&self, name: &str) -> Option<Pid>;

    fn foreground_user(&self) -> io::Result<u32>;

    /// App id of the running big application, if any.
    fn running_big_app(&self) -> Option<i32>;

    fn kill_app(&self, app_id: i32) -> io::Result<()>;

    /// True while `app_id` has not finished terminating.
    fn app_running(&self, app_id: i32) -> bool;

    /// Ask the system to launch `title_id` for `user`. Blocks until the
    /// launcher returns.
    fn launch_app(&self, title_id: &str, argv: &[String], user: u32) -> io::Result<()>;

    /// Start a child with its standard descriptors on `devices` that
    /// requests tracing and executes `helper`. Returns once the child is
    /// stopped after the exec.
    fn spawn_traced(&self, helper: &Path, devices: &[PathBuf; 3], argv: &[String]) -> io::Result<Pid>;

    /// Remount the system application partition writable.
    fn remount_system(&self) -> io::Result<()>;
}
