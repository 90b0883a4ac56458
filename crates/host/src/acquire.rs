//! Obtaining a traced host process stopped at its loader entry.
//!
//! Two ways in: spawn a trusted helper that asks to be traced, or follow
//! the application supervisor through a fork while it launches the decoy
//! title, then follow the child through its exec.

use std::io;
use std::thread;

use hbldr_bridge::{Bridge, Disposition, TracedProcess};
use hbldr_common::{create_logger, log, log_fail, Error, HostConfig, Result};

use crate::platform::Platform;

/// Report failures to observe the host as acquisition failures.
fn at_stage(stage: &'static str, e: Error) -> Error {
    match e {
        Error::TraceFault { source, .. } => Error::host(stage, source),
        other => other,
    }
}

/// Spawn the helper image as a traced child. The returned process is
/// stopped right after its exec.
pub fn spawn<'a>(
    bridge: &Bridge<'a>,
    platform: &dyn Platform,
    config: &HostConfig,
    argv: &[String],
) -> Result<TracedProcess<'a>> {
    let pid = platform
        .spawn_traced(&config.spawn_helper, &config.debug_devices, argv)
        .map_err(|e| Error::host("spawn helper", e))?;
    log!(create_logger("host"), "spawned pid {} from {}", pid, config.spawn_helper.display());
    Ok(bridge.adopt(pid))
}

/// Capture the process the supervisor forks for the decoy title.
///
/// The supervisor is released without a signal whatever happens to the
/// child; the launcher runs on its own thread because it only returns once
/// the supervisor has been resumed past the fork.
pub fn hijack<'a>(
    bridge: &Bridge<'a>,
    platform: &dyn Platform,
    config: &HostConfig,
    user: u32,
    argv: &[String],
) -> Result<TracedProcess<'a>> {
    let log = create_logger("host");
    let supervisor = platform.find_pid(&config.supervisor_name).ok_or_else(|| {
        Error::host("find supervisor", io::Error::from_raw_os_error(libc::ESRCH))
    })?;

    let mut parent = bridge.attach(supervisor)?;
    parent.set_disposition(Disposition::Release);
    parent.follow_forks()?;
    parent.cont(libc::SIGCONT)?;

    let title_id = config.decoy.title_id.as_str();
    thread::scope(|s| -> Result<TracedProcess<'a>> {
        let launcher = s.spawn(move || platform.launch_app(title_id, argv, user));

        let forked = parent.await_forked_child();
        if let Err(e) = parent.detach(0) {
            log_fail!(log, "releasing supervisor {}: {}", supervisor, e);
        }
        let mut child = forked.map_err(|e| at_stage("await fork", e))?;

        child.follow_exec()?;
        child.cont(libc::SIGCONT)?;
        child.await_exec().map_err(|e| at_stage("await exec", e))?;

        match launcher.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log_fail!(log, "launching {} reported: {}", title_id, e),
            Err(_) => log_fail!(log, "launcher thread panicked"),
        }
        log!(log, "captured pid {} from supervisor {}", child.pid(), supervisor);
        Ok(child)
    })
}
