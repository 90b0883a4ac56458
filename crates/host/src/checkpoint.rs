//! Running a freshly executed host up to its main() call.

use hbldr_bridge::TracedProcess;
use hbldr_common::{create_logger, log, log_detail, Error, HostConfig, Result};
use hbldr_loader::args;

/// Whether the kernel still has to finish a host's runtime parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeParameters {
    /// Directly spawned hosts stop before the kernel assigns them.
    Pending,
    /// Hijacked hosts were launched normally; a failed request is expected.
    MaybeAssigned,
}

/// Bring `process` from its loader entry to the instruction that calls
/// main(), with libc's heap limit lifted. Returns the checkpoint address.
///
/// The loader has finished linking the image by then, so the symbols the
/// later setters need resolve.
pub fn run_to_main(
    process: &mut TracedProcess<'_>,
    config: &HostConfig,
    params: RuntimeParameters,
) -> Result<u64> {
    let log = create_logger("host");
    let pid = process.pid();

    match (process.finish_runtime_parameters(), params) {
        (Ok(()), _) => {}
        (Err(e), RuntimeParameters::MaybeAssigned) if !e.is_trace_fault() => {
            log_detail!(log, "pid {}: runtime parameters already assigned ({})", pid, e);
        }
        (Err(e), _) => return Err(e),
    }
    args::set_heap_size_unlimited(process)?;

    let kernel = process.bridge().kernel();
    let entry = kernel.dynlib_entry_addr(pid, 0).ok_or_else(|| Error::Resolution {
        pid,
        nid: "dynlib entry".to_string(),
    })?;
    let site = entry + config.main_breakpoint_offset;
    process.insert_breakpoint(site)?;
    process.run_to_breakpoint(libc::SIGCONT)?;
    log!(log, "pid {} stopped before main at {:#x}", pid, site);
    Ok(site)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hbldr_bridge::syscalls::SYS_DYNLIB_PROCESS_NEEDED_AND_RELOCATE;
    use hbldr_bridge::testing::{FakeTarget, FAKE_PID};
    use hbldr_bridge::{Bridge, INT3};
    use hbldr_common::BridgeConfig;

    #[test]
    fn test_spawned_host_reaches_main() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);
        let pid = fake.spawn_traced();
        let mut process = bridge.adopt(pid);
        process.wait_stop("spawn").unwrap();

        let site = run_to_main(&mut process, &HostConfig::default(), RuntimeParameters::Pending).unwrap();
        assert_eq!(site, fake.loader_entry() + 58);
        assert_eq!(fake.registers(pid).unwrap().rip, site);
        assert_ne!(fake.peek(pid, site, 1), vec![INT3]);
        assert_eq!(fake.peek_u64(pid, fake.heap_size_cell()), u64::MAX);
        assert!(fake.is_traced(pid));
        process.detach(0).unwrap();
    }

    #[test]
    fn test_runtime_parameter_failure() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);

        // FAKE_PID was started normally, so the kernel refuses a second request
        let mut process = bridge.attach(FAKE_PID).unwrap();
        let err = run_to_main(&mut process, &HostConfig::default(), RuntimeParameters::Pending).unwrap_err();
        assert_eq!(err.raw_os_error(), libc::EINVAL);
        process.detach(0).unwrap();

        let pid = fake.spawn_traced();
        let mut process = bridge.adopt(pid);
        process.wait_stop("spawn").unwrap();
        fake.fail_syscall(SYS_DYNLIB_PROCESS_NEEDED_AND_RELOCATE, libc::EINVAL);
        assert!(run_to_main(&mut process, &HostConfig::default(), RuntimeParameters::Pending).is_err());
        drop(process);
        assert!(!fake.is_alive(pid));
    }

    #[test]
    fn test_configured_offset() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);
        let pid = fake.spawn_traced();
        let mut process = bridge.adopt(pid);
        process.wait_stop("spawn").unwrap();

        // nothing traps at the wrong offset, so the process runs to completion
        let host = HostConfig { main_breakpoint_offset: 0x40, ..HostConfig::default() };
        let err = run_to_main(&mut process, &host, RuntimeParameters::Pending).unwrap_err();
        assert!(err.is_trace_fault());
    }
}
