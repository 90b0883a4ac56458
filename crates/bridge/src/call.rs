//! Staged calls
//!
//! A call runs inside the target by borrowing its current thread: the
//! registers are snapshotted, the instruction pointer is redirected to the
//! callee with arguments in registers and a return marker on the stack, and
//! the thread is single-stepped until the stack pointer rises above the
//! staged baseline, which only the callee's final `ret` does. The result is
//! taken from rax and the snapshot is reinstalled.

use std::io;

use hbldr_common::{log_detail, log_fail, Error, Result};

use crate::process::TracedProcess;
use crate::registers::{Registers, MAX_ARGS};

/// Bytes below the stack pointer the interrupted code may still own.
const RED_ZONE: u64 = 128;

#[derive(Debug, Clone, Copy)]
enum Callee {
    Function(u64),
    Syscall(i64),
}

impl TracedProcess<'_> {
    /// Call the function at `addr` with up to six integer arguments.
    pub fn call(&mut self, addr: u64, args: &[u64]) -> Result<u64> {
        self.staged(Callee::Function(addr), args)
    }

    /// Issue syscall `sysno` from inside the target. Returns the raw result,
    /// -1 on failure with the reason left in the target's errno.
    pub fn syscall(&mut self, sysno: i64, args: &[u64]) -> Result<i64> {
        self.staged(Callee::Syscall(sysno), args).map(|ret| ret as i64)
    }

    /// Address of the syscall instruction used to enter the kernel.
    pub fn syscall_stub(&mut self) -> Result<u64> {
        if let Some(stub) = self.syscall_stub {
            return Ok(stub);
        }
        let config = self.bridge().config();
        let stub = self.resolve(config.syscall_stub_nid)? + config.syscall_stub_offset;
        self.syscall_stub = Some(stub);
        Ok(stub)
    }

    fn staged(&mut self, callee: Callee, args: &[u64]) -> Result<u64> {
        let pid = self.pid();
        if args.len() > MAX_ARGS {
            return Err(Error::trace(
                pid,
                "stage call",
                io::Error::new(io::ErrorKind::InvalidInput, "more than six arguments"),
            ));
        }

        let original = self.get_registers()?;
        // Return marker slot: below the red zone, as if pushed by a call
        let baseline = original
            .rsp
            .checked_sub(RED_ZONE)
            .and_then(|top| (top & !0xf).checked_sub(8))
            .ok_or_else(|| {
                Error::trace(
                    pid,
                    "stage call",
                    io::Error::new(io::ErrorKind::InvalidData, format!("stack pointer {:#x} too low", original.rsp)),
                )
            })?;

        let mut staged = original;
        match callee {
            Callee::Function(addr) => {
                staged.rip = addr;
                staged.set_call_args(args);
            }
            Callee::Syscall(sysno) => {
                staged.rip = self.syscall_stub()?;
                staged.set_syscall_args(sysno, args);
            }
        }

        self.write_word(baseline, original.rip)?;
        staged.rsp = baseline;
        self.set_registers(&staged)?;
        log_detail!(self.log, "pid {}: staged {:?} rsp={:#x}", pid, callee, baseline);

        let ret = match self.step_until_return(baseline) {
            Ok(regs) => regs.return_value(),
            Err(e) => {
                if self.is_attached() {
                    if let Err(restore) = self.set_registers(&original) {
                        log_fail!(self.log, "pid {}: registers not restored: {}", pid, restore);
                    }
                }
                return Err(e);
            }
        };

        self.set_registers(&original)?;
        Ok(ret)
    }

    fn step_until_return(&mut self, baseline: u64) -> Result<Registers> {
        let limit = self.bridge().config().step_limit;
        for _ in 0..limit {
            self.step()?;
            let regs = self.get_registers()?;
            if regs.rsp > baseline {
                return Ok(regs);
            }
        }
        log_fail!(self.log, "pid {}: call did not return within {} steps", self.pid(), limit);
        Err(Error::trace(
            self.pid(),
            "step",
            io::Error::new(io::ErrorKind::TimedOut, "step limit exhausted"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Bridge;
    use crate::syscalls::SYS_GETPID;
    use crate::testing::{Event, FakeTarget, FAKE_PID};
    use hbldr_common::BridgeConfig;

    #[test]
    fn test_syscall_restores_registers() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);

        let mut process = bridge.attach(FAKE_PID).unwrap();
        let before = process.get_registers().unwrap();
        assert_eq!(process.syscall(SYS_GETPID, &[]).unwrap(), FAKE_PID as i64);
        assert_eq!(process.get_registers().unwrap(), before);
        process.detach(0).unwrap();
    }

    #[test]
    fn test_syscall_enters_through_stub() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);

        let mut process = bridge.attach(FAKE_PID).unwrap();
        process.syscall(SYS_GETPID, &[]).unwrap();
        let stub = process.syscall_stub().unwrap();
        assert_eq!(stub, fake.symbol(crate::resolver::nid::GETPID) + 0xa);
        assert!(fake.events().contains(&Event::Syscall(FAKE_PID, SYS_GETPID)));
        process.detach(0).unwrap();
    }

    #[test]
    fn test_return_marker_respects_red_zone() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);

        let mut process = bridge.attach(FAKE_PID).unwrap();
        let regs = process.get_registers().unwrap();
        // Data just below rsp belongs to the interrupted code
        process.write_word(regs.rsp - 8, 0x1122_3344).unwrap();
        process.write_word(regs.rsp - 120, 0x5566_7788).unwrap();
        process.syscall(SYS_GETPID, &[]).unwrap();
        assert_eq!(process.read_word(regs.rsp - 8).unwrap(), 0x1122_3344);
        assert_eq!(process.read_word(regs.rsp - 120).unwrap(), 0x5566_7788);
        process.detach(0).unwrap();
    }

    #[test]
    fn test_low_stack_pointer_is_a_trace_fault() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);

        let mut process = bridge.attach(FAKE_PID).unwrap();
        let mut regs = process.get_registers().unwrap();
        regs.rsp = 0x40;
        process.set_registers(&regs).unwrap();
        fake.clear_events();

        let err = process.syscall(SYS_GETPID, &[]).unwrap_err();
        match err {
            Error::TraceFault { op, source, .. } => {
                assert_eq!(op, "stage call");
                assert_eq!(source.kind(), io::ErrorKind::InvalidData);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(fake.remote_operations(FAKE_PID), 0);
        assert_eq!(process.get_registers().unwrap(), regs);
        process.detach(0).unwrap();
    }

    #[test]
    fn test_step_limit_is_a_trace_fault() {
        let fake = FakeTarget::new();
        let config = BridgeConfig { step_limit: 50, ..BridgeConfig::default() };
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);

        let mut process = bridge.attach(FAKE_PID).unwrap();
        let before = process.get_registers().unwrap();
        let err = process.call(fake.hang_address(), &[]).unwrap_err();
        match err {
            Error::TraceFault { source, .. } => assert_eq!(source.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected error {other:?}"),
        }
        // Registers are put back even though the call never returned
        assert_eq!(process.get_registers().unwrap(), before);
        process.detach(0).unwrap();
    }

    #[test]
    fn test_target_exit_during_call() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);

        let mut process = bridge.attach(FAKE_PID).unwrap();
        let err = process.call(fake.exit_address(), &[]).unwrap_err();
        assert!(err.is_trace_fault());
        assert!(!process.is_attached());
    }

    #[test]
    fn test_too_many_arguments() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);

        let mut process = bridge.attach(FAKE_PID).unwrap();
        let err = process.call(0x1000, &[0; 7]).unwrap_err();
        assert!(err.is_trace_fault());
        assert!(!fake.events().iter().any(|e| matches!(e, Event::SetRegs(_))));
        process.detach(0).unwrap();
    }
}
