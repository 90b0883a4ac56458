//! Process arguments builder
//!
//! Setters that configure a stopped process before its new image runs.
//! Strings that only feed a syscall live in scratch pages released right
//! after the call; strings the process keeps referring to (environment,
//! argv[0]) get pages that stay mapped for the life of the process.

use hbldr_bridge::{nid, TracedProcess};
use hbldr_common::{create_logger, log_detail, log_fail, round_page, Pid, Result};

const STDOUT: i32 = 1;
const STDERR: i32 = 2;

/// Install `envp` (`KEY=value` strings) as the process environment.
///
/// The table and its strings share one mapping: `n + 1` pointers, the last
/// null, followed by the NUL-terminated strings in order.
pub fn set_environ(process: &mut TracedProcess<'_>, envp: &[String]) -> Result<()> {
    if envp.is_empty() {
        return Ok(());
    }
    let log = create_logger("procargs");
    let environ = process.resolve(nid::ENVIRON)?;

    let table_len = (envp.len() + 1) * 8;
    let size = table_len + envp.iter().map(|s| s.len() + 1).sum::<usize>();
    let addr = process.alloc_scratch(round_page(size as u64))?;

    let mut block = Vec::with_capacity(size);
    let mut strings = Vec::with_capacity(size - table_len);
    for var in envp {
        block.extend_from_slice(&(addr + (table_len + strings.len()) as u64).to_le_bytes());
        strings.extend_from_slice(var.as_bytes());
        strings.push(0);
    }
    block.extend_from_slice(&0u64.to_le_bytes());
    block.extend_from_slice(&strings);

    let installed = process
        .write_bytes(addr, &block)
        .and_then(|()| process.write_word(environ, addr));
    if let Err(e) = installed {
        if process.is_attached() {
            if let Err(release) = process.release_scratch(addr, size as u64) {
                log_fail!(log, "pid {}: environment block {:#x} leaked: {}", process.pid(), addr, release);
            }
        }
        return Err(e);
    }
    log_detail!(log, "pid {}: {} environment variables at {:#x}", process.pid(), envp.len(), addr);
    Ok(())
}

/// Change the working directory; `None` means `/`.
pub fn set_cwd(process: &mut TracedProcess<'_>, cwd: Option<&str>) -> Result<()> {
    let cwd = cwd.unwrap_or("/");
    process.with_scratch(cwd.len() as u64 + 1, |p, buf| {
        p.write_cstring(buf, cwd)?;
        p.chdir(buf)
    })?;
    log_detail!(create_logger("procargs"), "pid {}: cwd {}", process.pid(), cwd);
    Ok(())
}

/// Rename the process's main thread.
pub fn set_process_name(process: &mut TracedProcess<'_>, name: &str) -> Result<()> {
    process.with_scratch(name.len() as u64 + 1, |p, buf| {
        p.write_cstring(buf, name)?;
        p.set_thread_name(buf)
    })
}

/// Point stdout and stderr at descriptor `fd` of process `owner`.
pub fn set_stdio(process: &mut TracedProcess<'_>, owner: Pid, fd: i32) -> Result<()> {
    let copy = process.rdup(owner, fd)?;
    let bound = process
        .dup2(copy, STDOUT)
        .and_then(|_| process.dup2(copy, STDERR))
        .map(|_| ());
    let log = create_logger("procargs");
    if let Err(e) = bound {
        if process.is_attached() {
            if let Err(close) = process.close(copy) {
                log_fail!(log, "pid {}: descriptor {} leaked: {}", process.pid(), copy, close);
            }
        }
        return Err(e);
    }
    process.close(copy)?;
    log_detail!(log, "pid {}: stdio from {}:{}", process.pid(), owner, fd);
    Ok(())
}

/// Lift libc's heap size limit.
///
/// The limit lives behind the process parameter block: procparam+56 points
/// at the libc parameter block, whose +16 points at the limit. libc honours
/// the new value only when the flag at +32 mirrors the one at +72.
pub fn set_heap_size_unlimited(process: &mut TracedProcess<'_>) -> Result<()> {
    let proc_param = process.proc_param()?;
    let libc_param = process.read_word(proc_param + 56)?;
    let heap_size = process.read_word(libc_param + 16)?;
    process.write_word(heap_size, u64::MAX)?;

    let need_libc = process.read_word(libc_param + 72)?;
    process.write_word(libc_param + 32, need_libc)?;
    log_detail!(create_logger("procargs"), "pid {}: heap unlimited", process.pid());
    Ok(())
}

/// Replace argv[0] of the process.
pub fn set_argv0(process: &mut TracedProcess<'_>, value: &str) -> Result<()> {
    let table = process.argv_table()?;
    let len = value.len() as u64 + 1;
    let addr = process.alloc_scratch(len)?;
    let installed = process
        .write_cstring(addr, value)
        .and_then(|()| process.write_word(table, addr));
    if let Err(e) = installed {
        if process.is_attached() {
            if let Err(release) = process.release_scratch(addr, len) {
                log_fail!(create_logger("procargs"), "pid {}: argv[0] {:#x} leaked: {}", process.pid(), addr, release);
            }
        }
        return Err(e);
    }
    Ok(())
}
