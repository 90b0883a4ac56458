//! Handing a stopped process over to a new image.

use hbldr_bridge::TracedProcess;
use hbldr_common::{create_logger, log, Result};
use hbldr_elf::ElfImage;

use crate::mapper::{self, LoadedImage};
use crate::payload;

/// Load `image` and point the saved register state at its entry.
///
/// The interrupted instruction pointer is pushed as a return address, so a
/// payload returning from its entry resumes the original code.
pub fn prepare(process: &mut TracedProcess<'_>, image: &ElfImage<'_>) -> Result<LoadedImage> {
    let mut regs = process.get_registers()?;
    let loaded = mapper::load(process, image)?;
    let args = payload::build(process)?;

    regs.rsp -= 8;
    process.write_word(regs.rsp, regs.rip)?;
    regs.rip = loaded.entry;
    regs.rdi = args.address;
    process.set_registers(&regs)?;
    Ok(loaded)
}

/// Load `elf` into the process and let it run.
///
/// Capabilities are raised for the duration of the load and put back before
/// the process resumes. On failure the handle is dropped and its
/// disposition applies.
pub fn exec(mut process: TracedProcess<'_>, elf: &[u8]) -> Result<LoadedImage> {
    let image = ElfImage::parse(elf)?;
    let saved = process.raise_capabilities()?;
    let loaded = prepare(&mut process, &image)?;
    process.restore_capabilities(saved)?;

    let pid = process.pid();
    process.detach(libc::SIGCONT)?;
    log!(create_logger("elfldr"), "pid {} running from {:#x}", pid, loaded.entry);
    Ok(loaded)
}
