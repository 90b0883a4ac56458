//! ELF mapper
//!
//! Loads a validated image into a traced process:
//!
//! 1. Reserve one private read/write window covering every PT_LOAD segment,
//!    at the link address for executables and anywhere for position
//!    independent images.
//! 2. Assemble the window locally: segment bytes at their offsets, then
//!    relative relocations patched with the load bias.
//! 3. Copy the window into the target in one transfer.
//! 4. Give each segment its final protection. Anonymous memory can never
//!    become executable on this platform, so executable segments are
//!    replaced by a jit object filled through a writable alias.
//! 5. Sync the window.
//!
//! Any failure after the reservation unmaps the window again.

use hbldr_bridge::syscalls::{
    MAP_ANON, MAP_FIXED, MAP_PRIVATE, MAP_SHARED, MS_SYNC, PROT_EXEC, PROT_READ, PROT_RWX,
    PROT_WRITE,
};
use hbldr_bridge::TracedProcess;
use hbldr_common::{
    create_logger, log, log_detail, log_fail, log_success, round_page, trunc_page, ElfFormatError, Error, Logger,
    Result,
};
use hbldr_elf::{ElfImage, ProgramHeader, PF_R, PF_W, PF_X};

/// Where an image ended up inside the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    pub base: u64,
    pub size: u64,
    pub entry: u64,
}

/// Memory protection for segment flags.
pub fn segment_protection(flags: u32) -> i32 {
    let mut prot = 0;
    if flags & PF_R != 0 {
        prot |= PROT_READ;
    }
    if flags & PF_W != 0 {
        prot |= PROT_WRITE;
    }
    if flags & PF_X != 0 {
        prot |= PROT_EXEC;
    }
    prot
}

/// Parse `bytes` and load them. Malformed images fail before any remote
/// operation is issued.
pub fn load_bytes(process: &mut TracedProcess<'_>, bytes: &[u8]) -> Result<LoadedImage> {
    let image = ElfImage::parse(bytes)?;
    load(process, &image)
}

pub fn load(process: &mut TracedProcess<'_>, image: &ElfImage<'_>) -> Result<LoadedImage> {
    let log = create_logger("elfldr");
    let size = image.window_size();
    let mirror = assemble(image)?;

    let (hint, flags) = if image.is_position_independent() {
        (0, MAP_ANON | MAP_PRIVATE)
    } else {
        (image.min_vaddr, MAP_ANON | MAP_PRIVATE | MAP_FIXED)
    };
    let base = process.mmap(hint, size, PROT_READ | PROT_WRITE, flags, -1, 0)?;
    log!(log, "pid {}: window {:#x}..{:#x}", process.pid(), base, base + size);

    log.push_indent();
    let populated = populate(process, image, mirror, base, &log);
    log.pop_indent();

    match populated {
        Ok(()) => {
            let loaded = LoadedImage { base, size, entry: base + image.entry_offset() };
            log_success!(log, "pid {}: image loaded, entry {:#x}", process.pid(), loaded.entry);
            Ok(loaded)
        }
        Err(e) => {
            log_fail!(log, "pid {}: load failed: {}", process.pid(), e);
            if process.is_attached() {
                if let Err(unmap) = process.munmap(base, size) {
                    log_fail!(log, "pid {}: window {:#x} left mapped: {}", process.pid(), base, unmap);
                }
            }
            Err(e)
        }
    }
}

/// Local copy of the window with every segment's file bytes in place.
fn assemble(image: &ElfImage<'_>) -> Result<Vec<u8>> {
    let size = usize::try_from(image.window_size()).map_err(|_| window_too_large(image))?;
    let mut mirror = Vec::new();
    mirror.try_reserve_exact(size).map_err(|_| window_too_large(image))?;
    mirror.resize(size, 0);
    for phdr in image.loadable_segments() {
        // Reserved only
        if phdr.memsz == 0 || phdr.filesz == 0 {
            continue;
        }
        let at = (phdr.vaddr - image.min_vaddr) as usize;
        let data = image.segment_data(phdr);
        mirror[at..at + data.len()].copy_from_slice(data);
    }
    Ok(mirror)
}

fn window_too_large(image: &ElfImage<'_>) -> Error {
    ElfFormatError::WindowTooLarge { size: image.window_size() }.into()
}

fn relocate(image: &ElfImage<'_>, mirror: &mut [u8], base: u64) {
    let bias = base.wrapping_sub(image.min_vaddr);
    for rela in image.relative_relocations() {
        let at = (rela.offset - image.min_vaddr) as usize;
        let value = bias.wrapping_add(rela.addend as u64);
        mirror[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }
}

fn populate(
    process: &mut TracedProcess<'_>,
    image: &ElfImage<'_>,
    mut mirror: Vec<u8>,
    base: u64,
    log: &Logger,
) -> Result<()> {
    relocate(image, &mut mirror, base);
    if image.skipped_relocations() > 0 {
        log_detail!(log, "pid {}: {} non-relative relocations skipped", process.pid(), image.skipped_relocations());
    }
    process.write_bytes(base, &mirror)?;

    for phdr in image.loadable_segments().filter(|p| p.memsz > 0) {
        let (offset, len) = page_span(image, phdr);
        let addr = base + offset;
        let prot = segment_protection(phdr.flags);
        if phdr.is_executable() {
            let bytes = &mirror[offset as usize..(offset + len) as usize];
            map_executable(process, addr, len, prot, bytes)?;
        } else {
            process.mprotect(addr, len, prot)?;
        }
        log_detail!(log, "pid {}: segment {:#x}+{:#x} prot {}", process.pid(), addr, len, prot);
    }

    process.msync(base, image.window_size(), MS_SYNC)
}

/// Page-aligned range of a segment, as (offset into the window, length).
fn page_span(image: &ElfImage<'_>, phdr: &ProgramHeader) -> (u64, u64) {
    let start = trunc_page(phdr.vaddr);
    let end = round_page(phdr.vaddr + phdr.memsz);
    (start - image.min_vaddr, end - start)
}

/// Replace `addr..addr+len` with a jit object holding `bytes`.
fn map_executable(process: &mut TracedProcess<'_>, addr: u64, len: u64, prot: i32, bytes: &[u8]) -> Result<()> {
    let object = process.jitshm_create(0, len, PROT_RWX)?;
    let result = fill_object(process, object, len, bytes)
        .and_then(|()| process.mmap(addr, len, prot, MAP_SHARED | MAP_FIXED, object, 0).map(|_| ()));
    let closed = process.close(object);
    result.and(closed)
}

fn fill_object(process: &mut TracedProcess<'_>, object: i32, len: u64, bytes: &[u8]) -> Result<()> {
    let alias = process.jitshm_alias(object, PROT_READ | PROT_WRITE)?;
    let written = write_through_alias(process, alias, len, bytes);
    let closed = process.close(alias);
    written.and(closed)
}

fn write_through_alias(process: &mut TracedProcess<'_>, alias: i32, len: u64, bytes: &[u8]) -> Result<()> {
    let writable = process.mmap(0, len, PROT_READ | PROT_WRITE, MAP_SHARED, alias, 0)?;
    let copied = process.write_bytes(writable, bytes);
    let unmapped = process.munmap(writable, len);
    copied.and(unmapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hbldr_bridge::syscalls::{SYS_JITSHM_CREATE, SYS_MPROTECT};
    use hbldr_bridge::testing::{FakeTarget, FAKE_PID};
    use hbldr_bridge::Bridge;
    use hbldr_common::{BridgeConfig, PAGE_SIZE};
    use hbldr_elf::{ImageBuilder, ET_DYN, ET_EXEC};

    fn pie() -> Vec<u8> {
        ImageBuilder::new(ET_DYN)
            .segment(0, PF_R | PF_X, vec![0xc3; 0x40], 0x40)
            .segment(0x1000, PF_R | PF_W, (0..0x20).collect(), 0x1800)
            .relative(0x1008, 0x20)
            .relative(0x1010, 0x1000)
            .entry(0x10)
            .build()
    }

    #[test]
    fn test_segment_protection() {
        assert_eq!(segment_protection(PF_R), PROT_READ);
        assert_eq!(segment_protection(PF_R | PF_X), PROT_READ | PROT_EXEC);
        assert_eq!(segment_protection(PF_R | PF_W | PF_X), PROT_RWX);
        assert_eq!(segment_protection(0), 0);
    }

    #[test]
    fn test_relocations_use_load_base() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);
        let mut process = bridge.attach(FAKE_PID).unwrap();

        let bytes = pie();
        let loaded = load_bytes(&mut process, &bytes).unwrap();
        assert_eq!(loaded.size, 0x3000);
        assert_eq!(loaded.entry, loaded.base + 0x10);

        assert_eq!(fake.peek_u64(FAKE_PID, loaded.base + 0x1008), loaded.base + 0x20);
        assert_eq!(fake.peek_u64(FAKE_PID, loaded.base + 0x1010), loaded.base + 0x1000);
        // Untouched data bytes survive
        assert_eq!(fake.peek(FAKE_PID, loaded.base + 0x1000, 8), (0..8).collect::<Vec<u8>>());
        assert_eq!(fake.peek(FAKE_PID, loaded.base + 0x1018, 8), (0x18..0x20).collect::<Vec<u8>>());
        // Beyond the file size the segment is zero filled
        assert_eq!(fake.peek(FAKE_PID, loaded.base + 0x1020, 8), vec![0; 8]);
        process.detach(0).unwrap();
    }

    #[test]
    fn test_executable_segment_is_jit_backed() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);
        let mut process = bridge.attach(FAKE_PID).unwrap();
        let descriptors = fake.open_descriptors(FAKE_PID);

        let loaded = load_bytes(&mut process, &pie()).unwrap();
        assert!(fake.is_shared(FAKE_PID, loaded.base));
        assert_eq!(fake.page_prot(FAKE_PID, loaded.base), Some(PROT_READ | PROT_EXEC));
        assert_eq!(fake.peek(FAKE_PID, loaded.base, 4), vec![0xc3; 4]);

        assert!(!fake.is_shared(FAKE_PID, loaded.base + 0x1000));
        assert_eq!(fake.page_prot(FAKE_PID, loaded.base + 0x2000), Some(PROT_READ | PROT_WRITE));
        // Both jit descriptors are closed again
        assert_eq!(fake.open_descriptors(FAKE_PID), descriptors);
        process.detach(0).unwrap();
    }

    #[test]
    fn test_executable_image_at_link_address() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);
        let mut process = bridge.attach(FAKE_PID).unwrap();

        let bytes = ImageBuilder::new(ET_EXEC)
            .segment(0x40_0000, PF_R | PF_X, vec![0x90; 0x100], 0x100)
            .segment(0x40_1000, PF_R, b"rodata".to_vec(), 6)
            .entry(0x40_0020)
            .build();
        let loaded = load_bytes(&mut process, &bytes).unwrap();
        assert_eq!(loaded.base, 0x40_0000);
        assert_eq!(loaded.entry, 0x40_0020);
        assert_eq!(fake.peek(FAKE_PID, 0x40_1000, 6), b"rodata".to_vec());
        assert_eq!(fake.page_prot(FAKE_PID, 0x40_1000), Some(PROT_READ));
        process.detach(0).unwrap();
    }

    #[test]
    fn test_bad_magic_touches_nothing() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);
        let mut process = bridge.attach(FAKE_PID).unwrap();

        let mut bytes = pie();
        bytes[1] = b'X';
        let err = load_bytes(&mut process, &bytes).unwrap_err();
        assert!(matches!(err, Error::ElfFormat(_)));
        assert_eq!(fake.remote_operations(FAKE_PID), 0);
        process.detach(0).unwrap();
    }

    #[test]
    fn test_oversized_window_touches_nothing() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);
        let mut process = bridge.attach(FAKE_PID).unwrap();
        let pages = fake.mapped_pages(FAKE_PID);

        let bytes = ImageBuilder::new(ET_DYN)
            .segment(0, PF_R | PF_X, vec![0xc3; 8], 8)
            .segment(0x9000_0000_0000_0000, PF_R, vec![0; 8], 8)
            .build();
        let err = load_bytes(&mut process, &bytes).unwrap_err();
        assert!(matches!(err, Error::ElfFormat(ElfFormatError::WindowTooLarge { .. })));
        assert_eq!(err.raw_os_error(), libc::ENOEXEC);
        assert_eq!(fake.remote_operations(FAKE_PID), 0);
        assert_eq!(fake.mapped_pages(FAKE_PID), pages);
        process.detach(0).unwrap();
    }

    #[test]
    fn test_failure_unmaps_window() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);
        let mut process = bridge.attach(FAKE_PID).unwrap();
        let pages = fake.mapped_pages(FAKE_PID);

        fake.fail_syscall(SYS_JITSHM_CREATE, libc::ENOMEM);
        let err = load_bytes(&mut process, &pie()).unwrap_err();
        assert!(matches!(err, Error::Mapping { op: "jitshm_create", errno: libc::ENOMEM, .. }));
        assert_eq!(fake.mapped_pages(FAKE_PID), pages);
        process.detach(0).unwrap();
    }

    #[test]
    fn test_protection_failure_unmaps_window() {
        let fake = FakeTarget::new();
        let config = BridgeConfig::default();
        let resolver = fake.resolver(&config);
        let bridge = Bridge::new(&fake, &fake, &resolver, &config);
        let mut process = bridge.attach(FAKE_PID).unwrap();
        let pages = fake.mapped_pages(FAKE_PID);

        fake.fail_syscall(SYS_MPROTECT, libc::EPERM);
        assert!(load_bytes(&mut process, &pie()).is_err());
        assert_eq!(fake.mapped_pages(FAKE_PID), pages);
        process.detach(0).unwrap();
    }

    #[test]
    fn test_assemble_skips_reserved_segments() {
        let bytes = ImageBuilder::new(ET_DYN)
            .segment(0, PF_R | PF_X, vec![1; 16], 16)
            .segment(0x1000, PF_R | PF_W, Vec::new(), 0x2000)
            .entry(0)
            .build();
        let image = ElfImage::parse(&bytes).unwrap();
        let mirror = assemble(&image).unwrap();
        assert_eq!(mirror.len() as u64, 3 * PAGE_SIZE);
        assert_eq!(&mirror[..16], &[1; 16]);
        assert!(mirror[16..].iter().all(|b| *b == 0));
    }
}
