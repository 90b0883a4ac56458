//! Validated view of a loadable ELF64 image.
//!
//! Every structural check happens in [`ElfImage::parse`], so a caller that
//! holds an `ElfImage` can map it without further bounds checking and a
//! malformed image is rejected before anything touches the target process.

use hbldr_common::{round_page, trunc_page, ElfFormatError, PAGE_SIZE};

use crate::elf64::{
    FileHeader, ProgramHeader, Rela, SectionHeader, ELF64_EHDR_SIZE, ELF64_PHDR_SIZE,
    ELF64_RELA_SIZE, ELF64_SHDR_SIZE, ELFCLASS64, ELFDATA2LSB, ELF_MAGIC, ET_DYN, ET_EXEC,
    R_X86_64_RELATIVE, SHT_RELA,
};

#[derive(Debug, Clone)]
pub struct ElfImage<'a> {
    bytes: &'a [u8],
    pub header: FileHeader,
    pub program_headers: Vec<ProgramHeader>,
    pub section_headers: Vec<SectionHeader>,
    /// Lowest PT_LOAD address, truncated to a page.
    pub min_vaddr: u64,
    /// Highest PT_LOAD end address, rounded to a page.
    pub max_vaddr: u64,
    relocations: Vec<Rela>,
    skipped_relocations: usize,
}

/// Largest load window accepted. The mapper assembles the whole window
/// locally before copying it over, so this bounds that allocation too.
pub const MAX_WINDOW_SIZE: u64 = 1 << 30;

fn table_end(off: u64, count: u64, entsize: u64) -> Option<u64> {
    count.checked_mul(entsize).and_then(|len| off.checked_add(len))
}

impl<'a> ElfImage<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ElfFormatError> {
        let have = bytes.len() as u64;
        if bytes.len() < ELF64_EHDR_SIZE {
            if bytes.len() >= 4 && bytes[0..4] != ELF_MAGIC {
                return Err(ElfFormatError::BadMagic);
            }
            return Err(ElfFormatError::Truncated {
                what: "file header",
                needed: ELF64_EHDR_SIZE as u64,
                have,
            });
        }
        if bytes[0..4] != ELF_MAGIC {
            return Err(ElfFormatError::BadMagic);
        }

        let header = FileHeader::decode(bytes);
        if header.class != ELFCLASS64 {
            return Err(ElfFormatError::UnsupportedClass(header.class));
        }
        if header.data != ELFDATA2LSB {
            return Err(ElfFormatError::UnsupportedEncoding(header.data));
        }
        if header.e_type != ET_EXEC && header.e_type != ET_DYN {
            return Err(ElfFormatError::UnsupportedType(header.e_type));
        }

        let program_headers = Self::parse_program_headers(bytes, &header)?;
        let section_headers = Self::parse_section_headers(bytes, &header)?;

        let mut min_vaddr = u64::MAX;
        let mut max_vaddr = 0u64;
        for (index, phdr) in program_headers.iter().enumerate() {
            if !phdr.is_load() {
                continue;
            }
            if phdr.filesz > phdr.memsz {
                return Err(ElfFormatError::FileSizeExceedsMemSize {
                    index,
                    filesz: phdr.filesz,
                    memsz: phdr.memsz,
                });
            }
            match phdr.offset.checked_add(phdr.filesz) {
                Some(end) if end <= have => {}
                _ => return Err(ElfFormatError::SegmentOutOfFile { index }),
            }
            let end = phdr
                .vaddr
                .checked_add(phdr.memsz)
                .filter(|end| *end <= u64::MAX - PAGE_SIZE)
                .ok_or(ElfFormatError::SegmentOutOfFile { index })?;
            min_vaddr = min_vaddr.min(phdr.vaddr);
            max_vaddr = max_vaddr.max(end);
        }
        if min_vaddr == u64::MAX {
            return Err(ElfFormatError::NoLoadableSegments);
        }
        let min_vaddr = trunc_page(min_vaddr);
        let max_vaddr = round_page(max_vaddr);
        if max_vaddr - min_vaddr > MAX_WINDOW_SIZE {
            return Err(ElfFormatError::WindowTooLarge { size: max_vaddr - min_vaddr });
        }

        if header.entry < min_vaddr || header.entry >= max_vaddr {
            return Err(ElfFormatError::EntryOutOfRange { entry: header.entry });
        }

        let mut image = Self {
            bytes,
            header,
            program_headers,
            section_headers,
            min_vaddr,
            max_vaddr,
            relocations: Vec::new(),
            skipped_relocations: 0,
        };
        image.collect_relocations()?;
        Ok(image)
    }

    fn parse_program_headers(
        bytes: &[u8],
        header: &FileHeader,
    ) -> Result<Vec<ProgramHeader>, ElfFormatError> {
        if header.phnum == 0 {
            return Ok(Vec::new());
        }
        if header.phentsize as usize != ELF64_PHDR_SIZE {
            return Err(ElfFormatError::BadHeaderSize { what: "program header", size: header.phentsize });
        }
        let end = table_end(header.phoff, header.phnum as u64, ELF64_PHDR_SIZE as u64);
        match end {
            Some(end) if end <= bytes.len() as u64 => {}
            _ => {
                return Err(ElfFormatError::Truncated {
                    what: "program header table",
                    needed: end.unwrap_or(u64::MAX),
                    have: bytes.len() as u64,
                })
            }
        }
        Ok((0..header.phnum as usize)
            .map(|i| {
                let off = header.phoff as usize + i * ELF64_PHDR_SIZE;
                ProgramHeader::decode(&bytes[off..off + ELF64_PHDR_SIZE])
            })
            .collect())
    }

    fn parse_section_headers(
        bytes: &[u8],
        header: &FileHeader,
    ) -> Result<Vec<SectionHeader>, ElfFormatError> {
        if header.shnum == 0 || header.shoff == 0 {
            return Ok(Vec::new());
        }
        if header.shentsize as usize != ELF64_SHDR_SIZE {
            return Err(ElfFormatError::BadHeaderSize { what: "section header", size: header.shentsize });
        }
        let end = table_end(header.shoff, header.shnum as u64, ELF64_SHDR_SIZE as u64);
        match end {
            Some(end) if end <= bytes.len() as u64 => {}
            _ => {
                return Err(ElfFormatError::Truncated {
                    what: "section header table",
                    needed: end.unwrap_or(u64::MAX),
                    have: bytes.len() as u64,
                })
            }
        }
        Ok((0..header.shnum as usize)
            .map(|i| {
                let off = header.shoff as usize + i * ELF64_SHDR_SIZE;
                SectionHeader::decode(&bytes[off..off + ELF64_SHDR_SIZE])
            })
            .collect())
    }

    fn collect_relocations(&mut self) -> Result<(), ElfFormatError> {
        let have = self.bytes.len() as u64;
        for shdr in self.section_headers.iter().filter(|s| s.sh_type == SHT_RELA) {
            if shdr.entsize != 0 && shdr.entsize != ELF64_RELA_SIZE as u64 {
                return Err(ElfFormatError::BadHeaderSize {
                    what: "relocation",
                    size: shdr.entsize.min(u16::MAX as u64) as u16,
                });
            }
            match shdr.offset.checked_add(shdr.size) {
                Some(end) if end <= have => {}
                _ => {
                    return Err(ElfFormatError::Truncated {
                        what: "relocation table",
                        needed: shdr.offset.saturating_add(shdr.size),
                        have,
                    })
                }
            }
            let count = shdr.size as usize / ELF64_RELA_SIZE;
            for i in 0..count {
                let off = shdr.offset as usize + i * ELF64_RELA_SIZE;
                let rela = Rela::decode(&self.bytes[off..off + ELF64_RELA_SIZE]);
                if rela.r_type() != R_X86_64_RELATIVE {
                    self.skipped_relocations += 1;
                    continue;
                }
                let in_window = rela.offset >= self.min_vaddr
                    && rela.offset.checked_add(8).is_some_and(|end| end <= self.max_vaddr);
                if !in_window {
                    return Err(ElfFormatError::RelocationOutOfRange { offset: rela.offset });
                }
                self.relocations.push(rela);
            }
        }
        Ok(())
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn is_position_independent(&self) -> bool {
        self.header.e_type == ET_DYN
    }

    /// Size of the contiguous virtual window covering every PT_LOAD segment.
    pub fn window_size(&self) -> u64 {
        self.max_vaddr - self.min_vaddr
    }

    /// Entry point relative to the start of the window.
    pub fn entry_offset(&self) -> u64 {
        self.header.entry - self.min_vaddr
    }

    pub fn loadable_segments(&self) -> impl Iterator<Item = &ProgramHeader> {
        self.program_headers.iter().filter(|p| p.is_load())
    }

    /// File bytes backing a segment. Bounds were checked during parsing.
    pub fn segment_data(&self, phdr: &ProgramHeader) -> &'a [u8] {
        let start = phdr.offset as usize;
        &self.bytes[start..start + phdr.filesz as usize]
    }

    /// R_X86_64_RELATIVE entries, each known to lie inside the window.
    pub fn relative_relocations(&self) -> &[Rela] {
        &self.relocations
    }

    /// Number of relocation records of other types, which are not applied.
    pub fn skipped_relocations(&self) -> usize {
        self.skipped_relocations
    }
}
