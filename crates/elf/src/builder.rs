//! Synthesis of small x86-64 ELF images.
//!
//! Produces images with explicit PT_LOAD segments and an optional RELA
//! section, the shapes the loader has to handle. Used to build payloads for
//! tests and for quick probes on the console.

use hbldr_common::{round_page, PAGE_SIZE};

use crate::elf64::{
    generate_elf_header, generate_program_header, generate_rela, generate_section_header,
    ELF64_EHDR_SIZE, ELF64_PHDR_SIZE, ELF64_RELA_SIZE, PT_LOAD, R_X86_64_RELATIVE, SHT_RELA,
};

#[derive(Debug, Clone)]
struct Segment {
    vaddr: u64,
    flags: u32,
    data: Vec<u8>,
    memsz: u64,
}

#[derive(Debug, Clone)]
pub struct ImageBuilder {
    e_type: u16,
    entry: u64,
    segments: Vec<Segment>,
    relocations: Vec<(u64, u32, i64)>,
}

impl ImageBuilder {
    pub fn new(e_type: u16) -> Self {
        Self { e_type, entry: 0, segments: Vec::new(), relocations: Vec::new() }
    }

    pub fn entry(mut self, entry: u64) -> Self {
        self.entry = entry;
        self
    }

    /// Add a PT_LOAD segment whose file bytes are `data`.
    pub fn segment(mut self, vaddr: u64, flags: u32, data: Vec<u8>, memsz: u64) -> Self {
        self.segments.push(Segment { vaddr, flags, data, memsz });
        self
    }

    /// Add an R_X86_64_RELATIVE record.
    pub fn relative(self, offset: u64, addend: i64) -> Self {
        self.relocation(offset, R_X86_64_RELATIVE, addend)
    }

    pub fn relocation(mut self, offset: u64, r_type: u32, addend: i64) -> Self {
        self.relocations.push((offset, r_type, addend));
        self
    }

    /// Lay out and encode the image.
    ///
    /// Layout:
    /// - ELF header and program headers
    /// - each segment's bytes at a page-aligned file offset congruent to its vaddr
    /// - RELA table (8-byte aligned), then a null and a RELA section header
    pub fn build(&self) -> Vec<u8> {
        let num_phdrs = self.segments.len() as u16;
        let headers_size = ELF64_EHDR_SIZE + ELF64_PHDR_SIZE * num_phdrs as usize;

        let mut cursor = headers_size as u64;
        let mut offsets = Vec::with_capacity(self.segments.len());
        for seg in &self.segments {
            let offset = round_page(cursor) + (seg.vaddr % PAGE_SIZE);
            offsets.push(offset);
            cursor = offset + seg.data.len() as u64;
        }

        let rela_offset = (cursor + 7) & !7;
        let rela_size = (self.relocations.len() * ELF64_RELA_SIZE) as u64;
        let (shoff, shnum) = if self.relocations.is_empty() {
            (0, 0)
        } else {
            (rela_offset + rela_size, 2)
        };

        let mut elf = Vec::new();
        elf.extend_from_slice(&generate_elf_header(self.e_type, self.entry, num_phdrs, shoff, shnum));
        for (seg, offset) in self.segments.iter().zip(&offsets) {
            elf.extend_from_slice(&generate_program_header(
                PT_LOAD,
                *offset,
                seg.vaddr,
                seg.data.len() as u64,
                seg.memsz,
                seg.flags,
                PAGE_SIZE,
            ));
        }

        for (seg, offset) in self.segments.iter().zip(&offsets) {
            elf.resize(*offset as usize, 0);
            elf.extend_from_slice(&seg.data);
        }

        if !self.relocations.is_empty() {
            elf.resize(rela_offset as usize, 0);
            for (offset, r_type, addend) in &self.relocations {
                elf.extend_from_slice(&generate_rela(*offset, *r_type, *addend));
            }
            elf.extend_from_slice(&[0u8; 64]);
            elf.extend_from_slice(&generate_section_header(
                SHT_RELA,
                rela_offset,
                rela_size,
                ELF64_RELA_SIZE as u64,
            ));
        }

        elf
    }
}
