//! ELF64 on-disk structures for x86-64 images
//!
//! Raw little-endian header records, decoded without external dependencies,
//! plus the matching encoders used to synthesize images.

/// ELF64 header size
pub const ELF64_EHDR_SIZE: usize = 64;
/// ELF64 program header size
pub const ELF64_PHDR_SIZE: usize = 56;
/// ELF64 section header size
pub const ELF64_SHDR_SIZE: usize = 64;
/// ELF64 RELA entry size
pub const ELF64_RELA_SIZE: usize = 24;

/// ELF magic number
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
/// ELF class: 64-bit
pub const ELFCLASS64: u8 = 2;
/// ELF data encoding: little endian
pub const ELFDATA2LSB: u8 = 1;
/// ELF version
const EV_CURRENT: u8 = 1;
/// ELF OS/ABI: FreeBSD
const ELFOSABI_FREEBSD: u8 = 9;

/// ELF type: executable
pub const ET_EXEC: u16 = 2;
/// ELF type: shared object / position-independent executable
pub const ET_DYN: u16 = 3;
/// Machine type: x86-64
pub const EM_X86_64: u16 = 62;

/// Program header type: loadable segment
pub const PT_LOAD: u32 = 1;
/// Segment flags: executable
pub const PF_X: u32 = 0x1;
/// Segment flags: writable
pub const PF_W: u32 = 0x2;
/// Segment flags: readable
pub const PF_R: u32 = 0x4;

/// Section type: relocation entries with addends
pub const SHT_RELA: u32 = 4;

/// Relocation type: load base + addend
pub const R_X86_64_RELATIVE: u32 = 8;

fn u16_at(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn u32_at(b: &[u8], off: usize) -> u32 {
    let mut v = [0u8; 4];
    v.copy_from_slice(&b[off..off + 4]);
    u32::from_le_bytes(v)
}

fn u64_at(b: &[u8], off: usize) -> u64 {
    let mut v = [0u8; 8];
    v.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(v)
}

/// Decoded ELF64 file header (the fields the loader consumes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub class: u8,
    pub data: u8,
    pub e_type: u16,
    pub machine: u16,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
}

impl FileHeader {
    /// Decode from the first [`ELF64_EHDR_SIZE`] bytes. The caller checks length.
    pub fn decode(b: &[u8]) -> Self {
        Self {
            class: b[4],
            data: b[5],
            e_type: u16_at(b, 16),
            machine: u16_at(b, 18),
            entry: u64_at(b, 24),
            phoff: u64_at(b, 32),
            shoff: u64_at(b, 40),
            phentsize: u16_at(b, 54),
            phnum: u16_at(b, 56),
            shentsize: u16_at(b, 58),
            shnum: u16_at(b, 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

impl ProgramHeader {
    pub fn decode(b: &[u8]) -> Self {
        Self {
            p_type: u32_at(b, 0),
            flags: u32_at(b, 4),
            offset: u64_at(b, 8),
            vaddr: u64_at(b, 16),
            filesz: u64_at(b, 32),
            memsz: u64_at(b, 40),
            align: u64_at(b, 48),
        }
    }

    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }

    pub fn is_executable(&self) -> bool {
        self.flags & PF_X != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    pub sh_type: u32,
    pub offset: u64,
    pub size: u64,
    pub entsize: u64,
}

impl SectionHeader {
    pub fn decode(b: &[u8]) -> Self {
        Self {
            sh_type: u32_at(b, 4),
            offset: u64_at(b, 24),
            size: u64_at(b, 32),
            entsize: u64_at(b, 56),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rela {
    pub offset: u64,
    pub info: u64,
    pub addend: i64,
}

impl Rela {
    pub fn decode(b: &[u8]) -> Self {
        Self {
            offset: u64_at(b, 0),
            info: u64_at(b, 8),
            addend: u64_at(b, 16) as i64,
        }
    }

    pub fn r_type(&self) -> u32 {
        (self.info & 0xffff_ffff) as u32
    }
}

/// Generate an ELF64 header
pub fn generate_elf_header(
    e_type: u16,
    entry_point: u64,
    phdr_count: u16,
    shoff: u64,
    shdr_count: u16,
) -> [u8; ELF64_EHDR_SIZE] {
    let mut header = [0u8; ELF64_EHDR_SIZE];

    // e_ident (16 bytes)
    header[0..4].copy_from_slice(&ELF_MAGIC);
    header[4] = ELFCLASS64;
    header[5] = ELFDATA2LSB;
    header[6] = EV_CURRENT;
    header[7] = ELFOSABI_FREEBSD;

    header[16..18].copy_from_slice(&e_type.to_le_bytes());
    header[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
    header[20..24].copy_from_slice(&1u32.to_le_bytes());
    header[24..32].copy_from_slice(&entry_point.to_le_bytes());
    // program headers immediately follow the ELF header
    header[32..40].copy_from_slice(&(ELF64_EHDR_SIZE as u64).to_le_bytes());
    header[40..48].copy_from_slice(&shoff.to_le_bytes());
    header[52..54].copy_from_slice(&(ELF64_EHDR_SIZE as u16).to_le_bytes());
    header[54..56].copy_from_slice(&(ELF64_PHDR_SIZE as u16).to_le_bytes());
    header[56..58].copy_from_slice(&phdr_count.to_le_bytes());
    header[58..60].copy_from_slice(&(ELF64_SHDR_SIZE as u16).to_le_bytes());
    header[60..62].copy_from_slice(&shdr_count.to_le_bytes());

    header
}

/// Generate an ELF64 program header
pub fn generate_program_header(
    p_type: u32,
    offset: u64,
    vaddr: u64,
    file_size: u64,
    mem_size: u64,
    flags: u32,
    align: u64,
) -> [u8; ELF64_PHDR_SIZE] {
    let mut phdr = [0u8; ELF64_PHDR_SIZE];

    phdr[0..4].copy_from_slice(&p_type.to_le_bytes());
    phdr[4..8].copy_from_slice(&flags.to_le_bytes());
    phdr[8..16].copy_from_slice(&offset.to_le_bytes());
    phdr[16..24].copy_from_slice(&vaddr.to_le_bytes());
    // p_paddr mirrors p_vaddr
    phdr[24..32].copy_from_slice(&vaddr.to_le_bytes());
    phdr[32..40].copy_from_slice(&file_size.to_le_bytes());
    phdr[40..48].copy_from_slice(&mem_size.to_le_bytes());
    phdr[48..56].copy_from_slice(&align.to_le_bytes());

    phdr
}

/// Generate an ELF64 section header (name, flags, addr, link, info left zero)
pub fn generate_section_header(
    sh_type: u32,
    offset: u64,
    size: u64,
    entsize: u64,
) -> [u8; ELF64_SHDR_SIZE] {
    let mut shdr = [0u8; ELF64_SHDR_SIZE];

    shdr[4..8].copy_from_slice(&sh_type.to_le_bytes());
    shdr[24..32].copy_from_slice(&offset.to_le_bytes());
    shdr[32..40].copy_from_slice(&size.to_le_bytes());
    shdr[48..56].copy_from_slice(&8u64.to_le_bytes());
    shdr[56..64].copy_from_slice(&entsize.to_le_bytes());

    shdr
}

/// Generate an ELF64 RELA entry
pub fn generate_rela(offset: u64, r_type: u32, addend: i64) -> [u8; ELF64_RELA_SIZE] {
    let mut rela = [0u8; ELF64_RELA_SIZE];

    rela[0..8].copy_from_slice(&offset.to_le_bytes());
    rela[8..16].copy_from_slice(&(r_type as u64).to_le_bytes());
    rela[16..24].copy_from_slice(&addend.to_le_bytes());

    rela
}
