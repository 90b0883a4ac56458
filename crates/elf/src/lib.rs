//! ELF64 support for hbldr
//!
//! This crate decodes and validates x86-64 ELF images before they are mapped
//! into a target process, and can synthesize small images.

pub mod builder;
pub mod elf64;
pub mod image;

pub use builder::ImageBuilder;
pub use elf64::{
    FileHeader, ProgramHeader, Rela, SectionHeader, ET_DYN, ET_EXEC, PF_R, PF_W, PF_X, PT_LOAD,
};
pub use image::{ElfImage, MAX_WINDOW_SIZE};
