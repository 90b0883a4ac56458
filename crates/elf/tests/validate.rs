//! Images as a front end would hand them over, accepted or rejected whole.

use hbldr_common::ElfFormatError;
use hbldr_elf::{ElfImage, ImageBuilder, ET_DYN, ET_EXEC, PF_R, PF_W, PF_X};

const R_X86_64_64: u32 = 1;

fn pie() -> Vec<u8> {
    ImageBuilder::new(ET_DYN)
        .segment(0, PF_R | PF_X, vec![0x90; 0x40], 0x40)
        .segment(0x2000, PF_R | PF_W, vec![0; 0x10], 0x1800)
        .relative(0x2000, 0x10)
        .relative(0x2008, 0x20)
        .relocation(0x2010, R_X86_64_64, 0)
        .entry(0x10)
        .build()
}

#[test]
fn test_position_independent_image() {
    let bytes = pie();
    let image = ElfImage::parse(&bytes).unwrap();
    assert!(image.is_position_independent());
    assert_eq!(image.min_vaddr, 0);
    assert_eq!(image.window_size(), 0x4000);
    assert_eq!(image.entry_offset(), 0x10);
    assert_eq!(image.loadable_segments().count(), 2);
    assert_eq!(image.relative_relocations().len(), 2);
    assert_eq!(image.skipped_relocations(), 1);

    let text = image.loadable_segments().next().unwrap();
    assert_eq!(image.segment_data(text), &[0x90; 0x40][..]);
}

#[test]
fn test_executable_linked_high() {
    let bytes = ImageBuilder::new(ET_EXEC)
        .segment(0x40_0000, PF_R | PF_X, vec![0xc3], 1)
        .entry(0x40_0000)
        .build();
    let image = ElfImage::parse(&bytes).unwrap();
    assert!(!image.is_position_independent());
    assert_eq!(image.min_vaddr, 0x40_0000);
    assert_eq!(image.entry_offset(), 0);
}

#[test]
fn test_rejections() {
    let mut bytes = pie();
    bytes[4] = 1;
    assert_eq!(ElfImage::parse(&bytes).unwrap_err(), ElfFormatError::UnsupportedClass(1));

    let mut bytes = pie();
    bytes[16] = 1;
    assert_eq!(ElfImage::parse(&bytes).unwrap_err(), ElfFormatError::UnsupportedType(1));

    let bytes = pie();
    assert!(matches!(ElfImage::parse(&bytes[..40]).unwrap_err(), ElfFormatError::Truncated { .. }));
    assert_eq!(ElfImage::parse(b"\0asm\x01\0\0\0").unwrap_err(), ElfFormatError::BadMagic);

    // Segments far apart would need an absurd window
    let bytes = ImageBuilder::new(ET_DYN)
        .segment(0, PF_R | PF_X, vec![0xc3; 8], 8)
        .segment(0x9000_0000_0000_0000, PF_R, vec![0; 8], 8)
        .build();
    assert_eq!(
        ElfImage::parse(&bytes).unwrap_err(),
        ElfFormatError::WindowTooLarge { size: 0x9000_0000_0000_1000 }
    );
}
