//! Page arithmetic for the target's address space.

/// Page granularity used for every remote mapping.
pub const PAGE_SIZE: u64 = 0x1000;

#[inline]
pub const fn round_page(x: u64) -> u64 {
    (x + (PAGE_SIZE - 1)) & !(PAGE_SIZE - 1)
}

#[inline]
pub const fn trunc_page(x: u64) -> u64 {
    x & !(PAGE_SIZE - 1)
}
