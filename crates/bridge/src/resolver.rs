//! Symbol resolution inside a target process.
//!
//! Symbols are addressed by NID, the hashed export name used by the system's
//! dynamic loader.

use std::collections::HashMap;

use hbldr_common::Pid;

use crate::kernel::Kernel;

/// Well-known NIDs.
pub mod nid {
    /// getpid(); its body holds the syscall instruction used as stub
    pub const GETPID: &str = "HoLVWNanBBc";
    /// __error()
    pub const ERRNO: &str = "9BcDykPmo1I";
    /// environ
    pub const ENVIRON: &str = "+2thxYZ4syk";
    /// pipe()
    pub const PIPE: &str = "-Jp7F+pXxNg";
    /// sceKernelGetProcParam()
    pub const GET_PROC_PARAM: &str = "959qrazPIrg";
    /// getargv()
    pub const GET_ARGV: &str = "FJmglmTMdr4";
}

pub trait Resolver: Sync {
    fn resolve(&self, pid: Pid, nid: &str) -> Option<u64>;
}

/// Resolves through the target's dynamic loader, probing library handles in
/// order.
pub struct DynlibResolver<'a> {
    kernel: &'a dyn Kernel,
    handles: [u32; 2],
}

impl<'a> DynlibResolver<'a> {
    pub fn new(kernel: &'a dyn Kernel, handles: [u32; 2]) -> Self {
        Self { kernel, handles }
    }
}

impl Resolver for DynlibResolver<'_> {
    fn resolve(&self, pid: Pid, nid: &str) -> Option<u64> {
        self.handles
            .iter()
            .find_map(|handle| self.kernel.dynlib_resolve(pid, *handle, nid).filter(|a| *a != 0))
    }
}

/// Fixed table, the same for every process.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: HashMap<String, u64>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, nid: &str, addr: u64) {
        self.symbols.insert(nid.to_string(), addr);
    }
}

impl Resolver for SymbolTable {
    fn resolve(&self, _pid: Pid, nid: &str) -> Option<u64> {
        self.symbols.get(nid).copied()
    }
}
