//! Error taxonomy shared by every hbldr crate.

use std::io;

/// Process identifier as seen by the tracing facility.
pub type Pid = i32;

pub type Result<T> = std::result::Result<T, Error>;

/// Reasons an ELF image is rejected before any remote resource is touched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElfFormatError {
    #[error("image truncated: {what} needs {needed} bytes, have {have}")]
    Truncated { what: &'static str, needed: u64, have: u64 },
    #[error("missing ELF magic")]
    BadMagic,
    #[error("unsupported ELF class {0} (only 64-bit images load)")]
    UnsupportedClass(u8),
    #[error("unsupported data encoding {0} (only little endian images load)")]
    UnsupportedEncoding(u8),
    #[error("unsupported object type {0} (need executable or position-independent)")]
    UnsupportedType(u16),
    #[error("unexpected {what} entry size {size}")]
    BadHeaderSize { what: &'static str, size: u16 },
    #[error("image has no loadable segments")]
    NoLoadableSegments,
    #[error("segment {index} file range exceeds the image")]
    SegmentOutOfFile { index: usize },
    #[error("segment {index} file size {filesz:#x} exceeds memory size {memsz:#x}")]
    FileSizeExceedsMemSize { index: usize, filesz: u64, memsz: u64 },
    #[error("relocation at {offset:#x} falls outside the image window")]
    RelocationOutOfRange { offset: u64 },
    #[error("entry point {entry:#x} falls outside the image window")]
    EntryOutOfRange { entry: u64 },
    #[error("load window of {size:#x} bytes exceeds the supported maximum")]
    WindowTooLarge { size: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A tracing request or single step failed, or the target vanished.
    #[error("trace fault on pid {pid} during {op}: {source}")]
    TraceFault {
        pid: Pid,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("malformed ELF image: {0}")]
    ElfFormat(#[from] ElfFormatError),

    /// A remote map, protect, alias or sync request failed inside the target.
    #[error("mapping failure on pid {pid} during {op}: errno {errno}")]
    Mapping { pid: Pid, op: &'static str, errno: i32 },

    /// Any other remote syscall returned failure inside the target.
    #[error("remote {op} failed on pid {pid}: errno {errno}")]
    RemoteSyscall { pid: Pid, op: &'static str, errno: i32 },

    #[error("symbol {nid} not found in pid {pid}")]
    Resolution { pid: Pid, nid: String },

    #[error("host acquisition failed at {stage}: {source}")]
    HostAcquisition {
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("privilege change for pid {pid} failed during {op}: {source}")]
    Privilege {
        pid: Pid,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("illegal launch transition {from} -> {to}")]
    InvalidState { from: &'static str, to: &'static str },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn trace(pid: Pid, op: &'static str, source: io::Error) -> Self {
        Error::TraceFault { pid, op, source }
    }

    pub fn host(stage: &'static str, source: io::Error) -> Self {
        Error::HostAcquisition { stage, source }
    }

    /// OS-style error code describing this failure.
    pub fn raw_os_error(&self) -> i32 {
        match self {
            Error::TraceFault { source, .. }
            | Error::HostAcquisition { source, .. }
            | Error::Io(source) => source.raw_os_error().unwrap_or(libc::EIO),
            Error::Privilege { source, .. } => source.raw_os_error().unwrap_or(libc::EPERM),
            Error::ElfFormat(_) => libc::ENOEXEC,
            Error::Mapping { errno, .. } | Error::RemoteSyscall { errno, .. } => *errno,
            Error::Resolution { .. } => libc::ESRCH,
            Error::InvalidState { .. } => libc::EINVAL,
        }
    }

    /// True if the target process must be assumed unusable.
    pub fn is_trace_fault(&self) -> bool {
        matches!(self, Error::TraceFault { .. })
    }
}
