use thiserror::Error;

/// Errors reported by a verbs device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerbsError {
    /// The device rejected the request with an errno-style code.
    #[error("{op} rejected by device (errno {errno})")]
    Rejected { op: &'static str, errno: i32 },

    /// A host buffer could not be mapped for device access.
    #[error("DMA mapping of {len} bytes failed")]
    MappingFailed { len: usize },

    /// The handle does not name a live object on this device.
    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u64 },
}

impl VerbsError {
    /// Return the errno equivalent of this error.
    pub fn errno(&self) -> i32 {
        match self {
            VerbsError::Rejected { errno, .. } => *errno,
            VerbsError::MappingFailed { .. } => libc_errno::ENOMEM,
            VerbsError::UnknownHandle { .. } => libc_errno::ENOENT,
        }
    }
}

/// The handful of errno values the engine and the simulator use.
pub mod libc_errno {
    pub const ENOENT: i32 = 2;
    pub const EINTR: i32 = 4;
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const EOPNOTSUPP: i32 = 95;
    pub const ETIMEDOUT: i32 = 110;
}
