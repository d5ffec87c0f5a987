use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiskError>;

/// Unified error type for buffer, stream, layer and partition-table operations.
///
/// Detection helpers (`detect` functions) never return these; they report `false`
/// instead so callers can try several formats against one stream.
///
/// Note: [`DiskError::Io`] stores a human-readable `String` rather than
/// `std::io::Error` so the error stays `Clone` and comparable in tests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiskError {
    #[error("out of range: offset={offset} len={len} capacity={capacity}")]
    OutOfRange { offset: u64, len: u64, capacity: u64 },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error("access denied: {0}")]
    AccessDenied(&'static str),

    #[error("invalid seek: resulting position {position} is negative")]
    InvalidSeek { position: i128 },

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("{operation} is not supported for {format} disks")]
    UnsupportedForFormat {
        format: &'static str,
        operation: &'static str,
    },

    #[error("parent of layer {layer} not found (tried {candidates:?})")]
    ParentNotFound { layer: usize, candidates: Vec<String> },

    #[error("insufficient free space for {requested_sectors} sectors")]
    InsufficientSpace { requested_sectors: u64 },

    #[error("partition directory is full ({slots} slots)")]
    DirectoryFull { slots: usize },

    #[error("partition index {index} out of range (count {count})")]
    InvalidIndex { index: usize, count: usize },

    #[error("corrupt structure: {0}")]
    CorruptStructure(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("stream is closed")]
    Closed,

    /// Host file or device failure, carrying the OS error text.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for DiskError {
    fn from(err: std::io::Error) -> Self {
        DiskError::Io(err.to_string())
    }
}
