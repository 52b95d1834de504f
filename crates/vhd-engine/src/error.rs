use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiskError>;

/// Unified error type for VHD image operations.
///
/// The variants follow the failure kinds a VHD engine has to distinguish: malformed
/// images ([`DiskError::CorruptImage`]), bad caller input ([`DiskError::Misaligned`],
/// [`DiskError::OutOfBounds`], [`DiskError::InvalidConfig`]), policy refusals
/// ([`DiskError::AccessDenied`], [`DiskError::Unsupported`]) and failures of the injected
/// storage backend ([`DiskError::Io`]).
///
/// "This range holds no data" is *not* an error; see [`crate::Extent`].
///
/// Note: [`DiskError::Io`] stores a human-readable `String` rather than `std::io::Error` so
/// backends that are not OS files can report failures without a platform error type.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("misaligned request: offset={offset} len={len} (expected multiples of {alignment})")]
    Misaligned {
        offset: u64,
        len: usize,
        alignment: usize,
    },

    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    /// The image is not a VHD this engine understands ("unrecognized media").
    #[error("corrupt disk image: {0}")]
    CorruptImage(&'static str),

    #[error("unsupported disk image feature: {0}")]
    Unsupported(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("insufficient resources: could not reserve {0} bytes")]
    InsufficientResources(usize),

    #[error("access denied: disk is read-only")]
    AccessDenied,

    /// Generic I/O failure reported by a storage backend.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for DiskError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}
