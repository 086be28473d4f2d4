//! The error taxonomy shared by every stage of a blob install.
//!
//! Collaborator traits (storage, crypto, BCT) report failures as [anyhow::Error], the same way
//! the rest of the ecosystem does; those are folded into [Error::Storage] at the boundary, while
//! the decoding and policy layers raise the more specific variants themselves.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed headers, bad magic, inconsistent sizes, or out-of-range offsets.
    #[error("format error: {0}")]
    Format(String),

    /// A CRC or signature did not match the data it covers.
    #[error("checksum error: {0}")]
    Checksum(String),

    /// A bootloader entry was refused by the version policy. This is the only soft error: the
    /// installer records it and moves on to the next entry.
    #[error("partition {partition}: version {offered} is not newer than installed {current}")]
    PolicyRejection {
        partition: String,
        current: u32,
        offered: u32,
    },

    /// The blob carries a payload the current fuse mode may not install.
    #[error("update not allowed: {0}")]
    UpdateNotAllowed(String),

    #[error("unsupported sparse chunk type {0:#06x}")]
    UnsupportedChunkType(u16),

    /// Any failure reported by the storage, crypto or BCT collaborators.
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),

    #[error("out of resources: {0}")]
    Resource(String),
}

impl Error {
    /// Shorthand for [Error::Format]
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// Shorthand for [Error::Checksum]
    pub fn checksum(msg: impl Into<String>) -> Self {
        Self::Checksum(msg.into())
    }

    /// Soft errors are recorded by the installer instead of aborting the install.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::PolicyRejection { .. })
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::OutOfMemory => Self::Resource(error.to_string()),
            _ => Self::Storage(error.into()),
        }
    }
}

impl From<deku::DekuError> for Error {
    fn from(error: deku::DekuError) -> Self {
        Self::Format(error.to_string())
    }
}

/// Like [anyhow::ensure], but produces an [Error::Format].
macro_rules! ensure_format {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::Error::Format(format!($($arg)+)));
        }
    };
}
pub(crate) use ensure_format;

/// Allocate a zeroed buffer of `len` bytes, reporting allocation failure as [Error::Resource]
/// rather than aborting.
pub fn try_alloc(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|e| Error::Resource(format!("cannot allocate {len} bytes: {e}")))?;
    buf.resize(len, 0);
    Ok(buf)
}

#[test]
fn test_soft_errors() {
    let rejection = Error::PolicyRejection {
        partition: "EBT".into(),
        current: 3,
        offered: 2,
    };
    assert!(rejection.is_soft());
    assert!(!Error::format("bad magic").is_soft());
    assert!(!Error::from(anyhow::anyhow!("write failed")).is_soft());
}

#[test]
fn test_io_error_mapping() {
    let oom = io::Error::new(io::ErrorKind::OutOfMemory, "no room");
    assert!(matches!(Error::from(oom), Error::Resource(_)));

    let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "short read");
    assert!(matches!(Error::from(eof), Error::Storage(_)));
}

#[test]
fn test_try_alloc() -> Result<()> {
    let buf = try_alloc(4096)?;
    assert_eq!(buf.len(), 4096);
    assert!(buf.iter().all(|&b| b == 0));

    assert!(matches!(try_alloc(usize::MAX), Err(Error::Resource(_))));
    Ok(())
}
