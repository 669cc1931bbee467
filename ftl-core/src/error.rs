//! Error taxonomy. Plain enums with a manual `Display` impl rather than a
//! derive-macro crate like `thiserror`.

use core::fmt;

/// Errors raised by the NDM layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NdmError {
    /// No control-block signature found anywhere on the device.
    NoMetaBlock,
    /// Signatures were found but no complete control record could be assembled.
    NoMetaData,
    /// A control record was found but fails CRC or internal consistency checks.
    BadMetaData,
    /// A relocation was requested but would exceed `max_bad_blocks`.
    TooManyBadBlocks,
    /// The driver reported a fatal (non-recoverable) I/O failure.
    Fatal,
    /// The volume is mounted read-only and the operation would require a write.
    ReadOnly,
}

impl fmt::Display for NdmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NdmError::NoMetaBlock => write!(f, "no NDM control-block signature found; device is unformatted"),
            NdmError::NoMetaData => write!(f, "control-block signatures found but no complete record could be assembled"),
            NdmError::BadMetaData => write!(f, "control record failed validation (CRC or internal consistency)"),
            NdmError::TooManyBadBlocks => write!(f, "bad-block relocation would exceed max_bad_blocks"),
            NdmError::Fatal => write!(f, "unrecoverable I/O failure"),
            NdmError::ReadOnly => write!(f, "operation requires a write but the device is mounted read-only"),
        }
    }
}

impl std::error::Error for NdmError {}

/// Errors raised by the FTL-N layer and returned to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtlError {
    /// An NDM-layer error propagated up.
    Ndm(NdmError),
    /// The volume previously hit an unrecoverable error; it now rejects all
    /// mutating operations.
    Fatal,
    /// Out of space: provisioning was exhausted.
    NoSpace,
    /// `GarbageCollect` found nothing left worth compacting.
    Stop,
    /// Operation requires the volume to be mounted.
    NotMounted,
    /// `Mount` called on an already-mounted volume.
    AlreadyMounted,
    /// `Unmount` (or similar) called on a volume that wasn't mounted.
    NotFound,
    /// Arguments out of the valid vpage range, or otherwise malformed.
    InvalidArgs,
    /// The device is mounted read-only and the operation needs to write.
    ReadOnly,
    /// Reducing `max_bad_blocks` at mount would violate the current bad-block
    /// count invariant.
    InvariantViolation,
}

impl fmt::Display for FtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FtlError::Ndm(e) => write!(f, "NDM error: {e}"),
            FtlError::Fatal => write!(f, "volume is in the FATAL_ERR state"),
            FtlError::NoSpace => write!(f, "out of space"),
            FtlError::Stop => write!(f, "nothing left to garbage collect"),
            FtlError::NotMounted => write!(f, "volume is not mounted"),
            FtlError::AlreadyMounted => write!(f, "volume is already mounted"),
            FtlError::NotFound => write!(f, "no such mounted volume"),
            FtlError::InvalidArgs => write!(f, "invalid arguments"),
            FtlError::ReadOnly => write!(f, "volume is mounted read-only"),
            FtlError::InvariantViolation => {
                write!(f, "configuration would violate a volume invariant")
            }
        }
    }
}

impl std::error::Error for FtlError {}

impl From<NdmError> for FtlError {
    fn from(e: NdmError) -> Self {
        match e {
            NdmError::Fatal => FtlError::Fatal,
            NdmError::ReadOnly => FtlError::ReadOnly,
            other => FtlError::Ndm(other),
        }
    }
}

pub type FtlResult<T> = Result<T, FtlError>;
pub type NdmResult<T> = Result<T, NdmError>;
