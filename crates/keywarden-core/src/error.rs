use thiserror::Error;
use uuid::Uuid;

/// Unified error type for the engine.
///
/// Three user-facing families:
/// - key errors (`InvalidCompositeKey`) — the composite key did not unlock the
///   file; recoverable by re-prompting the user;
/// - format errors (signature, version, header, cipher, compression, XML) —
///   the file is unusable as a database;
/// - integrity errors (`BlockHashMismatch`) — the file decrypted but its
///   content is corrupted; the load is aborted, no partial tree is returned.
///
/// Caller-contract violations (adding a second OS-account key factor,
/// restoring an out-of-range history index) panic instead of returning a
/// variant — they are programming faults, not runtime conditions.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid file signature")]
    InvalidSignature,

    #[error("unsupported file version {0:#010x}")]
    UnsupportedVersion(u32),

    #[error("truncated header")]
    TruncatedHeader,

    #[error("required header field missing: {0}")]
    MissingHeaderField(&'static str),

    #[error("unknown content cipher {0}")]
    UnknownCipher(Uuid),

    #[error("unknown compression algorithm id {0}")]
    UnknownCompression(u32),

    #[error("invalid composite key or corrupted file")]
    InvalidCompositeKey,

    #[error("content block {index} failed its integrity check")]
    BlockHashMismatch { index: u32 },

    #[error("malformed database XML: {0}")]
    Xml(String),

    #[error("cipher failure: {0}")]
    Cipher(String),

    #[error("key material unavailable: {0}")]
    KeyUnavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
