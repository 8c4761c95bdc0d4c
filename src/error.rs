//! Error types for the OpenWire CMS client
//!
//! One crate-level [`CmsError`] union covers every failure a caller can
//! observe; the codec and transport layers keep their own error enums and
//! convert on the way out.

use thiserror::Error;

use crate::commands::Destination;

/// Errors raised while encoding or decoding OpenWire frames.
///
/// Codec failures are never recoverable for the connection that produced
/// them; the connection tears down and surfaces [`CmsError::WireFormat`].
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown command tag: {tag}")]
    UnknownCommand { tag: u8 },

    #[error("truncated frame: needed {needed} more bytes")]
    TruncatedFrame { needed: usize },

    #[error("marshal size mismatch: pass one estimated {estimated} bytes, pass two wrote {written}")]
    InvariantViolation { estimated: usize, written: usize },

    #[error("boolean stream exhausted")]
    BooleanStreamExhausted,

    #[error("invalid UTF-8 in marshalled string")]
    InvalidUtf8,

    #[error("unsupported wire format version: {version}")]
    UnsupportedVersion { version: u32 },

    #[error("cache index {index} has no assignment")]
    UnknownCacheIndex { index: u16 },

    #[error("invalid value for field {field}: {value}")]
    InvalidField { field: &'static str, value: i64 },
}

/// Errors raised by a transport collaborator.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport broken: {reason}")]
    Broken { reason: String },

    #[error("transport closed")]
    Closed,

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// The client-facing error union.
///
/// Variants map one-to-one onto the failure kinds a JMS-style client can
/// report: broken transport, malformed wire data, protocol state violations,
/// broker-reported errors, timeouts, busy destinations, bad arguments, and
/// use-after-close.
#[derive(Debug, Error)]
pub enum CmsError {
    #[error("transport broken: {reason}")]
    TransportBroken { reason: String },

    #[error("wire format violation: {source}")]
    WireFormat {
        #[from]
        source: CodecError,
    },

    #[error("illegal state: {message}")]
    IllegalState { message: String },

    #[error("broker error [{exception_class}]: {message}")]
    Broker {
        exception_class: String,
        message: String,
    },

    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("destination in use: {destination}")]
    DestinationInUse { destination: Destination },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("{resource} already closed")]
    AlreadyClosed { resource: &'static str },
}

impl From<TransportError> for CmsError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Broken { reason } => CmsError::TransportBroken { reason },
            TransportError::Closed => CmsError::TransportBroken {
                reason: "transport closed".to_string(),
            },
            TransportError::Io { source } => CmsError::TransportBroken {
                reason: source.to_string(),
            },
        }
    }
}

impl CmsError {
    /// Shorthand for a protocol state violation.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        CmsError::IllegalState {
            message: message.into(),
        }
    }

    /// Shorthand for a rejected argument.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        CmsError::InvalidArgument {
            message: message.into(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type CmsResult<T> = Result<T, CmsError>;
