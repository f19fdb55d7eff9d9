//! Error types for the object fetch pipeline.
//!
//! Errors are stage-specific to keep diagnostics precise. All enums are
//! `#[non_exhaustive]`; consumers should include a fallback match arm.
//! Transport-level failures carry their retry classification with them so
//! the retry wrapper never has to guess from a message string.

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::retry::AttemptError;

/// Errors from the HTTP object transport.
#[derive(Debug)]
#[non_exhaustive]
pub enum TransportError {
    /// I/O failure while streaming a body.
    Io(io::Error),
    /// HTTP-layer failure (connect, TLS, protocol).
    Http(reqwest::Error),
    /// Non-2xx response status.
    Status { code: u16 },
    /// The response lacked a Content-Type header.
    MissingContentType,
    /// The response Content-Type is not an object media type.
    UnexpectedContentType { content_type: String },
    /// The endpoint URL could not be built.
    Url { detail: String },
    /// Malformed ref advertisement.
    RefAdvertisement { detail: &'static str },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "transport I/O error: {err}"),
            Self::Http(err) => write!(f, "HTTP error: {err}"),
            Self::Status { code } => write!(f, "unexpected HTTP status: {code}"),
            Self::MissingContentType => write!(f, "response has no Content-Type header"),
            Self::UnexpectedContentType { content_type } => {
                write!(f, "unexpected Content-Type: {content_type}")
            }
            Self::Url { detail } => write!(f, "invalid endpoint URL: {detail}"),
            Self::RefAdvertisement { detail } => {
                write!(f, "malformed ref advertisement: {detail}")
            }
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Http(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err)
    }
}

impl TransportError {
    /// Converts into the retry wrapper's error taxonomy.
    ///
    /// Network and status failures are transient; a server speaking the
    /// wrong media type or a bad URL will not improve with retries.
    #[must_use]
    pub fn into_attempt_error(self) -> AttemptError {
        match self {
            Self::Io(err) => AttemptError::Io(err),
            Self::Http(_) | Self::Status { .. } => AttemptError::Signalled {
                retryable: true,
                detail: self.to_string(),
            },
            Self::MissingContentType
            | Self::UnexpectedContentType { .. }
            | Self::Url { .. }
            | Self::RefAdvertisement { .. } => AttemptError::Signalled {
                retryable: false,
                detail: self.to_string(),
            },
        }
    }
}

/// Errors from decoding a batched-loose-objects stream.
#[derive(Debug)]
#[non_exhaustive]
pub enum FrameError {
    /// I/O failure while reading the stream.
    Io(io::Error),
    /// The stream header carries a version this client does not speak.
    UnsupportedVersion { version: u8 },
    /// A record carries an object-id length that is neither 20 nor 32.
    InvalidOidLength { len: u8 },
    /// The stream ended inside a record.
    Truncated,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "frame I/O error: {err}"),
            Self::UnsupportedVersion { version } => {
                write!(f, "unsupported batched-objects version: {version}")
            }
            Self::InvalidOidLength { len } => write!(f, "invalid object-id length: {len}"),
            Self::Truncated => write!(f, "truncated batched-objects stream"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Errors from indexing a downloaded pack.
#[derive(Debug)]
#[non_exhaustive]
pub enum PackIndexError {
    /// I/O failure while moving or inspecting the pack.
    Io(io::Error),
    /// The indexing tool exited unsuccessfully.
    IndexToolFailed {
        status: Option<i32>,
        stderr: String,
    },
    /// The downloaded pack is missing or empty.
    EmptyPack { path: PathBuf },
}

impl fmt::Display for PackIndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "pack index I/O error: {err}"),
            Self::IndexToolFailed { status, stderr } => match status {
                Some(code) => write!(f, "index-pack exited with {code}: {stderr}"),
                None => write!(f, "index-pack killed by signal: {stderr}"),
            },
            Self::EmptyPack { path } => {
                write!(f, "downloaded pack is missing or empty: {}", path.display())
            }
        }
    }
}

impl std::error::Error for PackIndexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for PackIndexError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}
