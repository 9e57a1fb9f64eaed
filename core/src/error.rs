//! Error types for the request lifecycle.
//!
//! # Design
//! Lifecycle and argument violations are detected before any transport I/O
//! and surface as their own variants, so callers can tell "you used the
//! object wrong" apart from "the network failed". Every transport failure,
//! including abort-triggered cancellation, lands in `Io` with the original
//! `std::io::Error` as its source.

use thiserror::Error;

/// Errors returned by `Request`, `PayloadSet`, the multipart decoder and
/// `RequestConfig` loaders.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The method is not one of GET, POST, HEAD, OPTIONS, PUT, DELETE, TRACE.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A malformed URL, an empty credential, a missing field on `replace`, or
    /// an unparsable configuration value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not legal in the request's current state.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// The operation cannot be expressed with the chosen method.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// A multipart body did not follow the form-data grammar.
    #[error("malformed multipart body: {0}")]
    MalformedMultipart(&'static str),

    /// Connection refused, timeout, stream interruption or abort.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl RequestError {
    /// True when the error comes from the transport rather than from misuse.
    pub fn is_io(&self) -> bool {
        matches!(self, RequestError::Io(_))
    }
}
