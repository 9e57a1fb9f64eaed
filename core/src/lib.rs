//! Synchronous, browser-style HTTP request object with `multipart/form-data`
//! uploads.
//!
//! # Overview
//! A `Request` is opened with a method and URL, configured with headers and
//! a timeout, then sent once with a `PayloadSet` of text fields and files.
//! GET requests carry the fields in the query string; every other method
//! streams a multipart body. `send` blocks until the response has been
//! buffered into a `ResponseSnapshot` and the connection released.
//!
//! # Design
//! - `Request` is a single-use state machine (`Unopened`, `Opened`, `Sent`,
//!   `Aborted`); misuse is rejected before any network I/O.
//! - File bytes are streamed from their sources, never loaded whole.
//! - The network sits behind the `Transport` trait; `UreqTransport` is the
//!   default, and tests substitute an in-memory one.
//! - Fields, blobs and headers are insertion-ordered so wire output is
//!   deterministic.

pub mod config;
pub mod error;
pub mod http;
pub mod multipart;
pub mod payload;
pub mod request;
pub mod response;
pub mod transport;

pub use config::RequestConfig;
pub use error::RequestError;
pub use http::{status, HttpMethod};
pub use multipart::{DecodedPart, MultipartEncoder, MultipartStream};
pub use payload::{Blob, PayloadSet};
pub use request::{Request, RequestState};
pub use response::ResponseSnapshot;
pub use transport::{AbortHandle, Inbound, Outbound, Transport, UreqTransport};
