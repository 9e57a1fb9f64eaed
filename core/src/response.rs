//! Immutable snapshot of a completed exchange.
//!
//! # Design
//! `ResponseSnapshot::capture` is the only constructor. It drains the chosen
//! body stream into memory with a fixed-size buffer and drops the transport's
//! `Inbound` before returning, on the success and the failure path alike, so
//! a snapshot never holds a connection. Afterwards everything is read-only;
//! `response_stream` hands out independent cursors over the shared buffer.

use std::io::{self, Cursor, Read};

use bytes::Bytes;
use url::Url;

use crate::error::RequestError;
use crate::transport::{is_success, AbortHandle, CancellableReader, Inbound};

const DRAIN_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct ResponseSnapshot {
    status: u16,
    status_text: String,
    content_type: Option<String>,
    url: Url,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl ResponseSnapshot {
    /// Buffer `inbound` and release it.
    ///
    /// Only the first value of each header name is kept. The body comes from
    /// the success stream for 2xx/3xx and from the failure stream otherwise;
    /// a missing stream yields an empty body.
    pub(crate) fn capture(
        inbound: Inbound,
        url: Url,
        abort: &AbortHandle,
    ) -> Result<Self, RequestError> {
        let Inbound {
            status,
            status_text,
            headers: raw_headers,
            body,
            error_body,
        } = inbound;

        let mut headers: Vec<(String, String)> = Vec::with_capacity(raw_headers.len());
        for (name, value) in raw_headers {
            if !headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(&name)) {
                headers.push((name, value));
            }
        }
        let content_type = find_header(&headers, "content-type").map(str::to_string);

        let (selected, other) = if is_success(status) {
            (body, error_body)
        } else {
            (error_body, body)
        };
        drop(other);
        let drained = match selected {
            Some(reader) => drain(CancellableReader::new(reader, abort.clone())),
            None => Ok(Vec::new()),
        };
        tracing::debug!(status, "transport released");
        // An abort during the last read can look like a clean EOF.
        let body = drained.and_then(|body| abort.check().map(|()| body))?;

        tracing::debug!(status, body_len = body.len(), url = %url, "response captured");
        Ok(Self {
            status,
            status_text,
            content_type,
            url,
            headers,
            body: Bytes::from(body),
        })
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// The URL the request was sent to, after any query rewriting.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// First value received for `name`, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn all_headers(&self) -> Vec<(String, String)> {
        self.headers.clone()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// A fresh reader positioned at the start of the body.
    pub fn response_stream(&self) -> Cursor<Bytes> {
        Cursor::new(self.body.clone())
    }

    /// The body decoded as UTF-8 (invalid sequences replaced), split on
    /// `\n`, `\r` or `\r\n`, with every line terminated by `\n`.
    pub fn response_text(&self) -> String {
        let text = String::from_utf8_lossy(&self.body);
        let mut out = String::with_capacity(text.len() + 1);
        let mut rest: &str = &text;
        while !rest.is_empty() {
            match rest.find(['\r', '\n']) {
                Some(i) => {
                    out.push_str(&rest[..i]);
                    out.push('\n');
                    let skip = if rest[i..].starts_with("\r\n") { 2 } else { 1 };
                    rest = &rest[i + skip..];
                }
                None => {
                    out.push_str(rest);
                    out.push('\n');
                    break;
                }
            }
        }
        out
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Read `reader` to EOF through a fixed buffer; the reader is dropped on
/// return.
fn drain(mut reader: impl Read) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; DRAIN_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(out),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
