//! `multipart/form-data` encoding and decoding.
//!
//! # Design
//! The encoder never materializes file contents. `MultipartEncoder::stream`
//! lays the body out as a queue of segments: small owned buffers for the
//! boundary lines and part headers, and the blob sources themselves for file
//! bytes. `MultipartStream` implements `Read` over that queue, so the
//! transport pulls bytes through its own bounded buffer and working memory
//! stays constant regardless of file size. A blob source is dropped (closed)
//! as soon as it reports EOF or an error.
//!
//! Wire grammar, per text field:
//!
//! ```text
//! --BOUNDARY\r\n
//! Content-Disposition: form-data; name="<name>"\r\n
//! Content-Type: text/plain; charset=<charset>\r\n
//! \r\n
//! <value>\r\n
//! ```
//!
//! per file:
//!
//! ```text
//! --BOUNDARY\r\n
//! Content-Disposition: form-data; name="<name>"; filename="<filename>"\r\n
//! Content-Type: <guessed>\r\n
//! Content-Transfer-Encoding: binary\r\n
//! \r\n
//! <bytes>\r\n
//! ```
//!
//! followed by the terminal `\r\n--BOUNDARY--\r\n`. Fields are emitted before
//! files, each group in insertion order.
//!
//! Text values are encoded in the charset named on their part. A label that
//! `encoding_rs` cannot encode into (unknown, or UTF-16 which it only decodes)
//! falls back to UTF-8 for both the label and the bytes. Characters the
//! charset cannot represent become HTML numeric character references, as a
//! browser form submission would send them.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Cursor, Read, Write};

use encoding_rs::{Encoding, UTF_8};
use uuid::Uuid;

use crate::error::RequestError;
use crate::http::guess_from_name;
use crate::payload::PayloadSet;

const CRLF: &str = "\r\n";

/// Size of the intermediate buffer used by `MultipartEncoder::encode_to`.
pub const COPY_BUFFER_SIZE: usize = 8 * 1024;

/// Produce a fresh boundary token.
pub fn generate_boundary() -> String {
    format!("----XhrFormBoundary{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartEncoder {
    boundary: String,
    charset: String,
    encoding: &'static Encoding,
}

impl MultipartEncoder {
    pub fn new(boundary: impl Into<String>, charset: impl Into<String>) -> Self {
        let (charset, encoding) = resolve_charset(charset.into());
        Self {
            boundary: boundary.into(),
            charset,
            encoding,
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Charset label written on text parts.
    pub fn charset(&self) -> &str {
        &self.charset
    }

    /// Value for the request's `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Lay out `payload` as a readable body. Consumes the blob sources.
    pub fn stream(&self, payload: PayloadSet) -> MultipartStream {
        let (fields, blobs) = payload.into_parts();
        let mut segments = VecDeque::with_capacity(fields.len() + blobs.len() * 3 + 1);

        for (name, value) in fields {
            tracing::trace!(name = %name, "encoding text part");
            let mut part = self.part_start();
            part.push_str(&format!(
                "Content-Disposition: form-data; name=\"{}\"{CRLF}",
                escape(&name)
            ));
            part.push_str(&format!("Content-Type: text/plain; charset={}{CRLF}", self.charset));
            part.push_str(CRLF);
            let mut bytes = part.into_bytes();
            bytes.extend_from_slice(&self.encoding.encode(&value).0);
            bytes.extend_from_slice(CRLF.as_bytes());
            segments.push_back(Segment::Buffer(Cursor::new(bytes)));
        }

        for (name, blob) in blobs {
            let (filename, source) = blob.into_parts();
            tracing::trace!(name = %name, filename = %filename, "encoding file part");
            let mut head = self.part_start();
            head.push_str(&format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"{CRLF}",
                escape(&name),
                escape(&filename)
            ));
            head.push_str(&format!("Content-Type: {}{CRLF}", guess_from_name(&filename)));
            head.push_str(&format!("Content-Transfer-Encoding: binary{CRLF}"));
            head.push_str(CRLF);
            segments.push_back(Segment::Buffer(Cursor::new(head.into_bytes())));
            segments.push_back(Segment::Source(source));
            segments.push_back(Segment::Buffer(Cursor::new(CRLF.as_bytes().to_vec())));
        }

        let terminal = format!("{CRLF}--{}--{CRLF}", self.boundary);
        segments.push_back(Segment::Buffer(Cursor::new(terminal.into_bytes())));

        MultipartStream { segments }
    }

    /// Encode `payload` into `out`, copying through a fixed-size buffer.
    /// Returns the number of bytes written.
    pub fn encode_to<W: Write>(&self, payload: PayloadSet, out: &mut W) -> io::Result<u64> {
        let mut stream = self.stream(payload);
        let mut buf = [0u8; COPY_BUFFER_SIZE];
        let mut written = 0u64;
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            out.write_all(&buf[..n])?;
            written += n as u64;
        }
        out.flush()?;
        Ok(written)
    }

    fn part_start(&self) -> String {
        format!("--{}{CRLF}", self.boundary)
    }
}

enum Segment {
    Buffer(Cursor<Vec<u8>>),
    Source(Box<dyn Read + Send>),
}

/// A multipart body, readable once from start to end.
pub struct MultipartStream {
    segments: VecDeque<Segment>,
}

impl Read for MultipartStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while let Some(front) = self.segments.front_mut() {
            let result = match front {
                Segment::Buffer(cursor) => cursor.read(buf),
                Segment::Source(source) => source.read(buf),
            };
            match result {
                Ok(0) => {
                    self.segments.pop_front();
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => return Err(e),
                Err(e) => {
                    // Close the failing source before surfacing the error.
                    self.segments.pop_front();
                    return Err(e);
                }
            }
        }
        Ok(0)
    }
}

impl fmt::Debug for MultipartStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipartStream")
            .field("remaining_segments", &self.segments.len())
            .finish()
    }
}

/// Keep the label verbatim when `encoding_rs` can encode into it.
fn resolve_charset(label: String) -> (String, &'static Encoding) {
    match Encoding::for_label(label.trim().as_bytes()) {
        Some(encoding) if encoding.output_encoding() == encoding => (label, encoding),
        _ => {
            tracing::warn!(charset = %label, "charset cannot be encoded, using UTF-8");
            (UTF_8.name().to_string(), UTF_8)
        }
    }
}

fn escape(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

/// One part recovered by `decode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPart {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
    pub data: Vec<u8>,
}

impl DecodedPart {
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

/// Extract the boundary parameter of a `multipart/form-data` content type.
pub fn parse_boundary(content_type: &str) -> Result<String, RequestError> {
    let mut params = content_type.split(';');
    let essence = params.next().unwrap_or("").trim();
    if !essence.eq_ignore_ascii_case("multipart/form-data") {
        return Err(RequestError::MalformedMultipart("not multipart/form-data"));
    }
    params
        .filter_map(|p| p.trim().split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
        .ok_or(RequestError::MalformedMultipart("missing boundary"))
}

/// Parse a body produced by `MultipartEncoder` back into its parts.
///
/// The encoder's terminal starts with its own CRLF, so the CRLF ending the
/// last part's data is stripped along with the part separator.
pub fn decode(boundary: &str, body: &[u8]) -> Result<Vec<DecodedPart>, RequestError> {
    let delimiter = format!("--{boundary}").into_bytes();
    let separator = format!("\r\n--{boundary}").into_bytes();

    let mut pos = find(body, &delimiter, 0)
        .ok_or(RequestError::MalformedMultipart("no opening boundary"))?
        + delimiter.len();
    let mut parts = Vec::new();

    loop {
        if body[pos..].starts_with(b"--") {
            break;
        }
        if !body[pos..].starts_with(b"\r\n") {
            return Err(RequestError::MalformedMultipart("expected CRLF after boundary"));
        }
        pos += 2;

        let header_end = find(body, b"\r\n\r\n", pos)
            .ok_or(RequestError::MalformedMultipart("unterminated part headers"))?;
        let headers = parse_headers(&body[pos..header_end])?;
        let data_start = header_end + 4;

        let data_end = find(body, &separator, data_start)
            .ok_or(RequestError::MalformedMultipart("missing closing boundary"))?;
        pos = data_end + separator.len();

        let mut data = &body[data_start..data_end];
        if body[pos..].starts_with(b"--") && data.ends_with(b"\r\n") {
            data = &data[..data.len() - 2];
        }

        let disposition = header_value(&headers, "content-disposition")
            .ok_or(RequestError::MalformedMultipart("missing Content-Disposition"))?;
        let (name, filename) = parse_disposition(disposition)?;
        let content_type = header_value(&headers, "content-type").map(str::to_string);

        parts.push(DecodedPart {
            name,
            filename,
            content_type,
            headers,
            data: data.to_vec(),
        });
    }

    Ok(parts)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

fn parse_headers(block: &[u8]) -> Result<Vec<(String, String)>, RequestError> {
    let block = std::str::from_utf8(block)
        .map_err(|_| RequestError::MalformedMultipart("part headers are not UTF-8"))?;
    block
        .split("\r\n")
        .map(|line| {
            line.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or(RequestError::MalformedMultipart("malformed part header"))
        })
        .collect()
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn parse_disposition(value: &str) -> Result<(String, Option<String>), RequestError> {
    let mut name = None;
    let mut filename = None;
    for param in value.split(';').skip(1) {
        let Some((k, v)) = param.trim().split_once('=') else {
            continue;
        };
        let v = v.trim().trim_matches('"').to_string();
        match k.trim() {
            "name" => name = Some(v),
            "filename" => filename = Some(v),
            _ => {}
        }
    }
    let name = name.ok_or(RequestError::MalformedMultipart("part has no name"))?;
    Ok((name, filename))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSource {
        dropped: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    impl Read for FailingSource {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "disk went away"))
        }
    }

    impl Drop for FailingSource {
        fn drop(&mut self) {
            self.dropped.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn encoder() -> MultipartEncoder {
        MultipartEncoder::new("B", "UTF-8")
    }

    fn encode(payload: PayloadSet) -> Vec<u8> {
        let mut out = Vec::new();
        encoder().encode_to(payload, &mut out).unwrap();
        out
    }

    #[test]
    fn empty_payload_is_terminal_only() {
        assert_eq!(encode(PayloadSet::new()), b"\r\n--B--\r\n");
    }

    #[test]
    fn single_field_matches_grammar() {
        let mut p = PayloadSet::new();
        p.add("a", "1");
        let expected = "--B\r\n\
            Content-Disposition: form-data; name=\"a\"\r\n\
            Content-Type: text/plain; charset=UTF-8\r\n\
            \r\n\
            1\r\n\
            \r\n--B--\r\n";
        assert_eq!(String::from_utf8(encode(p)).unwrap(), expected);
    }

    #[test]
    fn fields_round_trip_through_decode() {
        let mut p = PayloadSet::new();
        p.add("a", "1");
        p.add("b", "2");
        let parts = decode("B", &encode(p)).unwrap();
        let fields: Vec<_> = parts
            .iter()
            .map(|part| (part.name.as_str(), part.text().unwrap()))
            .collect();
        assert_eq!(fields, vec![("a", "1"), ("b", "2")]);
        assert!(parts.iter().all(|part| part.filename.is_none()));
    }

    #[test]
    fn large_file_streams_byte_for_byte() {
        let data: Vec<u8> = (0..COPY_BUFFER_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
        let mut p = PayloadSet::new();
        p.add("note", "x");
        p.add_file("blob", "data.bin", Cursor::new(data.clone()));

        let parts = decode("B", &encode(p)).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].name, "blob");
        assert_eq!(parts[1].filename.as_deref(), Some("data.bin"));
        assert_eq!(parts[1].content_type.as_deref(), Some("application/octet-stream"));
        assert_eq!(parts[1].data, data);
    }

    #[test]
    fn file_parts_carry_binary_transfer_encoding() {
        let mut p = PayloadSet::new();
        p.add_file("doc", "doc", Cursor::new(b"hi".to_vec()));
        let body = encode(p);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains(
            "Content-Disposition: form-data; name=\"doc\"; filename=\"doc\"\r\n\
             Content-Type: application/octet-stream\r\n\
             Content-Transfer-Encoding: binary\r\n\r\nhi\r\n"
        ));
    }

    #[test]
    fn failing_source_is_closed_and_error_surfaces() {
        let dropped = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut p = PayloadSet::new();
        p.add_file("f", "f.bin", FailingSource { dropped: dropped.clone() });

        let err = encoder().encode_to(p, &mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn quotes_in_names_are_escaped() {
        let mut p = PayloadSet::new();
        p.add("say \"hi\"", "v");
        let text = String::from_utf8(encode(p)).unwrap();
        assert!(text.contains("name=\"say %22hi%22\""));
    }

    #[test]
    fn boundaries_are_unique() {
        let a = generate_boundary();
        let b = generate_boundary();
        assert_ne!(a, b);
        assert!(a.starts_with("----XhrFormBoundary"));
    }

    #[test]
    fn parse_boundary_reads_content_type() {
        let enc = MultipartEncoder::new("abc123", "UTF-8");
        assert_eq!(parse_boundary(&enc.content_type()).unwrap(), "abc123");
        assert!(parse_boundary("text/plain").is_err());
        assert!(parse_boundary("multipart/form-data").is_err());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode("B", b"no boundary here").is_err());
        assert!(decode("B", b"--B\r\nContent-Disposition: form-data\r\n\r\nx").is_err());
    }

    fn encode_with(charset: &str, value: &str) -> Vec<u8> {
        let mut p = PayloadSet::new();
        p.add("k", value);
        let mut out = Vec::new();
        MultipartEncoder::new("B", charset).encode_to(p, &mut out).unwrap();
        out
    }

    #[test]
    fn field_bytes_follow_the_declared_charset() {
        let latin = encode_with("ISO-8859-1", "caf\u{e9}");
        let mut expected = b"--B\r\n\
            Content-Disposition: form-data; name=\"k\"\r\n\
            Content-Type: text/plain; charset=ISO-8859-1\r\n\r\ncaf"
            .to_vec();
        expected.push(0xE9);
        expected.extend_from_slice(b"\r\n\r\n--B--\r\n");
        assert_eq!(latin, expected);

        let utf8 = encode_with("UTF-8", "caf\u{e9}");
        let parts = decode("B", &utf8).unwrap();
        assert_eq!(parts[0].data, "caf\u{e9}".as_bytes());
    }

    #[test]
    fn unmappable_characters_become_references() {
        let parts = decode("B", &encode_with("ISO-8859-1", "\u{65e5}")).unwrap();
        assert_eq!(parts[0].text(), Some("&#26085;"));
    }

    #[test]
    fn unusable_charset_falls_back_to_utf8() {
        for label in ["no-such-charset", "UTF-16LE"] {
            let enc = MultipartEncoder::new("B", label);
            assert_eq!(enc.charset(), "UTF-8", "{label}");
            let text = String::from_utf8(encode_with(label, "\u{e9}")).unwrap();
            assert!(text.contains("charset=UTF-8\r\n\r\n\u{e9}\r\n"), "{label}");
        }
    }
}
