//! Browser-style, single-use HTTP request object.
//!
//! # Design
//! A `Request` moves through `Unopened -> Opened -> Sent`, with `Aborted`
//! reachable from `Opened` and `Sent`. The state is an explicit enum checked
//! at the top of every operation, so each illegal transition has exactly one
//! place where it is rejected. Every check runs before any transport I/O.
//!
//! `send` marks the request `Sent` on entry. For GET the payload's fields are
//! appended to the URL query; for every other method the whole payload is
//! streamed as a `multipart/form-data` body whose boundary was fixed when
//! the request was constructed. The response is buffered and the connection
//! released before `send` returns.

use std::fmt;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use url::form_urlencoded::byte_serialize;
use url::Url;

use crate::config::RequestConfig;
use crate::error::RequestError;
use crate::http::{sniff_content_type, HttpMethod};
use crate::multipart::{generate_boundary, MultipartEncoder};
use crate::payload::PayloadSet;
use crate::response::ResponseSnapshot;
use crate::transport::{
    aborted, AbortHandle, CancellableReader, Outbound, Transport, UreqTransport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Unopened,
    Opened,
    Sent,
    Aborted,
}

pub struct Request {
    state: RequestState,
    method: HttpMethod,
    url: Option<Url>,
    headers: Vec<(String, String)>,
    timeout: Option<Duration>,
    encoder: MultipartEncoder,
    transport: Box<dyn Transport + Send>,
    abort: AbortHandle,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("state", &self.state())
            .field("method", &self.method)
            .field("url", &self.url.as_ref().map(Url::as_str))
            .field("headers", &self.headers)
            .field("timeout", &self.timeout)
            .field("boundary", &self.encoder.boundary())
            .finish_non_exhaustive()
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    /// A request using the ureq transport and default configuration.
    pub fn new() -> Self {
        Self::with_config(RequestConfig::default())
    }

    pub fn with_config(config: RequestConfig) -> Self {
        Self::with_transport(UreqTransport, config)
    }

    pub fn with_transport(
        transport: impl Transport + Send + 'static,
        config: RequestConfig,
    ) -> Self {
        Self {
            state: RequestState::Unopened,
            method: HttpMethod::default(),
            url: None,
            headers: vec![("User-Agent".to_string(), config.user_agent.clone())],
            timeout: config.timeout(),
            encoder: MultipartEncoder::new(generate_boundary(), config.charset),
            transport: Box::new(transport),
            abort: AbortHandle::default(),
        }
    }

    pub fn open(&mut self, method: &str, url: &str) -> Result<(), RequestError> {
        self.open_with_credentials(method, url, None, None)
    }

    /// Open with HTTP basic credentials. If either credential is given, both
    /// must be non-empty. Nothing is mutated unless every check passes.
    pub fn open_with_credentials(
        &mut self,
        method: &str,
        url: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<(), RequestError> {
        match self.state() {
            RequestState::Unopened => {}
            RequestState::Opened => return Err(RequestError::IllegalState("already opened")),
            RequestState::Sent => return Err(RequestError::IllegalState("already sent")),
            RequestState::Aborted => return Err(RequestError::IllegalState("aborted")),
        }

        let method: HttpMethod = method.parse()?;

        let authorization = if username.is_some() || password.is_some() {
            let username = username.unwrap_or_default();
            let password = password.unwrap_or_default();
            if username.is_empty() {
                return Err(RequestError::InvalidArgument("username is empty".to_string()));
            }
            if password.is_empty() {
                return Err(RequestError::InvalidArgument("password is empty".to_string()));
            }
            Some(basic_authorization(username, password))
        } else {
            None
        };

        let url = Url::parse(url)
            .map_err(|e| RequestError::InvalidArgument(format!("malformed URL {url:?}: {e}")))?;

        if let Some(value) = authorization {
            self.put_header("Authorization", value);
        }
        tracing::debug!(method = %method, url = %url, "request opened");
        self.method = method;
        self.url = Some(url);
        self.state = RequestState::Opened;
        Ok(())
    }

    /// Set a header, replacing any entry with the same name (ignoring case).
    pub fn set_request_header(&mut self, name: &str, value: &str) -> Result<(), RequestError> {
        self.ensure_configurable()?;
        self.put_header(name, value.to_string());
        Ok(())
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), RequestError> {
        self.ensure_configurable()?;
        self.timeout = Some(timeout).filter(|t| !t.is_zero());
        Ok(())
    }

    /// Cancel the request. Idempotent; fails only if the request was never
    /// opened.
    pub fn abort(&mut self) -> Result<(), RequestError> {
        match self.state() {
            RequestState::Unopened => Err(RequestError::IllegalState("not opened")),
            RequestState::Aborted => {
                self.state = RequestState::Aborted;
                Ok(())
            }
            RequestState::Opened | RequestState::Sent => {
                self.abort.abort();
                self.state = RequestState::Aborted;
                tracing::debug!("request aborted");
                Ok(())
            }
        }
    }

    /// A handle that aborts this request from another thread, including
    /// while `send` is blocked.
    pub fn abort_handle(&self) -> Result<AbortHandle, RequestError> {
        match self.state() {
            RequestState::Unopened => Err(RequestError::IllegalState("not opened")),
            _ => Ok(self.abort.clone()),
        }
    }

    /// Submit `payload`. GET moves the fields into the query string and
    /// refuses files; other methods send a multipart body.
    pub fn send(&mut self, payload: PayloadSet) -> Result<ResponseSnapshot, RequestError> {
        self.begin_send()?;

        if self.method == HttpMethod::Get {
            if payload.has_files() {
                return Err(RequestError::UnsupportedOperation("cannot send files with GET"));
            }
            if let Some(url) = self.url.as_mut() {
                append_query(url, payload.fields());
            }
            tracing::debug!(method = %self.method, "sending without body");
            return self.execute(None);
        }

        let content_type = self.encoder.content_type();
        self.put_header("Content-Type", content_type);
        let mut body = self.encoder.stream(payload);
        tracing::debug!(
            method = %self.method,
            boundary = self.encoder.boundary(),
            "sending multipart body"
        );
        self.execute(Some(&mut body as &mut dyn Read))
    }

    pub fn send_empty(&mut self) -> Result<ResponseSnapshot, RequestError> {
        self.send(PayloadSet::new())
    }

    /// Send `body` as `text/plain`.
    pub fn send_text(&mut self, body: &str) -> Result<ResponseSnapshot, RequestError> {
        self.begin_send()?;
        self.put_header("Content-Type", "text/plain".to_string());
        let mut body = Cursor::new(body.as_bytes());
        tracing::debug!(method = %self.method, "sending text body");
        self.execute(Some(&mut body as &mut dyn Read))
    }

    /// Send raw bytes with a content type sniffed from their first bytes.
    pub fn send_blob(&mut self, blob: impl Read) -> Result<ResponseSnapshot, RequestError> {
        self.begin_send()?;
        let mut body = BufReader::new(blob);
        let content_type = sniff_content_type(body.fill_buf()?);
        self.put_header("Content-Type", content_type.to_string());
        self.put_header("Content-Transfer-Encoding", "binary".to_string());
        tracing::debug!(method = %self.method, content_type, "sending binary body");
        self.execute(Some(&mut body as &mut dyn Read))
    }

    pub fn state(&self) -> RequestState {
        match self.state {
            RequestState::Opened | RequestState::Sent if self.abort.is_aborted() => {
                RequestState::Aborted
            }
            state => state,
        }
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    /// The target URL, including any query appended by a GET `send`.
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn boundary(&self) -> &str {
        self.encoder.boundary()
    }

    fn ensure_configurable(&self) -> Result<(), RequestError> {
        match self.state() {
            RequestState::Opened => Ok(()),
            RequestState::Unopened => Err(RequestError::IllegalState("not opened")),
            RequestState::Sent => Err(RequestError::IllegalState("already sent")),
            RequestState::Aborted => Err(RequestError::IllegalState("aborted")),
        }
    }

    fn begin_send(&mut self) -> Result<(), RequestError> {
        self.ensure_configurable()?;
        self.state = RequestState::Sent;
        Ok(())
    }

    fn put_header(&mut self, name: &str, value: String) {
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(entry) => *entry = (name.to_string(), value),
            None => self.headers.push((name.to_string(), value)),
        }
    }

    fn execute(&self, body: Option<&mut dyn Read>) -> Result<ResponseSnapshot, RequestError> {
        let url = self
            .url
            .as_ref()
            .ok_or(RequestError::IllegalState("not opened"))?;
        self.abort.check()?;

        let mut body = body.map(|b| CancellableReader::new(b, self.abort.clone()));
        let outbound = Outbound {
            method: self.method,
            url,
            headers: &self.headers,
            timeout: self.timeout,
            body: body.as_mut().map(|b| b as &mut dyn Read),
            abort: &self.abort,
        };
        let result = self
            .transport
            .exchange(outbound)
            .map_err(RequestError::from)
            .and_then(|inbound| ResponseSnapshot::capture(inbound, url.clone(), &self.abort));
        self.abort.detach();

        // A shut-down socket can surface as any I/O error; report the abort.
        match result {
            Err(RequestError::Io(_)) if self.abort.is_aborted() => Err(aborted().into()),
            other => other,
        }
    }
}

fn basic_authorization(username: &str, password: &str) -> String {
    // " : " rather than ":" is what existing servers expect from this client.
    format!("Basic {}", STANDARD.encode(format!("{username} : {password}")))
}

/// Append form-encoded `fields` after the URL's existing query.
fn append_query<'a>(url: &mut Url, fields: impl Iterator<Item = (&'a str, &'a str)>) {
    let mut query = url.query().unwrap_or_default().to_string();
    for (name, value) in fields {
        if !query.is_empty() {
            query.push('&');
        }
        query.extend(byte_serialize(name.as_bytes()));
        query.push('=');
        query.extend(byte_serialize(value.as_bytes()));
    }
    if !query.is_empty() {
        url.set_query(Some(&query));
    }
}
