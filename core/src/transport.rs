//! The network collaborator behind `Request::send`.
//!
//! # Design
//! `Transport` is the only place bytes touch a socket. `Request` hands it an
//! `Outbound` description plus a borrowed body reader and gets back an
//! `Inbound` whose body streams still hold the connection; the response
//! capture drains one of them and drops the `Inbound`, which releases the
//! connection. Keeping the seam this narrow lets the lifecycle be tested with
//! an in-memory transport.
//!
//! Cancellation has two halves. `AbortHandle` carries a flag that
//! `CancellableReader` checks on every read of the outbound body and of the
//! inbound drain, and it holds a clone of the live socket so `abort` can shut
//! the connection down from another thread. A call blocked waiting for the
//! response head then fails at once instead of waiting for the server.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ureq::http::{self, StatusCode};
use ureq::unversioned::resolver::DefaultResolver;
use ureq::unversioned::transport::{
    Buffers, ConnectionDetails, Connector, LazyBuffers, NextTimeout, RustlsConnector,
    Transport as Connection,
};
use ureq::{Agent, SendBody};
use url::Url;

use crate::http::HttpMethod;

/// A request as the transport sees it.
pub struct Outbound<'a> {
    pub method: HttpMethod,
    pub url: &'a Url,
    pub headers: &'a [(String, String)],
    pub timeout: Option<Duration>,
    pub body: Option<&'a mut dyn Read>,
    /// Sockets opened for this exchange should be attached here.
    pub abort: &'a AbortHandle,
}

/// A completed exchange whose body has not been read yet.
///
/// `body` is the success stream and `error_body` the failure stream; a
/// transport fills whichever it has. Dropping the value releases the
/// connection.
pub struct Inbound {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Box<dyn Read>>,
    pub error_body: Option<Box<dyn Read>>,
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbound")
            .field("status", &self.status)
            .field("status_text", &self.status_text)
            .field("headers", &self.headers)
            .field("body", &self.body.is_some())
            .field("error_body", &self.error_body.is_some())
            .finish()
    }
}

pub trait Transport {
    fn exchange(&self, outbound: Outbound<'_>) -> io::Result<Inbound>;
}

/// Blocking transport backed by `ureq`.
///
/// Request bodies are streamed with chunked transfer encoding, so upload size
/// is bounded only by the source. Redirects are followed by ureq; the
/// captured URL stays the one the request was sent to.
///
/// Connections are plain TCP, wrapped in TLS for `https`, and every socket is
/// attached to the exchange's `AbortHandle`. Proxies are not used.
///
/// ureq does not expose the reason phrase from the status line, so
/// `status_text` is the standard phrase for the code, and empty for codes
/// without one (such as 299).
#[derive(Debug, Clone, Default)]
pub struct UreqTransport;

impl Transport for UreqTransport {
    fn exchange(&self, outbound: Outbound<'_>) -> io::Result<Inbound> {
        let config = Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(outbound.timeout)
            .build();
        let connector = ()
            .chain(AbortableConnector::new(outbound.abort.clone()))
            .chain(RustlsConnector::default());
        let agent = Agent::with_parts(config, connector, DefaultResolver::default());

        let mut builder = http::Request::builder()
            .method(outbound.method.as_str())
            .uri(outbound.url.as_str());
        for (name, value) in outbound.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let result = match outbound.body {
            Some(reader) => {
                let request = builder
                    .body(SendBody::from_reader(reader))
                    .map_err(io::Error::other)?;
                agent.run(request)
            }
            None => {
                let request = builder.body(()).map_err(io::Error::other)?;
                agent.run(request)
            }
        };
        let response = result.map_err(into_io)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let reader: Box<dyn Read> = Box::new(response.into_body().into_reader());
        let (body, error_body) = if is_success(status) {
            (Some(reader), None)
        } else {
            (None, Some(reader))
        };

        Ok(Inbound {
            status,
            status_text: reason_phrase(status),
            headers,
            body,
            error_body,
        })
    }
}

/// Status codes whose body is read from the success stream.
pub(crate) fn is_success(status: u16) -> bool {
    (200..400).contains(&status)
}

fn reason_phrase(status: u16) -> String {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or_default()
        .to_string()
}

fn into_io(err: ureq::Error) -> io::Error {
    match err {
        ureq::Error::Io(e) => e,
        other => io::Error::other(other),
    }
}

/// Opens TCP connections and attaches each one to an `AbortHandle`.
#[derive(Debug)]
struct AbortableConnector {
    abort: AbortHandle,
}

impl AbortableConnector {
    fn new(abort: AbortHandle) -> Self {
        Self { abort }
    }
}

impl Connector<()> for AbortableConnector {
    type Out = AbortableStream;

    fn connect(
        &self,
        details: &ConnectionDetails,
        _chained: Option<()>,
    ) -> Result<Option<Self::Out>, ureq::Error> {
        let per_attempt = details.timeout.not_zero().map(|t| *t);
        let mut last_err = None;
        for addr in &details.addrs {
            let attempt = match per_attempt {
                Some(timeout) => TcpStream::connect_timeout(addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    if details.config.no_delay() {
                        stream.set_nodelay(true)?;
                    }
                    self.abort.attach(&stream)?;
                    tracing::debug!(%addr, "connected");
                    let buffers = LazyBuffers::new(
                        details.config.input_buffer_size(),
                        details.config.output_buffer_size(),
                    );
                    return Ok(Some(AbortableStream {
                        stream,
                        buffers,
                        abort: self.abort.clone(),
                    }));
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "connect failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.map_or(ureq::Error::ConnectionFailed, ureq::Error::Io))
    }
}

/// A TCP connection that reports a shutdown caused by `abort` as
/// `ConnectionAborted` rather than as a closed stream.
struct AbortableStream {
    stream: TcpStream,
    buffers: LazyBuffers,
    abort: AbortHandle,
}

impl AbortableStream {
    fn classify(&self, err: io::Error, timeout: &NextTimeout) -> ureq::Error {
        if self.abort.is_aborted() {
            return ureq::Error::Io(aborted());
        }
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                ureq::Error::Timeout(timeout.reason)
            }
            _ => ureq::Error::Io(err),
        }
    }
}

impl fmt::Debug for AbortableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortableStream")
            .field("peer", &self.stream.peer_addr().ok())
            .finish()
    }
}

impl Connection for AbortableStream {
    fn buffers(&mut self) -> &mut dyn Buffers {
        &mut self.buffers
    }

    fn transmit_output(&mut self, amount: usize, timeout: NextTimeout) -> Result<(), ureq::Error> {
        self.stream.set_write_timeout(timeout.not_zero().map(|t| *t))?;
        let output = &self.buffers.output()[..amount];
        match self.stream.write_all(output) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.classify(e, &timeout)),
        }
    }

    fn await_input(&mut self, timeout: NextTimeout) -> Result<bool, ureq::Error> {
        self.stream.set_read_timeout(timeout.not_zero().map(|t| *t))?;
        let input = self.buffers.input_append_buf();
        let amount = match self.stream.read(input) {
            Ok(0) if self.abort.is_aborted() => return Err(ureq::Error::Io(aborted())),
            Ok(n) => n,
            Err(e) => return Err(self.classify(e, &timeout)),
        };
        self.buffers.input_appended(amount);
        Ok(amount > 0)
    }

    fn is_open(&mut self) -> bool {
        if self.abort.is_aborted() || self.stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut probe = [0u8; 1];
        let idle = matches!(
            self.stream.read(&mut probe),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock
        );
        idle && self.stream.set_nonblocking(false).is_ok()
    }
}

pub(crate) fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "request aborted")
}

/// Cancels a request from any thread.
///
/// `abort` trips a shared flag and shuts down whichever socket is attached,
/// so a thread blocked on that socket wakes with an error.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    inner: Arc<AbortState>,
}

#[derive(Debug, Default)]
struct AbortState {
    aborted: AtomicBool,
    socket: Mutex<Option<TcpStream>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        if let Some(socket) = self.take_socket() {
            // Already-closed sockets report NotConnected; nothing to do then.
            let _ = socket.shutdown(Shutdown::Both);
            tracing::debug!("connection shut down by abort");
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Make `stream` the connection that `abort` shuts down, replacing any
    /// earlier one. Fails, after shutting `stream` down, if the handle has
    /// already been aborted.
    pub fn attach(&self, stream: &TcpStream) -> io::Result<()> {
        let clone = stream.try_clone()?;
        let mut slot = self
            .inner
            .socket
            .lock()
            .map_err(|_| io::Error::other("abort handle poisoned"))?;
        if self.is_aborted() {
            let _ = clone.shutdown(Shutdown::Both);
            return Err(aborted());
        }
        *slot = Some(clone);
        Ok(())
    }

    /// Forget the attached connection once the exchange is over.
    pub(crate) fn detach(&self) {
        drop(self.take_socket());
    }

    pub(crate) fn check(&self) -> io::Result<()> {
        if self.is_aborted() {
            return Err(aborted());
        }
        Ok(())
    }

    fn take_socket(&self) -> Option<TcpStream> {
        self.inner.socket.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Fails every read once its `AbortHandle` has been tripped.
pub(crate) struct CancellableReader<R> {
    inner: R,
    abort: AbortHandle,
}

impl<R: Read> CancellableReader<R> {
    pub(crate) fn new(inner: R, abort: AbortHandle) -> Self {
        Self { inner, abort }
    }
}

impl<R: Read> Read for CancellableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.abort.check()?;
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn abort_is_shared_between_clones() {
        let handle = AbortHandle::default();
        let other = handle.clone();
        assert!(!other.is_aborted());
        handle.abort();
        assert!(other.is_aborted());
        assert_eq!(other.check().unwrap_err().kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn cancellable_reader_stops_after_abort() {
        let handle = AbortHandle::default();
        let mut reader = CancellableReader::new(Cursor::new(vec![1u8; 8]), handle.clone());
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        handle.abort();
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn success_range_is_2xx_and_3xx() {
        assert!(!is_success(199));
        assert!(is_success(200));
        assert!(is_success(304));
        assert!(!is_success(400));
        assert!(!is_success(500));
    }

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn abort_unblocks_a_reader_on_the_attached_socket() {
        let (mut client, _server) = connected_pair();
        let handle = AbortHandle::default();
        handle.attach(&client).unwrap();

        let aborter = {
            let handle = handle.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                handle.abort();
            })
        };
        let started = std::time::Instant::now();
        let mut buf = [0u8; 16];
        // The peer never writes; only the shutdown can end this read.
        let result = client.read(&mut buf);
        aborter.join().unwrap();

        assert!(matches!(result, Ok(0) | Err(_)), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn attach_after_abort_is_refused() {
        let (client, _server) = connected_pair();
        let handle = AbortHandle::default();
        handle.abort();
        let err = handle.attach(&client).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn detach_forgets_the_socket() {
        let (mut client, mut server) = connected_pair();
        let handle = AbortHandle::default();
        handle.attach(&client).unwrap();
        handle.detach();
        handle.abort();

        server.write_all(b"still open").unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"still open");
    }

    #[test]
    fn status_text_is_the_standard_phrase() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(404), "Not Found");
        assert_eq!(reason_phrase(299), "");
    }
}
