//! In-memory transport that records every exchange and replies with a
//! canned response. Lets the lifecycle tests assert exactly what would have
//! gone over the wire, and that nothing did.

#![allow(dead_code)]

use std::io::{self, Cursor, Read};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use xhr_core::{HttpMethod, Inbound, Outbound, Request, RequestConfig, Transport};

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub body: Option<Vec<u8>>,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub error_body: Option<Vec<u8>>,
}

impl Default for Reply {
    fn default() -> Self {
        Self {
            status: 200,
            status_text: "OK".to_string(),
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: Some(b"ok".to_vec()),
            error_body: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    exchanges: Arc<Mutex<Vec<Recorded>>>,
    reply: Reply,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(reply: Reply) -> Self {
        Self {
            exchanges: Arc::default(),
            reply,
        }
    }

    pub fn exchanges(&self) -> Vec<Recorded> {
        self.exchanges.lock().unwrap().clone()
    }

    pub fn last(&self) -> Recorded {
        self.exchanges().pop().expect("no exchange recorded")
    }

    /// A fresh request wired to this transport.
    pub fn request(&self) -> Request {
        Request::with_transport(self.clone(), RequestConfig::default())
    }
}

impl Transport for RecordingTransport {
    fn exchange(&self, outbound: Outbound<'_>) -> io::Result<Inbound> {
        let body = match outbound.body {
            Some(reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf)?;
                Some(buf)
            }
            None => None,
        };
        self.exchanges.lock().unwrap().push(Recorded {
            method: outbound.method,
            url: outbound.url.to_string(),
            headers: outbound.headers.to_vec(),
            timeout: outbound.timeout,
            body,
        });

        let reply = self.reply.clone();
        Ok(Inbound {
            status: reply.status,
            status_text: reply.status_text,
            headers: reply.headers,
            body: reply.body.map(|b| Box::new(Cursor::new(b)) as Box<dyn Read>),
            error_body: reply.error_body.map(|b| Box::new(Cursor::new(b)) as Box<dyn Read>),
        })
    }
}
