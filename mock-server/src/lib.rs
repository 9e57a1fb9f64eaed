use std::{collections::BTreeMap, time::Duration};

use axum::{
    body::Bytes,
    extract::Path,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{AppendHeaders, IntoResponse},
    routing::any,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

/// What the server saw of a request, returned by `/inspect`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Inspection {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    /// First value per header name, names lower-cased.
    pub headers: BTreeMap<String, String>,
    pub body_len: usize,
}

const MAX_DELAY_MS: u64 = 10_000;

pub fn app() -> Router {
    Router::new()
        .route("/echo", any(echo))
        .route("/inspect", any(inspect))
        .route("/status/{code}", any(status))
        .route("/duplicate-headers", any(duplicate_headers))
        .route("/slow/{ms}", any(slow))
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

/// Returns the request body verbatim; method, query and content type come
/// back as `x-echo-*` headers.
async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    tracing::debug!(%method, %uri, len = body.len(), "echo");
    (
        [
            ("content-type", "application/octet-stream".to_string()),
            ("x-echo-method", method.to_string()),
            ("x-echo-query", uri.query().unwrap_or_default().to_string()),
            ("x-echo-content-type", content_type),
        ],
        body,
    )
}

async fn inspect(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Json<Inspection> {
    let mut seen = BTreeMap::new();
    for (name, value) in &headers {
        seen.entry(name.as_str().to_string())
            .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    Json(Inspection {
        method: method.to_string(),
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers: seen,
        body_len: body.len(),
    })
}

/// Responds with `code` and a two-line plain-text body.
async fn status(Path(code): Path<u16>) -> impl IntoResponse {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST);
    (
        status,
        [("content-type", "text/plain; charset=utf-8")],
        format!("status {}\r\nfrom mock-server", status.as_u16()),
    )
}

async fn duplicate_headers() -> impl IntoResponse {
    (
        AppendHeaders([("x-dup", "first"), ("x-dup", "second")]),
        "duplicates",
    )
}

async fn slow(Path(ms): Path<u64>) -> &'static str {
    tokio::time::sleep(Duration::from_millis(ms.min(MAX_DELAY_MS))).await;
    "done"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inspection_roundtrips_through_json() {
        let inspection = Inspection {
            method: "POST".to_string(),
            path: "/inspect".to_string(),
            query: Some("a=1".to_string()),
            headers: BTreeMap::from([("user-agent".to_string(), "t".to_string())]),
            body_len: 3,
        };
        let json = serde_json::to_string(&inspection).unwrap();
        let back: Inspection = serde_json::from_str(&json).unwrap();
        assert_eq!(back, inspection);
    }

    #[test]
    fn inspection_query_is_optional() {
        let json = r#"{"method":"GET","path":"/","query":null,"headers":{},"body_len":0}"#;
        let inspection: Inspection = serde_json::from_str(json).unwrap();
        assert!(inspection.query.is_none());
        assert!(inspection.headers.is_empty());
    }
}
