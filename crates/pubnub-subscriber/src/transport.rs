//! Transport seam: execute one request descriptor, get bytes or a classified error.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::Config;
use crate::types::{Error, Operation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A request descriptor. `path` is already percent-encoded; `query` values are raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub operation: Operation,
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn get(operation: Operation, path: impl Into<String>) -> Self {
        Self {
            operation,
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    /// First value of a query parameter.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A successful (2xx) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Cancelled,
    Network,
    Http4xx,
    Http5xx,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Network => "network",
            Self::Http4xx => "http 4xx",
            Self::Http5xx => "http 5xx",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    /// HTTP status for `Http4xx`/`Http5xx`.
    pub status: Option<u16>,
    /// Error detail, or the response body for HTTP errors.
    pub message: String,
}

impl TransportError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Timeout,
            status: None,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Network,
            status: None,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: TransportErrorKind::Cancelled,
            status: None,
            message: "request cancelled".to_string(),
        }
    }

    /// Classify a non-2xx status: 5xx is a server error, anything else a client error.
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        let kind = if status >= 500 {
            TransportErrorKind::Http5xx
        } else {
            TransportErrorKind::Http4xx
        };
        Self {
            kind,
            status: Some(status),
            message: body.into(),
        }
    }
}

/// Executes requests on behalf of the subscribe loop, the heartbeat worker and
/// one-shot endpoints. Implementations must honor `timeout`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &Request, timeout: Duration)
    -> Result<Response, TransportError>;
}

/// Default [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.timing.connect_timeout)
            .build()?;
        Ok(Self::with_client(client, config.base_url()))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn build_url(&self, request: &Request) -> Result<url::Url, url::ParseError> {
        let mut url = url::Url::parse(&format!("{}{}", self.base_url, request.path))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }
        Ok(url)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response, TransportError> {
        let url = self
            .build_url(request)
            .map_err(|e| TransportError::network(format!("invalid request URL: {e}")))?;
        let mut builder = match request.method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
        };
        if let Some(body) = &request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
        }

        tracing::trace!(operation = ?request.operation, path = %request.path, "Executing request");
        let resp = builder.timeout(timeout).send().await.map_err(classify)?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(classify)?;
        if resp_ok(status) {
            Ok(Response { status, body })
        } else {
            Err(TransportError::http(
                status,
                String::from_utf8_lossy(&body).into_owned(),
            ))
        }
    }
}

fn resp_ok(status: u16) -> bool {
    (200..300).contains(&status)
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::timeout(e.to_string())
    } else {
        TransportError::network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_classification() {
        let e = TransportError::http(404, "Not Found");
        assert_eq!(e.kind, TransportErrorKind::Http4xx);
        assert_eq!(e.status, Some(404));

        let e = TransportError::http(503, "Service Unavailable");
        assert_eq!(e.kind, TransportErrorKind::Http5xx);
        assert_eq!(e.status, Some(503));
    }

    #[test]
    fn transport_error_display() {
        let e = TransportError::http(403, "Forbidden");
        assert_eq!(e.to_string(), "http 4xx: Forbidden");
        assert_eq!(TransportError::cancelled().to_string(), "cancelled: request cancelled");
    }

    #[test]
    fn build_url_keeps_encoded_path_and_encodes_query() {
        let transport =
            HttpTransport::with_client(reqwest::Client::new(), "https://ps.pndsn.com");
        let mut request = Request::get(Operation::Subscribe, "/v2/subscribe/sub/a%20b,c/0");
        request
            .query
            .push(("filter-expr".to_string(), "uuid != 'me'".to_string()));
        request.query.push(("tt".to_string(), "0".to_string()));
        let url = transport.build_url(&request).unwrap();
        assert_eq!(url.path(), "/v2/subscribe/sub/a%20b,c/0");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs, request.query);
    }

    #[test]
    fn build_url_without_query() {
        let transport = HttpTransport::with_client(reqwest::Client::new(), "http://127.0.0.1:1");
        let request = Request::get(Operation::Leave, "/v2/presence/sub-key/s/channel/a/leave");
        let url = transport.build_url(&request).unwrap();
        assert_eq!(url.query(), None);
    }

    #[test]
    fn query_value_lookup() {
        let mut request = Request::get(Operation::Heartbeat, "/");
        request.query.push(("heartbeat".to_string(), "6".to_string()));
        assert_eq!(request.query_value("heartbeat"), Some("6"));
        assert_eq!(request.query_value("tt"), None);
    }
}
