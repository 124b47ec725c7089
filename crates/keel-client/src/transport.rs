//! HTTP transport seam.
//!
//! The failover router talks to the cluster only through [`Transport`].
//! [`HttpTransport`] is the production implementation: one hyper HTTP/1
//! connection per request, no automatic redirect following (redirects are
//! surfaced to the router through [`Response::location`]).

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, LOCATION, USER_AGENT};
use http::{Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use tracing::debug;

use crate::error::TransportError;

/// One outgoing HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// URL without query string. Leader-relative paths are made absolute
    /// by the router.
    pub url: String,
    pub query: Vec<(String, String)>,
    /// Form-encoded body fields, if any.
    pub form: Option<Vec<(String, String)>>,
    /// Bound on the whole exchange. `None` waits indefinitely (long-polls).
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            form: None,
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_query(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_form(mut self, fields: Vec<(String, String)>) -> Self {
        self.form = Some(fields);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The same request aimed at a different URL.
    pub fn retarget(&self, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..self.clone()
        }
    }

    /// URL including the encoded query string.
    pub fn full_url(&self) -> String {
        if self.query.is_empty() {
            self.url.clone()
        } else {
            let sep = if self.url.contains('?') { '&' } else { '?' };
            format!("{}{sep}{}", self.url, encode_pairs(&self.query))
        }
    }
}

/// Status, redirect target and body of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub location: Option<String>,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            location: None,
            body: body.into(),
        }
    }

    pub fn redirect(location: impl Into<String>) -> Self {
        Self {
            status: StatusCode::TEMPORARY_REDIRECT,
            location: Some(location.into()),
            body: Bytes::new(),
        }
    }

    /// A 3xx response carrying a target.
    pub fn redirect_target(&self) -> Option<&str> {
        if self.status.is_redirection() {
            self.location.as_deref()
        } else {
            None
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Performs a single HTTP exchange.
///
/// Implementations must report network failure (refused connection,
/// timeout, broken stream) as [`TransportError`] and must NOT follow
/// redirects themselves. A request that cannot be built is
/// [`TransportError::InvalidRequest`].
pub trait Transport: Send + Sync + 'static {
    fn send(&self, request: Request) -> impl Future<Output = Result<Response, TransportError>> + Send;
}

/// hyper-based HTTP/1 transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    connect_timeout: Duration,
    user_agent: String,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            user_agent: format!("keel-client/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    async fn exchange(&self, request: &Request) -> Result<Response, TransportError> {
        let full_url = request.full_url();
        let uri: Uri = full_url
            .parse()
            .map_err(|e| TransportError::InvalidRequest(format!("invalid url {full_url}: {e}")))?;
        let authority = uri
            .authority()
            .ok_or_else(|| TransportError::InvalidRequest(format!("url without host: {full_url}")))?
            .clone();
        let addr = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));

        let stream = tokio::time::timeout(self.connect_timeout, tokio::net::TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Connect(format!("{addr}: {e}")))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| TransportError::Connect(format!("handshake with {addr}: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "connection closed with error");
            }
        });

        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let mut builder = http::Request::builder()
            .method(request.method.clone())
            .uri(path)
            .header(HOST, authority.as_str())
            .header(USER_AGENT, self.user_agent.as_str());

        let body = match &request.form {
            Some(fields) => {
                builder = builder.header(CONTENT_TYPE, "application/x-www-form-urlencoded");
                Bytes::from(encode_pairs(fields))
            }
            None => Bytes::new(),
        };

        let req = builder
            .body(Full::new(body))
            .map_err(|e| TransportError::InvalidRequest(format!("build request for {full_url}: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let status = resp.status();
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?
            .to_bytes();

        debug!(method = %request.method, url = %full_url, %status, "http exchange complete");
        Ok(Response {
            status,
            location,
            body,
        })
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl Transport for HttpTransport {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        match request.timeout {
            Some(limit) => tokio::time::timeout(limit, self.exchange(&request))
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => self.exchange(&request).await,
        }
    }
}

/// `application/x-www-form-urlencoded` encoding of name/value pairs.
pub fn encode_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Resolve a `Location` header against the URL that produced it.
pub fn resolve_location(base_url: &str, location: &str) -> String {
    if !location.starts_with('/') {
        return location.to_string();
    }
    match base_url.parse::<Uri>() {
        Ok(uri) => match (uri.scheme_str(), uri.authority()) {
            (Some(scheme), Some(authority)) => format!("{scheme}://{authority}{location}"),
            _ => location.to_string(),
        },
        Err(_) => location.to_string(),
    }
}
