use std::{
    io,
    time::Duration,
};

use bytes::Bytes;
use log::debug;
use reqwest::{
    header::{CONTENT_RANGE, RANGE},
    StatusCode,
};
use thiserror::Error;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Default time allowed for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Server returned HTTP {0}")]
    BadStatus(StatusCode),
    #[error("Expected data starting at offset {expected}, but server sent offset {actual:?}")]
    BadContentRange {
        expected: u64,
        actual: Option<u64>,
    },
    #[error("Server returned an empty response")]
    EmptyBody,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How the data returned for a ranged request relates to the existing partial
/// file.
#[derive(Debug)]
pub enum Resume<B> {
    /// The body continues where the partial file ends.
    Append(B),
    /// The server ignored the range and sent the whole resource.
    Restart(B),
    /// The partial file already holds the whole resource.
    Complete,
}

/// A response body that is consumed in pieces.
#[allow(async_fn_in_trait)]
pub trait Body {
    /// Return the next piece of the body or `None` at EOF.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError>;
}

impl Body for reqwest::Response {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.chunk().await?)
    }
}

/// Source of remote resources. Everything the downloaders need from the
/// network goes through this trait so that tests can serve resources from
/// memory.
#[allow(async_fn_in_trait)]
pub trait Transport {
    type Body: Body;

    /// Fetch a small resource entirely into memory.
    async fn fetch(&self, url: &str) -> Result<Bytes, TransportError>;

    /// Fetch a resource starting at byte `offset`. If `offset` is 0, the whole
    /// resource is requested.
    async fn fetch_from(
        &self,
        url: &str,
        offset: u64,
    ) -> Result<Resume<Self::Body>, TransportError>;
}

/// Parse the starting offset out of a `Content-Range: bytes <start>-<end>/<len>`
/// header value.
fn content_range_start(value: &str) -> Option<u64> {
    value.trim()
        .strip_prefix("bytes ")?
        .split('-')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Decide how to treat the response to a request for data starting at
/// `offset`.
fn resume_kind(
    offset: u64,
    status: StatusCode,
    range_start: Option<u64>,
) -> Result<Resume<()>, TransportError> {
    if status == StatusCode::PARTIAL_CONTENT {
        if range_start != Some(offset) {
            return Err(TransportError::BadContentRange {
                expected: offset,
                actual: range_start,
            });
        }

        Ok(Resume::Append(()))
    } else if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
        Ok(Resume::Complete)
    } else if status.is_success() {
        Ok(Resume::Restart(()))
    } else {
        Err(TransportError::BadStatus(status))
    }
}

/// Builder type for creating HTTP transports with non-default behavior.
#[derive(Clone, Debug)]
pub struct HttpTransportBuilder {
    ignore_tls_validation: bool,
    connect_timeout: Duration,
}

impl Default for HttpTransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransportBuilder {
    pub fn new() -> Self {
        Self {
            ignore_tls_validation: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Ignore TLS certificate validation when performing HTTPS requests. By
    /// default, TLS certificate validation is enabled.
    pub fn ignore_tls_validation(mut self, value: bool) -> Self {
        self.ignore_tls_validation = value;
        self
    }

    pub fn connect_timeout(mut self, value: Duration) -> Self {
        self.connect_timeout = value;
        self
    }

    /// Build the transport with the current options. This function fails if
    /// the TLS backend fails to initialize.
    pub fn build(&self) -> Result<HttpTransport, TransportError> {
        debug!("TLS validation enabled: {}", !self.ignore_tls_validation);

        let client = reqwest::ClientBuilder::new()
            .danger_accept_invalid_certs(self.ignore_tls_validation)
            .connect_timeout(self.connect_timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(HttpTransport { client })
    }
}

/// Transport backed by a `reqwest` client.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl Transport for HttpTransport {
    type Body = reqwest::Response;

    async fn fetch(&self, url: &str) -> Result<Bytes, TransportError> {
        debug!("Fetching: {url}");

        let r = self.client.get(url).send().await?;
        let status = r.status();
        if !status.is_success() {
            return Err(TransportError::BadStatus(status));
        }

        Ok(r.bytes().await?)
    }

    async fn fetch_from(
        &self,
        url: &str,
        offset: u64,
    ) -> Result<Resume<Self::Body>, TransportError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            debug!("Requesting bytes {offset}- from: {url}");
            request = request.header(RANGE, format!("bytes={offset}-"));
        } else {
            debug!("Requesting: {url}");
        }

        let r = request.send().await?;
        let range_start = r.headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(content_range_start);

        Ok(match resume_kind(offset, r.status(), range_start)? {
            Resume::Append(()) => Resume::Append(r),
            Resume::Restart(()) => Resume::Restart(r),
            Resume::Complete => Resume::Complete,
        })
    }
}
