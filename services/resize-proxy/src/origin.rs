use crate::config::OriginConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use reqwest::{redirect, Client, Url};
use thiserror::Error;
use tracing::{debug, instrument};

/// Network-level failures talking to the origin.
///
/// Non-success statuses are not errors; they come back as [`OriginResponse`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Error sending request to origin: {0}")]
    Send(#[source] reqwest::Error),

    #[error("Error reading origin response body: {0}")]
    Body(#[source] reqwest::Error),

    #[error("Origin response exceeded the maximum of {limit} bytes")]
    TooLarge { limit: u64 },
}

/// Headers that only make sense for a single connection
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A request bound for the origin
#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OriginRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Same request aimed at the source of a variant.
    ///
    /// Validators and ranges refer to the variant: forwarding them turns the
    /// source fetch into a 304 or a partial 206 body that cannot be resized.
    pub fn for_source(&self, url: Url) -> Self {
        let mut headers = self.headers.clone();
        for name in [
            header::IF_MATCH,
            header::IF_NONE_MATCH,
            header::IF_MODIFIED_SINCE,
            header::IF_UNMODIFIED_SINCE,
            header::IF_RANGE,
            header::RANGE,
        ] {
            headers.remove(name);
        }

        Self {
            url,
            headers,
            ..self.clone()
        }
    }
}

/// A fully buffered origin response
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OriginResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    /// Swap in a new body and make the framing headers describe it.
    ///
    /// The origin's ETag identified the old bytes, so it is dropped.
    pub fn replace_body(&mut self, body: Bytes) {
        self.headers.insert(header::CONTENT_LENGTH, body.len().into());
        self.headers.remove(header::ETAG);
        self.body = body;
    }
}

impl IntoResponse for OriginResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Fetches objects from the origin
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OriginFetcher: Send + Sync {
    async fn fetch(&self, request: OriginRequest) -> Result<OriginResponse, TransportError>;
}

/// Resolve an inbound path and query against the origin base URL.
///
/// The base path is kept as a prefix, so `http://minio:9000/store` and
/// `/images/cat.jpg` become `http://minio:9000/store/images/cat.jpg`.
pub fn resolve_target(base: &Url, path: &str, query: Option<&str>) -> Url {
    let mut url = base.clone();
    let base_path = base.path().trim_end_matches('/');
    let path = path.trim_start_matches('/');

    url.set_path(&format!("{base_path}/{path}"));
    url.set_query(query);
    url
}

/// reqwest-backed origin client
pub struct HttpOrigin {
    client: Client,
    max_body_bytes: u64,
}

impl HttpOrigin {
    pub fn new(config: &OriginConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            // Redirects are the caller's business
            .redirect(redirect::Policy::none())
            .build()
            .context("Failed to build origin HTTP client")?;

        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes,
        })
    }
}

#[async_trait]
impl OriginFetcher for HttpOrigin {
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn fetch(&self, request: OriginRequest) -> Result<OriginResponse, TransportError> {
        let mut headers = request.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let mut response = builder.send().await.map_err(TransportError::Send)?;
        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);

        // Stream the body so oversized objects are rejected early
        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(TransportError::Body)? {
            if (body.len() + chunk.len()) as u64 > self.max_body_bytes {
                return Err(TransportError::TooLarge {
                    limit: self.max_body_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        debug!(status = %status, size_bytes = body.len(), "Origin responded");

        Ok(OriginResponse {
            status,
            headers,
            body: body.freeze(),
        })
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
