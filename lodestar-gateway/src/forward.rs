//! Forwarding one attempt to one instance

use crate::context::{BoxError, GatewayRequest, GatewayResponse};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use http::HeaderMap;
use http::header::{self, HeaderName};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use lodestar_registry::ServiceInstance;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// Why an attempt produced no response
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The instance could not be reached
    #[error("connection failed: {0}")]
    Connect(String),

    /// The instance did not answer in time
    #[error("timed out")]
    Timeout,

    /// Anything else; not retried
    #[error("{0}")]
    Other(String),
}

impl ForwardError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout)
    }
}

impl From<reqwest::Error> for ForwardError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            Self::Connect(e.to_string())
        } else if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Other(e.to_string())
        }
    }
}

/// Sends a request to a chosen instance
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(
        &self,
        instance: &ServiceInstance,
        request: &GatewayRequest,
    ) -> Result<GatewayResponse, ForwardError>;
}

/// Headers that describe a single connection and are never passed on
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// Forwarder over a pooled `reqwest` client.
///
/// Response bodies are streamed back, not buffered.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new(connect_timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        instance: &ServiceInstance,
        request: &GatewayRequest,
    ) -> Result<GatewayResponse, ForwardError> {
        let url = format!("{}{}", instance.base_url(), request.path_and_query());
        trace!(url = %url, method = %request.method, "Forwarding");

        let mut headers = request.headers.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        let response = self
            .client
            .request(request.method.clone(), url)
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);

        let stream = response
            .bytes_stream()
            .map_ok(Frame::<Bytes>::data)
            .map_err(|e| Box::new(e) as BoxError);
        let body = StreamBody::new(stream).boxed_unsync();

        Ok(GatewayResponse::streaming(status, headers, body))
    }
}
