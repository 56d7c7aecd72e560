//! Per-request state carried through matching, filtering and forwarding

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use lodestar_registry::ServiceInstance;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use tracing::trace;

/// Boxed error type carried by streamed bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body: buffered or streamed from an instance
pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

/// A buffered inbound request as the gateway sees it.
///
/// The body is held in memory so every retry attempt can replay it.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayRequest {
    pub fn new(method: Method, path_and_query: &str) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (path_and_query, None),
        };
        Self {
            method,
            path: path.to_string(),
            query,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Add a header, ignoring names or values that are not valid HTTP
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }
}

/// A response on its way back to the caller
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl GatewayResponse {
    /// Response with a fully buffered body
    pub fn full(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Full::new(body.into())
                .map_err(|never| match never {})
                .boxed_unsync(),
        }
    }

    pub fn empty(status: StatusCode) -> Self {
        Self::full(status, Bytes::new())
    }

    /// Response whose body is streamed through
    pub fn streaming(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// JSON error body in the same shape the registry API uses
    pub fn error(status: StatusCode, message: &str, request_id: &str) -> Self {
        let body = serde_json::json!({
            "error": message,
            "status": status.as_u16(),
            "request_id": request_id,
        });
        let mut response = Self::full(status, body.to_string());
        response.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }

    pub fn with_header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Collect the body into memory
    pub async fn into_bytes(self) -> Result<Bytes, BoxError> {
        Ok(self.body.collect().await?.to_bytes())
    }

    pub fn into_http(self) -> http::Response<ResponseBody> {
        let mut response = http::Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

impl fmt::Debug for GatewayResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Where a request is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Received,
    Matched,
    InstanceSelected,
    Forwarding,
    Retrying,
    Completed,
    Failed,
}

impl DispatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Mutable state of one request, owned by the task handling it
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub client_addr: Option<SocketAddr>,
    /// The request as received
    pub original: GatewayRequest,
    /// The request as it will be forwarded, after filters
    pub request: GatewayRequest,
    pub route_id: Option<String>,
    pub service: Option<String>,
    /// Named captures from the matching path pattern
    pub path_variables: HashMap<String, String>,
    pub instance: Option<ServiceInstance>,
    pub attempts: u32,
    pub state: DispatchState,
    /// Headers filters want added to the response
    pub response_headers: HeaderMap,
}

impl RequestContext {
    pub fn new(request: GatewayRequest, client_addr: Option<SocketAddr>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            client_addr,
            original: request.clone(),
            request,
            route_id: None,
            service: None,
            path_variables: HashMap::new(),
            instance: None,
            attempts: 0,
            state: DispatchState::Received,
            response_headers: HeaderMap::new(),
        }
    }

    pub fn transition(&mut self, to: DispatchState) {
        trace!(
            request_id = %self.request_id,
            from = ?self.state,
            to = ?to,
            "Dispatch state change"
        );
        self.state = to;
    }

    /// Copy queued response headers onto `response`
    pub fn decorate(&self, response: &mut GatewayResponse) {
        for (name, value) in &self.response_headers {
            response.headers.append(name.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_splits_query() {
        let req = GatewayRequest::new(Method::GET, "/api/files/1?download=true");
        assert_eq!(req.path, "/api/files/1");
        assert_eq!(req.query.as_deref(), Some("download=true"));
        assert_eq!(req.path_and_query(), "/api/files/1?download=true");
    }

    #[test]
    fn test_request_headers() {
        let req = GatewayRequest::new(Method::GET, "/")
            .header("X-Tenant", "hse")
            .header("bad header", "ignored");
        assert_eq!(req.header_value("x-tenant"), Some("hse"));
        assert_eq!(req.headers.len(), 1);
    }

    #[tokio::test]
    async fn test_error_response_body() {
        let response = GatewayResponse::error(StatusCode::NOT_FOUND, "no route", "req-1");
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        let body = response.into_bytes().await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], 404);
        assert_eq!(json["request_id"], "req-1");
    }

    #[test]
    fn test_context_decorates_response() {
        let mut ctx = RequestContext::new(GatewayRequest::new(Method::GET, "/"), None);
        ctx.response_headers
            .append("x-served-by", HeaderValue::from_static("lodestar"));
        ctx.transition(DispatchState::Completed);
        assert!(ctx.state.is_terminal());

        let mut response = GatewayResponse::empty(StatusCode::OK);
        ctx.decorate(&mut response);
        assert_eq!(response.headers["x-served-by"], "lodestar");
    }
}
