//! HTTP/JSON API for the registry
//!
//! | method | path                                   | operation    |
//! |--------|----------------------------------------|--------------|
//! | POST   | `/registry/apps/{service}`             | register     |
//! | PUT    | `/registry/apps/{service}/{id}`        | renew        |
//! | DELETE | `/registry/apps/{service}/{id}`        | deregister   |
//! | PUT    | `/registry/apps/{service}/{id}/status` | set status   |
//! | GET    | `/registry/apps/{service}`             | query        |
//! | GET    | `/registry/apps`                       | full snapshot|
//! | GET    | `/registry/stats`                      | statistics   |

use crate::error::{RegistryError, Result};
use crate::instance::{InstanceStatus, Registration, ServiceInstance, normalize_service_name};
use crate::service::{RegistryService, StatusFilter};
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use matchit::Router;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Largest registration body accepted
pub const MAX_REGISTRATION_BYTES: usize = 64 * 1024;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy)]
enum Endpoint {
    Apps,
    App,
    Instance,
    InstanceStatus,
    Stats,
}

/// Body of a registration request; the service name comes from the path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RegisterRequest {
    fn into_registration(self, service_name: String) -> Registration {
        Registration {
            service_name,
            instance_id: self.instance_id,
            host: self.host,
            port: self.port,
            metadata: self.metadata,
        }
    }
}

impl From<&Registration> for RegisterRequest {
    fn from(registration: &Registration) -> Self {
        Self {
            instance_id: registration.instance_id.clone(),
            host: registration.host.clone(),
            port: registration.port,
            metadata: registration.metadata.clone(),
        }
    }
}

/// Response of a per-service query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstances {
    pub service: String,
    pub instances: Vec<ServiceInstance>,
}

#[derive(Debug, Default, Deserialize)]
struct QueryParams {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    value: Option<String>,
}

/// Serves the registry API over HTTP/1.1
#[derive(Clone)]
pub struct RegistryServer {
    registry: Arc<RegistryService>,
    router: Arc<Router<Endpoint>>,
}

impl RegistryServer {
    pub fn new(registry: Arc<RegistryService>) -> Result<Self> {
        let mut router = Router::new();
        router.insert("/registry/apps", Endpoint::Apps)?;
        router.insert("/registry/apps/{service}", Endpoint::App)?;
        router.insert("/registry/apps/{service}/{id}", Endpoint::Instance)?;
        router.insert("/registry/apps/{service}/{id}/status", Endpoint::InstanceStatus)?;
        router.insert("/registry/stats", Endpoint::Stats)?;

        Ok(Self {
            registry,
            router: Arc::new(router),
        })
    }

    pub fn registry(&self) -> &Arc<RegistryService> {
        &self.registry
    }

    /// Accept connections until `shutdown` is cancelled
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!("Registry listening on http://{}", listener.local_addr()?);

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Registry server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };

            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.handle(req).await) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Error serving registry connection from {}: {:?}", peer, err);
                }
            });
        }
    }

    /// Handle one request, mapping errors to JSON error responses
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match self.dispatch(req).await {
            Ok(response) => response,
            Err(err) => {
                let status = StatusCode::from_u16(err.status_code())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if status.is_server_error() {
                    error!("{} {} failed: {}", method, path, err);
                } else {
                    debug!("{} {} rejected: {}", method, path, err);
                }
                error_response(status, &err.to_string())
            }
        }
    }

    async fn dispatch<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();

        let Ok(matched) = self.router.at(parts.uri.path()) else {
            return Ok(error_response(StatusCode::NOT_FOUND, "no such endpoint"));
        };
        let endpoint = *matched.value;
        let service = matched.params.get("service").map(decode).transpose()?;
        let id = matched.params.get("id").map(decode).transpose()?;
        let params: QueryParams = serde_urlencoded::from_str(parts.uri.query().unwrap_or(""))
            .map_err(|e| RegistryError::BadRequest(e.to_string()))?;

        match (parts.method, endpoint, service, id) {
            (Method::GET, Endpoint::Apps, _, _) => json_response(StatusCode::OK, &self.registry.query_all()),
            (Method::GET, Endpoint::Stats, _, _) => json_response(StatusCode::OK, &self.registry.stats()),
            (Method::GET, Endpoint::App, Some(service), _) => {
                let filter: StatusFilter = params.status.as_deref().unwrap_or("up").parse()?;
                let instances = self.registry.query_with(&service, &filter);
                json_response(
                    StatusCode::OK,
                    &ServiceInstances {
                        service: normalize_service_name(&service),
                        instances,
                    },
                )
            }
            (Method::POST, Endpoint::App, Some(service), _) => {
                let bytes = Limited::new(body, MAX_REGISTRATION_BYTES)
                    .collect()
                    .await
                    .map_err(|e| {
                        if e.downcast_ref::<LengthLimitError>().is_some() {
                            RegistryError::PayloadTooLarge(MAX_REGISTRATION_BYTES)
                        } else {
                            RegistryError::BadRequest(e.to_string())
                        }
                    })?
                    .to_bytes();
                let request: RegisterRequest = serde_json::from_slice(&bytes)?;
                self.registry.register(request.into_registration(service))?;
                Ok(no_content())
            }
            (Method::PUT, Endpoint::Instance, Some(service), Some(id)) => {
                self.registry.renew(&service, &id)?;
                Ok(no_content())
            }
            (Method::DELETE, Endpoint::Instance, Some(service), Some(id)) => {
                self.registry.deregister(&service, &id);
                Ok(no_content())
            }
            (Method::PUT, Endpoint::InstanceStatus, Some(service), Some(id)) => {
                let value = params.value.ok_or_else(|| {
                    RegistryError::BadRequest("missing 'value' query parameter".to_string())
                })?;
                let status: InstanceStatus = value.parse()?;
                self.registry.set_status(&service, &id, status)?;
                Ok(no_content())
            }
            _ => Ok(error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")),
        }
    }
}

fn decode(segment: &str) -> Result<String> {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .map_err(|e| RegistryError::BadRequest(format!("invalid path segment: {}", e)))
}

fn no_content() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<Full<Bytes>>> {
    let body = serde_json::to_vec(value)?;
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": message,
        "status": status.as_u16(),
    });
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}
