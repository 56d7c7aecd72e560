//! HTTP ingress for the gateway

use crate::config::GatewayConfig;
use crate::context::{BoxError, GatewayRequest, GatewayResponse, ResponseBody};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::forward::HttpForwarder;
use crate::route::RouteTable;
use crate::snapshot::{SnapshotCache, SnapshotSource};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Accepts connections and hands every request to the [`Dispatcher`]
#[derive(Clone)]
pub struct GatewayServer {
    dispatcher: Arc<Dispatcher>,
    max_body_bytes: usize,
}

impl GatewayServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            max_body_bytes: GatewayConfig::default().max_body_bytes,
        }
    }

    /// Compile routes and wire the dispatcher from `config`.
    ///
    /// Route or filter errors are returned here and must stop startup.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let routes = RouteTable::compile(&config.routes)?;
        info!(routes = routes.len(), "Compiled gateway routes");

        let forwarder = Arc::new(HttpForwarder::new(config.connect_timeout())?);
        let dispatcher = Dispatcher::new(routes, Arc::new(SnapshotCache::default()), forwarder)
            .load_balancing(config.load_balancing)
            .retry_policy(config.retry_policy())
            .discovery_locator(config.discovery_locator);

        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            max_body_bytes: config.max_body_bytes,
        })
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Keep the dispatcher's snapshot fresh from `source`
    pub fn start_refresh(
        &self,
        source: Arc<dyn SnapshotSource>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        self.dispatcher.cache().start_refresh(source, period, shutdown)
    }

    /// Accept connections until `shutdown` is cancelled
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!("Gateway listening on http://{}", listener.local_addr()?);

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Gateway server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };

            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                // Dropping this future when the client goes away cancels the dispatch
                let service = service_fn(move |req: Request<Incoming>| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.handle(req, Some(peer)).await) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Error serving gateway connection from {}: {:?}", peer, err);
                }
            });
        }
    }

    /// Buffer the request body and dispatch
    pub async fn handle<B>(&self, req: Request<B>, client_addr: Option<SocketAddr>) -> Response<ResponseBody>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();

        let body = match Limited::new(body, self.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let status = if e.downcast_ref::<LengthLimitError>().is_some() {
                    StatusCode::PAYLOAD_TOO_LARGE
                } else {
                    StatusCode::BAD_REQUEST
                };
                debug!("Rejected request body from {:?}: {}", client_addr, e);
                let request_id = uuid::Uuid::new_v4().to_string();
                return GatewayResponse::error(status, &e.to_string(), &request_id).into_http();
            }
        };

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let mut request = GatewayRequest::new(parts.method, path_and_query).body(body);
        request.headers = parts.headers;

        self.dispatcher.dispatch(request, client_addr).await.into_http()
    }
}
