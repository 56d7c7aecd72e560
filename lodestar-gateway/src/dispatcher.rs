//! Request dispatch
//!
//! Each request walks `Received -> Matched -> InstanceSelected -> Forwarding`
//! and ends `Completed` or `Failed`. A connection failure or an attempt
//! timeout moves it to `Retrying`, which selects again (preferring an
//! instance other than the one that just failed) and forwards once more,
//! until the retry budget is spent.

use crate::balancer::{LoadBalanceStrategy, LoadBalancer};
use crate::context::{DispatchState, GatewayRequest, GatewayResponse, RequestContext};
use crate::error::{GatewayError, Result};
use crate::filter::{GatewayFilter, StripPrefix, run_filters};
use crate::forward::{ForwardError, Forwarder};
use crate::retry::RetryPolicy;
use crate::route::RouteTable;
use crate::snapshot::SnapshotCache;
use arc_swap::ArcSwap;
use http::HeaderValue;
use http::header::HeaderName;
use lodestar_registry::{RegistrySnapshot, ServiceInstance, normalize_service_name};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Routes, balances and forwards requests
pub struct Dispatcher {
    routes: RouteTable,
    cache: Arc<SnapshotCache>,
    /// Snapshot the balancer's per-service state was last pruned against
    pruned_against: ArcSwap<RegistrySnapshot>,
    balancer: LoadBalancer,
    forwarder: Arc<dyn Forwarder>,
    retry: RetryPolicy,
    discovery_locator: bool,
    locator_filters: Vec<Arc<dyn GatewayFilter>>,
}

impl Dispatcher {
    pub fn new(routes: RouteTable, cache: Arc<SnapshotCache>, forwarder: Arc<dyn Forwarder>) -> Self {
        Self {
            routes,
            pruned_against: ArcSwap::new(cache.load()),
            cache,
            balancer: LoadBalancer::default(),
            forwarder,
            retry: RetryPolicy::default(),
            discovery_locator: false,
            locator_filters: vec![Arc::new(StripPrefix { parts: 1 })],
        }
    }

    pub fn load_balancing(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.balancer = LoadBalancer::new(strategy);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Route `/{service}/**` to any registered service no route claims
    pub fn discovery_locator(mut self, enabled: bool) -> Self {
        self.discovery_locator = enabled;
        self
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// Handle one request to completion
    pub async fn dispatch(
        &self,
        request: GatewayRequest,
        client_addr: Option<SocketAddr>,
    ) -> GatewayResponse {
        self.dispatch_with_cancel(request, client_addr, &CancellationToken::new())
            .await
    }

    /// Like [`dispatch`](Self::dispatch), giving up as soon as `cancel` fires
    pub async fn dispatch_with_cancel(
        &self,
        request: GatewayRequest,
        client_addr: Option<SocketAddr>,
        cancel: &CancellationToken,
    ) -> GatewayResponse {
        let started = Instant::now();
        let mut ctx = RequestContext::new(request, client_addr);

        let mut response = match self.try_dispatch(&mut ctx, cancel).await {
            Ok(response) => {
                ctx.transition(DispatchState::Completed);
                response
            }
            Err(e) => {
                ctx.transition(DispatchState::Failed);
                debug!(request_id = %ctx.request_id, error = %e, "Dispatch failed");
                GatewayResponse::error(e.status_code(), &e.to_string(), &ctx.request_id)
            }
        };

        ctx.decorate(&mut response);
        if let Ok(id) = HeaderValue::from_str(&ctx.request_id) {
            response.headers.insert(X_REQUEST_ID, id);
        }

        info!(
            request_id = %ctx.request_id,
            method = %ctx.original.method,
            path = %ctx.original.path,
            route = ctx.route_id.as_deref().unwrap_or("-"),
            service = ctx.service.as_deref().unwrap_or("-"),
            instance = ctx.instance.as_ref().map(|i| i.instance_id.as_str()).unwrap_or("-"),
            attempts = ctx.attempts,
            status = response.status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request dispatched"
        );
        response
    }

    /// Run the state machine, leaving the outcome's details in `ctx`
    pub async fn try_dispatch(
        &self,
        ctx: &mut RequestContext,
        cancel: &CancellationToken,
    ) -> Result<GatewayResponse> {
        let snapshot = self.cache.load();
        self.prune_balancer(&snapshot);

        let (service, filters) = match self.routes.find(&ctx.request) {
            Some(route) => {
                ctx.route_id = Some(route.id.clone());
                route
                    .predicate
                    .captures(&ctx.request.path, &mut ctx.path_variables);
                (route.service.clone(), route.filters.as_slice())
            }
            None => match self.locate(&ctx.request.path, &snapshot) {
                Some(service) => (service, self.locator_filters.as_slice()),
                None => {
                    return Err(GatewayError::NoRoute {
                        method: ctx.request.method.to_string(),
                        path: ctx.request.path.clone(),
                    });
                }
            },
        };
        ctx.service = Some(service.clone());
        ctx.transition(DispatchState::Matched);

        let up = snapshot.up_instances(&service);
        let mut instance = self
            .balancer
            .select(&service, &up)
            .cloned()
            .ok_or_else(|| GatewayError::NoInstances {
                service: service.clone(),
            })?;
        ctx.instance = Some(instance.clone());
        ctx.transition(DispatchState::InstanceSelected);

        if let Some(response) = run_filters(filters, ctx).await? {
            return Ok(response);
        }
        if let Some(addr) = ctx.client_addr
            && let Ok(value) = HeaderValue::from_str(&addr.ip().to_string())
        {
            ctx.request.headers.append(X_FORWARDED_FOR, value);
        }

        loop {
            ctx.attempts += 1;
            ctx.transition(DispatchState::Forwarding);

            let outcome = {
                let _in_flight = self.balancer.acquire(&instance);
                let attempt = tokio::time::timeout(
                    self.retry.attempt_timeout,
                    self.forwarder.forward(&instance, &ctx.request),
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    result = attempt => result.unwrap_or(Err(ForwardError::Timeout)),
                }
            };

            let error = match outcome {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            if !error.is_retryable() || !self.retry.should_retry(ctx.attempts) {
                return Err(exhausted(&service, ctx.attempts, error));
            }

            warn!(
                request_id = %ctx.request_id,
                service = %service,
                instance = %instance.instance_id,
                attempt = ctx.attempts,
                error = %error,
                "Attempt failed, retrying"
            );
            ctx.transition(DispatchState::Retrying);

            let delay = self.retry.delay_before(ctx.attempts);
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            instance = match self.reselect(&snapshot, &service, &instance) {
                Some(next) => next,
                None => return Err(exhausted(&service, ctx.attempts, error)),
            };
            ctx.instance = Some(instance.clone());
            ctx.transition(DispatchState::InstanceSelected);
        }
    }

    /// Pick again from the request's snapshot, avoiding `failed` when possible
    fn reselect(
        &self,
        snapshot: &RegistrySnapshot,
        service: &str,
        failed: &ServiceInstance,
    ) -> Option<ServiceInstance> {
        let up = snapshot.up_instances(service);
        let others: Vec<&ServiceInstance> = up
            .iter()
            .copied()
            .filter(|i| i.instance_id != failed.instance_id)
            .collect();
        let pool = if others.is_empty() { up } else { others };
        self.balancer.select(service, &pool).cloned()
    }

    /// Drop balancer state of services gone from a newly published snapshot
    fn prune_balancer(&self, snapshot: &Arc<RegistrySnapshot>) {
        let previous = self.pruned_against.swap(Arc::clone(snapshot));
        if !Arc::ptr_eq(&previous, snapshot) {
            self.balancer
                .retain_services(|service| snapshot.contains_service(service));
        }
    }

    /// Service named by the first path segment, when the locator is on
    fn locate(&self, path: &str, snapshot: &RegistrySnapshot) -> Option<String> {
        if !self.discovery_locator {
            return None;
        }
        let segment = path.split('/').find(|s| !s.is_empty())?;
        let service = normalize_service_name(segment);
        snapshot.contains_service(&service).then_some(service)
    }
}

fn exhausted(service: &str, attempts: u32, error: ForwardError) -> GatewayError {
    match error {
        ForwardError::Timeout => GatewayError::GatewayTimeout {
            service: service.to_string(),
            attempts,
        },
        ForwardError::Connect(message) | ForwardError::Other(message) => GatewayError::BadGateway {
            service: service.to_string(),
            attempts,
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{PredicateDefinition, RouteDefinition};
    use async_trait::async_trait;
    use http::{Method, StatusCode};
    use lodestar_registry::{RegistryConfig, RegistryService, Registration};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Forwarder for Recorder {
        async fn forward(
            &self,
            instance: &ServiceInstance,
            request: &GatewayRequest,
        ) -> std::result::Result<GatewayResponse, ForwardError> {
            self.seen
                .lock()
                .push((instance.instance_id.clone(), request.path.clone()));
            Ok(GatewayResponse::full(StatusCode::OK, "ok"))
        }
    }

    async fn dispatcher(routes: Vec<RouteDefinition>, recorder: Arc<Recorder>) -> Dispatcher {
        let registry = RegistryService::new(RegistryConfig::default().register_as_up(true));
        registry
            .register(Registration::new("file-storage-service", "fs-1", "10.0.0.1", 8081))
            .unwrap();
        let cache = Arc::new(SnapshotCache::default());
        cache.refresh(&registry).await.unwrap();
        Dispatcher::new(RouteTable::compile(&routes).unwrap(), cache, recorder)
    }

    #[tokio::test]
    async fn test_route_filters_shape_forwarded_request() {
        let recorder = Arc::new(Recorder::default());
        let routes = vec![
            RouteDefinition::new(
                "files",
                PredicateDefinition::path_prefix("/files"),
                "file-storage-service",
            )
            .filter("RewritePath=/files/(?P<rest>.*),/api/files/${rest}")
            .filter("AddResponseHeader=X-Route,files"),
        ];
        let dispatcher = dispatcher(routes, recorder.clone()).await;

        let response = dispatcher
            .dispatch(GatewayRequest::new(Method::GET, "/files/7"), None)
            .await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers["x-route"], "files");
        assert!(response.headers.contains_key("x-request-id"));
        assert_eq!(
            recorder.seen.lock().as_slice(),
            &[("fs-1".to_string(), "/api/files/7".to_string())]
        );
    }

    #[tokio::test]
    async fn test_discovery_locator_strips_service_segment() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher(Vec::new(), recorder.clone())
            .await
            .discovery_locator(true);

        let response = dispatcher
            .dispatch(
                GatewayRequest::new(Method::GET, "/file-storage-service/api/files"),
                None,
            )
            .await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(recorder.seen.lock()[0].1, "/api/files");

        let response = dispatcher
            .dispatch(GatewayRequest::new(Method::GET, "/unknown/api"), None)
            .await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_locator_is_off_by_default() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher(Vec::new(), recorder.clone()).await;
        let response = dispatcher
            .dispatch(
                GatewayRequest::new(Method::GET, "/file-storage-service/api/files"),
                None,
            )
            .await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(recorder.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_departed_services_leave_balancer() {
        let recorder = Arc::new(Recorder::default());
        let registry = RegistryService::new(RegistryConfig::default().register_as_up(true));
        for (service, id) in [("alpha", "a-1"), ("alpha", "a-2"), ("beta", "b-1"), ("beta", "b-2")] {
            registry
                .register(Registration::new(service, id, "10.0.0.1", 80))
                .unwrap();
        }
        let cache = Arc::new(SnapshotCache::default());
        cache.refresh(&registry).await.unwrap();
        let dispatcher = Dispatcher::new(RouteTable::default(), cache.clone(), recorder)
            .discovery_locator(true);

        for path in ["/alpha/x", "/beta/x"] {
            let response = dispatcher
                .dispatch(GatewayRequest::new(Method::GET, path), None)
                .await;
            assert_eq!(response.status, StatusCode::OK);
        }
        assert_eq!(dispatcher.balancer().tracked(), (2, 0));

        registry.deregister("beta", "b-1");
        registry.deregister("beta", "b-2");
        cache.refresh(&registry).await.unwrap();
        dispatcher
            .dispatch(GatewayRequest::new(Method::GET, "/alpha/x"), None)
            .await;
        assert_eq!(dispatcher.balancer().tracked(), (1, 0));
    }

    #[tokio::test]
    async fn test_forwarded_for_is_appended() {
        #[derive(Debug, Default)]
        struct Headers(Mutex<Option<String>>);

        #[async_trait]
        impl Forwarder for Headers {
            async fn forward(
                &self,
                _: &ServiceInstance,
                request: &GatewayRequest,
            ) -> std::result::Result<GatewayResponse, ForwardError> {
                *self.0.lock() = request.header_value("x-forwarded-for").map(str::to_string);
                Ok(GatewayResponse::empty(StatusCode::NO_CONTENT))
            }
        }

        let forwarder = Arc::new(Headers::default());
        let registry = RegistryService::new(RegistryConfig::default().register_as_up(true));
        registry
            .register(Registration::new("svc", "a", "10.0.0.1", 80))
            .unwrap();
        let cache = Arc::new(SnapshotCache::default());
        cache.refresh(&registry).await.unwrap();
        let routes = RouteTable::compile(&[RouteDefinition::new(
            "all",
            PredicateDefinition::path_prefix("/"),
            "svc",
        )])
        .unwrap();
        let dispatcher = Dispatcher::new(routes, cache, forwarder.clone());

        let client: SocketAddr = "192.168.1.20:50000".parse().unwrap();
        dispatcher
            .dispatch(GatewayRequest::new(Method::GET, "/x"), Some(client))
            .await;
        assert_eq!(forwarder.0.lock().as_deref(), Some("192.168.1.20"));
    }

    #[tokio::test]
    async fn test_retry_stays_on_request_snapshot() {
        // Refuses the first attempt after a newer registry view lands
        #[derive(Debug)]
        struct SwapThenRefuse {
            cache: Arc<SnapshotCache>,
            next: Mutex<Option<RegistrySnapshot>>,
            seen: Mutex<Vec<String>>,
        }

        #[async_trait]
        impl Forwarder for SwapThenRefuse {
            async fn forward(
                &self,
                instance: &ServiceInstance,
                _: &GatewayRequest,
            ) -> std::result::Result<GatewayResponse, ForwardError> {
                self.seen.lock().push(instance.instance_id.clone());
                match self.next.lock().take() {
                    Some(snapshot) => {
                        self.cache.store(snapshot);
                        Err(ForwardError::Connect("refused".into()))
                    }
                    None => Ok(GatewayResponse::full(StatusCode::OK, "ok")),
                }
            }
        }

        let original = RegistryService::new(RegistryConfig::default().register_as_up(true));
        original
            .register(Registration::new("svc", "a", "10.0.0.1", 80))
            .unwrap();
        original
            .register(Registration::new("svc", "b", "10.0.0.2", 80))
            .unwrap();
        let replacement = RegistryService::new(RegistryConfig::default().register_as_up(true));
        replacement
            .register(Registration::new("svc", "c", "10.0.0.3", 80))
            .unwrap();

        let cache = Arc::new(SnapshotCache::default());
        cache.refresh(&original).await.unwrap();
        let forwarder = Arc::new(SwapThenRefuse {
            cache: cache.clone(),
            next: Mutex::new(Some(replacement.query_all())),
            seen: Mutex::new(Vec::new()),
        });
        let routes = RouteTable::compile(&[RouteDefinition::new(
            "all",
            PredicateDefinition::path_prefix("/"),
            "svc",
        )])
        .unwrap();
        let dispatcher = Dispatcher::new(routes, cache.clone(), forwarder.clone())
            .retry_policy(RetryPolicy::new(1, Duration::from_secs(1)));

        let response = dispatcher
            .dispatch(GatewayRequest::new(Method::GET, "/x"), None)
            .await;
        assert_eq!(response.status, StatusCode::OK);

        let seen = forwarder.seen.lock().clone();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0], seen[1]);
        assert!(seen.iter().all(|id| id == "a" || id == "b"), "{:?}", seen);
        // Later requests see the new view
        assert!(cache.load().up_instances("svc").iter().any(|i| i.instance_id == "c"));
    }
}
