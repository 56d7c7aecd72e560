//! Request filters
//!
//! A filter transforms the [`RequestContext`] or answers the request itself.
//! Filters run in declaration order and the first one to answer stops the
//! chain; nothing is forwarded after that.
//!
//! Filters are declared as `Name=arg1,arg2`:
//!
//! | filter                | arguments                                    |
//! |-----------------------|----------------------------------------------|
//! | `StripPrefix`         | number of leading path segments to drop      |
//! | `PrefixPath`          | path to prepend                              |
//! | `RewritePath`         | regex, replacement                           |
//! | `SetPath`             | template with `{name}` path variables        |
//! | `AddRequestHeader`    | name, value                                  |
//! | `RemoveRequestHeader` | name                                         |
//! | `AddResponseHeader`   | name, value                                  |
//! | `RequestRateLimiter`  | replenish rate, burst capacity[, key header] |

use crate::context::{GatewayResponse, RequestContext};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use http::header::{HeaderName, HeaderValue};
use http::StatusCode;
use parking_lot::Mutex;
use regex::Regex;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// What a filter decided
#[derive(Debug)]
pub enum FilterOutcome {
    /// Pass the request on
    Continue,
    /// Answer now and skip the rest of the chain
    Respond(GatewayResponse),
}

/// Transforms or short-circuits a request
#[async_trait]
pub trait GatewayFilter: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    async fn apply(&self, ctx: &mut RequestContext) -> Result<FilterOutcome>;
}

/// Run `filters` in order, stopping at the first response
pub async fn run_filters(
    filters: &[Arc<dyn GatewayFilter>],
    ctx: &mut RequestContext,
) -> Result<Option<GatewayResponse>> {
    for filter in filters {
        match filter.apply(ctx).await? {
            FilterOutcome::Continue => {}
            FilterOutcome::Respond(response) => {
                debug!(
                    request_id = %ctx.request_id,
                    filter = filter.name(),
                    status = %response.status,
                    "Filter answered request"
                );
                return Ok(Some(response));
            }
        }
    }
    Ok(None)
}

/// Compile a `Name=args` declaration
pub fn parse_filter(declaration: &str) -> Result<Arc<dyn GatewayFilter>> {
    let (name, args) = match declaration.split_once('=') {
        Some((name, args)) => (name.trim(), args.trim()),
        None => (declaration.trim(), ""),
    };
    let invalid = |reason: &str| GatewayError::invalid_filter(declaration, reason);
    let list: Vec<&str> = if args.is_empty() {
        Vec::new()
    } else {
        args.split(',').map(str::trim).collect()
    };

    let filter: Arc<dyn GatewayFilter> = match name {
        "StripPrefix" => {
            let [parts] = list[..] else {
                return Err(invalid("expected StripPrefix=<segments>"));
            };
            let parts = parts
                .parse()
                .map_err(|_| invalid("segment count must be a non-negative integer"))?;
            Arc::new(StripPrefix { parts })
        }
        "PrefixPath" => {
            let [prefix] = list[..] else {
                return Err(invalid("expected PrefixPath=<path>"));
            };
            if !prefix.starts_with('/') {
                return Err(invalid("prefix must start with '/'"));
            }
            Arc::new(PrefixPath {
                prefix: prefix.trim_end_matches('/').to_string(),
            })
        }
        "RewritePath" => {
            // The pattern itself may contain commas, the replacement may not
            let Some((pattern, replacement)) = args.rsplit_once(',') else {
                return Err(invalid("expected RewritePath=<regex>,<replacement>"));
            };
            let regex = Regex::new(pattern.trim())
                .map_err(|e| invalid(&format!("invalid regex: {}", e)))?;
            Arc::new(RewritePath {
                regex,
                replacement: replacement.trim().replace("$\\{", "${"),
            })
        }
        "SetPath" => {
            let [template] = list[..] else {
                return Err(invalid("expected SetPath=<template>"));
            };
            if !template.starts_with('/') {
                return Err(invalid("template must start with '/'"));
            }
            Arc::new(SetPath {
                template: template.to_string(),
            })
        }
        "AddRequestHeader" | "AddResponseHeader" => {
            let [header, value] = list[..] else {
                return Err(invalid("expected <name>,<value>"));
            };
            let header = header_name(header).map_err(|reason| invalid(&reason))?;
            let value = HeaderValue::from_str(value).map_err(|_| invalid("invalid header value"))?;
            if name == "AddRequestHeader" {
                Arc::new(AddRequestHeader { name: header, value })
            } else {
                Arc::new(AddResponseHeader { name: header, value })
            }
        }
        "RemoveRequestHeader" => {
            let [header] = list[..] else {
                return Err(invalid("expected RemoveRequestHeader=<name>"));
            };
            let header = header_name(header).map_err(|reason| invalid(&reason))?;
            Arc::new(RemoveRequestHeader { name: header })
        }
        "RequestRateLimiter" => {
            let (replenish, burst, key_header) = match list[..] {
                [replenish, burst] => (replenish, burst, None),
                [replenish, burst, key] => (replenish, burst, Some(key)),
                _ => {
                    return Err(invalid(
                        "expected RequestRateLimiter=<replenish>,<burst>[,<key header>]",
                    ));
                }
            };
            let replenish: f64 = replenish
                .parse()
                .ok()
                .filter(|r: &f64| *r > 0.0)
                .ok_or_else(|| invalid("replenish rate must be a positive number"))?;
            let burst: u64 = burst
                .parse()
                .ok()
                .filter(|b| *b > 0)
                .ok_or_else(|| invalid("burst capacity must be a positive integer"))?;
            let key_header = key_header
                .map(header_name)
                .transpose()
                .map_err(|reason| invalid(&reason))?;
            Arc::new(RequestRateLimiter::new(burst, replenish, key_header))
        }
        other => return Err(invalid(&format!("unknown filter '{}'", other))),
    };

    Ok(filter)
}

fn header_name(raw: &str) -> std::result::Result<HeaderName, String> {
    if raw.is_empty() {
        return Err("empty header name".to_string());
    }
    HeaderName::from_bytes(raw.as_bytes()).map_err(|_| format!("invalid header name '{}'", raw))
}

/// Drops the first `parts` path segments
#[derive(Debug)]
pub struct StripPrefix {
    pub parts: usize,
}

#[async_trait]
impl GatewayFilter for StripPrefix {
    fn name(&self) -> &'static str {
        "StripPrefix"
    }

    async fn apply(&self, ctx: &mut RequestContext) -> Result<FilterOutcome> {
        let remaining: Vec<&str> = ctx
            .request
            .path
            .split('/')
            .filter(|s| !s.is_empty())
            .skip(self.parts)
            .collect();
        let trailing = ctx.request.path.ends_with('/') && !remaining.is_empty();

        let mut path = format!("/{}", remaining.join("/"));
        if trailing {
            path.push('/');
        }
        ctx.request.path = path;
        Ok(FilterOutcome::Continue)
    }
}

#[derive(Debug)]
pub struct PrefixPath {
    prefix: String,
}

#[async_trait]
impl GatewayFilter for PrefixPath {
    fn name(&self) -> &'static str {
        "PrefixPath"
    }

    async fn apply(&self, ctx: &mut RequestContext) -> Result<FilterOutcome> {
        ctx.request.path = format!("{}{}", self.prefix, ctx.request.path);
        Ok(FilterOutcome::Continue)
    }
}

#[derive(Debug)]
pub struct RewritePath {
    regex: Regex,
    replacement: String,
}

#[async_trait]
impl GatewayFilter for RewritePath {
    fn name(&self) -> &'static str {
        "RewritePath"
    }

    async fn apply(&self, ctx: &mut RequestContext) -> Result<FilterOutcome> {
        let rewritten = self
            .regex
            .replace_all(&ctx.request.path, self.replacement.as_str())
            .into_owned();
        ctx.request.path = if rewritten.starts_with('/') {
            rewritten
        } else {
            format!("/{}", rewritten)
        };
        Ok(FilterOutcome::Continue)
    }
}

/// Replaces the path, filling `{name}` from the route's path variables
#[derive(Debug)]
pub struct SetPath {
    template: String,
}

#[async_trait]
impl GatewayFilter for SetPath {
    fn name(&self) -> &'static str {
        "SetPath"
    }

    async fn apply(&self, ctx: &mut RequestContext) -> Result<FilterOutcome> {
        let mut path = self.template.clone();
        for (name, value) in &ctx.path_variables {
            path = path.replace(&format!("{{{}}}", name), value);
        }
        ctx.request.path = path;
        Ok(FilterOutcome::Continue)
    }
}

#[derive(Debug)]
pub struct AddRequestHeader {
    name: HeaderName,
    value: HeaderValue,
}

#[async_trait]
impl GatewayFilter for AddRequestHeader {
    fn name(&self) -> &'static str {
        "AddRequestHeader"
    }

    async fn apply(&self, ctx: &mut RequestContext) -> Result<FilterOutcome> {
        ctx.request
            .headers
            .append(self.name.clone(), self.value.clone());
        Ok(FilterOutcome::Continue)
    }
}

#[derive(Debug)]
pub struct RemoveRequestHeader {
    name: HeaderName,
}

#[async_trait]
impl GatewayFilter for RemoveRequestHeader {
    fn name(&self) -> &'static str {
        "RemoveRequestHeader"
    }

    async fn apply(&self, ctx: &mut RequestContext) -> Result<FilterOutcome> {
        ctx.request.headers.remove(&self.name);
        Ok(FilterOutcome::Continue)
    }
}

/// Queues a header for the eventual response, whoever produces it
#[derive(Debug)]
pub struct AddResponseHeader {
    name: HeaderName,
    value: HeaderValue,
}

#[async_trait]
impl GatewayFilter for AddResponseHeader {
    fn name(&self) -> &'static str {
        "AddResponseHeader"
    }

    async fn apply(&self, ctx: &mut RequestContext) -> Result<FilterOutcome> {
        ctx.response_headers
            .append(self.name.clone(), self.value.clone());
        Ok(FilterOutcome::Continue)
    }
}

/// How often idle buckets are swept out
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refilled(&self, now: Instant, rate: f64, capacity: f64) -> f64 {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * rate).min(capacity)
    }
}

/// Token bucket per client key; an empty bucket answers 429.
///
/// The key is the configured header's value when present, otherwise the
/// client IP address. A bucket that has refilled to capacity behaves like a
/// fresh one, so such buckets are dropped on a periodic sweep.
#[derive(Debug)]
pub struct RequestRateLimiter {
    capacity: u64,
    replenish_rate: f64,
    key_header: Option<HeaderName>,
    buckets: DashMap<String, BucketState>,
    last_cleanup: Mutex<Instant>,
}

impl RequestRateLimiter {
    pub fn new(capacity: u64, replenish_rate: f64, key_header: Option<HeaderName>) -> Self {
        Self {
            capacity,
            replenish_rate,
            key_header,
            buckets: DashMap::new(),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    /// Number of clients currently tracked
    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drop every bucket that has refilled to capacity
    pub fn cleanup(&self) {
        let now = Instant::now();
        let capacity = self.capacity as f64;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, state| state.refilled(now, self.replenish_rate, capacity) < capacity);
        *self.last_cleanup.lock() = now;
        debug!(
            removed = before.saturating_sub(self.buckets.len()),
            remaining = self.buckets.len(),
            "Rate limiter buckets swept"
        );
    }

    fn cleanup_due(&self, now: Instant) -> bool {
        now.duration_since(*self.last_cleanup.lock()) >= CLEANUP_INTERVAL
    }

    fn key(&self, ctx: &RequestContext) -> String {
        self.key_header
            .as_ref()
            .and_then(|h| ctx.request.headers.get(h))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| ctx.client_addr.map(|a| a.ip().to_string()))
            .unwrap_or_else(|| "anonymous".to_string())
    }

    /// Take one token for `key`, returning whether it was granted and how many remain
    pub fn try_acquire(&self, key: &str) -> (bool, u64) {
        let now = Instant::now();
        // Must run before the entry below is held
        if self.cleanup_due(now) {
            self.cleanup();
        }

        let mut state = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| BucketState {
                tokens: self.capacity as f64,
                last_refill: now,
            });

        state.tokens = state.refilled(now, self.replenish_rate, self.capacity as f64);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            (true, state.tokens as u64)
        } else {
            (false, 0)
        }
    }
}

#[async_trait]
impl GatewayFilter for RequestRateLimiter {
    fn name(&self) -> &'static str {
        "RequestRateLimiter"
    }

    async fn apply(&self, ctx: &mut RequestContext) -> Result<FilterOutcome> {
        let key = self.key(ctx);
        let (allowed, remaining) = self.try_acquire(&key);
        let remaining = HeaderValue::from(remaining);

        if allowed {
            ctx.response_headers
                .insert(HeaderName::from_static("x-ratelimit-remaining"), remaining);
            return Ok(FilterOutcome::Continue);
        }

        debug!(request_id = %ctx.request_id, key = %key, "Rate limit exceeded");
        let response = GatewayResponse::error(
            StatusCode::TOO_MANY_REQUESTS,
            "rate limit exceeded",
            &ctx.request_id,
        )
        .with_header(HeaderName::from_static("x-ratelimit-remaining"), remaining);
        Ok(FilterOutcome::Respond(response))
    }
}
