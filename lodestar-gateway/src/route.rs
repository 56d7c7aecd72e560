//! Route definitions and the compiled route table
//!
//! Routes are declared in order and matched in order; the first route whose
//! predicate matches wins. Compilation happens once at startup and any
//! problem in a definition refuses the whole table.
//!
//! ```toml
//! [[gateway.routes]]
//! id = "files"
//! service = "file-storage-service"
//! predicate = { type = "path_prefix", prefix = "/api/files" }
//! filters = ["AddRequestHeader=X-Gateway,lodestar"]
//!
//! [[gateway.routes]]
//! id = "analysis"
//! service = "file-analysis-service"
//! filters = ["RewritePath=/analysis/(?P<rest>.*),/api/analysis/${rest}"]
//!
//! [gateway.routes.predicate]
//! type = "and"
//! predicates = [
//!     { type = "path_regex", pattern = "/analysis/.*" },
//!     { type = "method", methods = ["GET", "DELETE"] },
//! ]
//! ```

use crate::context::GatewayRequest;
use crate::error::{GatewayError, Result};
use crate::filter::{GatewayFilter, parse_filter};
use http::Method;
use http::header::HeaderName;
use lodestar_registry::normalize_service_name;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A predicate as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PredicateDefinition {
    /// Path equals the prefix or continues below it
    PathPrefix { prefix: String },
    /// Whole path matches the pattern
    PathRegex { pattern: String },
    /// Header is present with exactly this value
    HeaderEquals { name: String, value: String },
    /// Request method is one of these
    Method { methods: Vec<String> },
    /// All nested predicates match
    And { predicates: Vec<PredicateDefinition> },
}

impl PredicateDefinition {
    pub fn path_prefix(prefix: impl Into<String>) -> Self {
        Self::PathPrefix {
            prefix: prefix.into(),
        }
    }

    pub fn path_regex(pattern: impl Into<String>) -> Self {
        Self::PathRegex {
            pattern: pattern.into(),
        }
    }

    pub fn header(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::HeaderEquals {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn method(methods: &[&str]) -> Self {
        Self::Method {
            methods: methods.iter().map(|m| m.to_string()).collect(),
        }
    }

    pub fn and(predicates: Vec<PredicateDefinition>) -> Self {
        Self::And { predicates }
    }
}

/// One route as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub id: String,
    pub predicate: PredicateDefinition,
    /// Target service name in the registry
    pub service: String,
    /// Filters in `Name=arg1,arg2` notation, applied in order
    #[serde(default)]
    pub filters: Vec<String>,
}

impl RouteDefinition {
    pub fn new(id: impl Into<String>, predicate: PredicateDefinition, service: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            predicate,
            service: service.into(),
            filters: Vec::new(),
        }
    }

    /// Append a filter declaration
    pub fn filter(mut self, declaration: impl Into<String>) -> Self {
        self.filters.push(declaration.into());
        self
    }
}

/// A compiled predicate
#[derive(Debug, Clone)]
pub enum Predicate {
    PathPrefix(String),
    PathRegex(Regex),
    HeaderEquals(HeaderName, String),
    Method(Vec<Method>),
    And(Vec<Predicate>),
}

impl Predicate {
    pub fn compile(route_id: &str, definition: &PredicateDefinition) -> Result<Self> {
        let invalid = |reason: String| GatewayError::invalid_route(route_id, reason);

        match definition {
            PredicateDefinition::PathPrefix { prefix } => {
                if !prefix.starts_with('/') {
                    return Err(invalid(format!("path prefix '{}' must start with '/'", prefix)));
                }
                Ok(Self::PathPrefix(prefix.clone()))
            }
            PredicateDefinition::PathRegex { pattern } => {
                if pattern.trim().is_empty() {
                    return Err(invalid("empty path pattern".to_string()));
                }
                // Anchor so the pattern has to cover the whole path
                Regex::new(&format!("^(?:{})$", pattern))
                    .map(Self::PathRegex)
                    .map_err(|e| invalid(format!("invalid path pattern '{}': {}", pattern, e)))
            }
            PredicateDefinition::HeaderEquals { name, value } => {
                if name.trim().is_empty() {
                    return Err(invalid("empty header name".to_string()));
                }
                let name = HeaderName::from_bytes(name.trim().as_bytes())
                    .map_err(|e| invalid(format!("invalid header name '{}': {}", name, e)))?;
                Ok(Self::HeaderEquals(name, value.clone()))
            }
            PredicateDefinition::Method { methods } => {
                if methods.is_empty() {
                    return Err(invalid("method predicate lists no methods".to_string()));
                }
                methods
                    .iter()
                    .map(|m| {
                        Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes())
                            .map_err(|_| invalid(format!("invalid method '{}'", m)))
                    })
                    .collect::<Result<Vec<_>>>()
                    .map(Self::Method)
            }
            PredicateDefinition::And { predicates } => {
                if predicates.is_empty() {
                    return Err(invalid("'and' predicate has no members".to_string()));
                }
                predicates
                    .iter()
                    .map(|p| Self::compile(route_id, p))
                    .collect::<Result<Vec<_>>>()
                    .map(Self::And)
            }
        }
    }

    pub fn matches(&self, request: &GatewayRequest) -> bool {
        match self {
            Self::PathPrefix(prefix) => path_has_prefix(&request.path, prefix),
            Self::PathRegex(regex) => regex.is_match(&request.path),
            Self::HeaderEquals(name, value) => request
                .headers
                .get_all(name)
                .iter()
                .any(|v| v.to_str().is_ok_and(|v| v == value)),
            Self::Method(methods) => methods.contains(&request.method),
            Self::And(predicates) => predicates.iter().all(|p| p.matches(request)),
        }
    }

    /// Named groups captured by path patterns, for `SetPath` templates
    pub fn captures(&self, path: &str, into: &mut HashMap<String, String>) {
        match self {
            Self::PathRegex(regex) => {
                if let Some(caps) = regex.captures(path) {
                    for name in regex.capture_names().flatten() {
                        if let Some(m) = caps.name(name) {
                            into.insert(name.to_string(), m.as_str().to_string());
                        }
                    }
                }
            }
            Self::And(predicates) => predicates.iter().for_each(|p| p.captures(path, into)),
            _ => {}
        }
    }
}

/// `/api` matches `/api` and `/api/x` but not `/apix`
fn path_has_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// A route ready for dispatch
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    pub id: String,
    pub predicate: Predicate,
    pub service: String,
    pub filters: Vec<Arc<dyn GatewayFilter>>,
}

impl CompiledRoute {
    pub fn compile(definition: &RouteDefinition) -> Result<Self> {
        let id = definition.id.trim();
        if id.is_empty() {
            return Err(GatewayError::invalid_route("<unnamed>", "route id cannot be empty"));
        }
        let service = normalize_service_name(&definition.service);
        if service.is_empty() {
            return Err(GatewayError::invalid_route(id, "target service cannot be empty"));
        }

        let predicate = Predicate::compile(id, &definition.predicate)?;
        let filters = definition
            .filters
            .iter()
            .map(|declaration| parse_filter(declaration))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| GatewayError::invalid_route(id, e.to_string()))?;

        Ok(Self {
            id: id.to_string(),
            predicate,
            service,
            filters,
        })
    }
}

/// Ordered, compiled routes
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
}

impl RouteTable {
    /// Compile every definition, keeping declaration order
    pub fn compile(definitions: &[RouteDefinition]) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut routes = Vec::with_capacity(definitions.len());

        for definition in definitions {
            let route = CompiledRoute::compile(definition)?;
            if !seen.insert(route.id.clone()) {
                return Err(GatewayError::invalid_route(&route.id, "duplicate route id"));
            }
            routes.push(route);
        }

        Ok(Self { routes })
    }

    /// First route matching `request`
    pub fn find(&self, request: &GatewayRequest) -> Option<&CompiledRoute> {
        self.routes.iter().find(|r| r.predicate.matches(request))
    }

    pub fn routes(&self) -> &[CompiledRoute] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(path: &str) -> GatewayRequest {
        GatewayRequest::new(Method::GET, path)
    }

    #[test]
    fn test_path_prefix_is_segment_aware() {
        let p = Predicate::PathPrefix("/api/files".to_string());
        assert!(p.matches(&get("/api/files")));
        assert!(p.matches(&get("/api/files/42")));
        assert!(!p.matches(&get("/api/filesystem")));
        assert!(Predicate::PathPrefix("/".to_string()).matches(&get("/anything")));
    }

    #[test]
    fn test_path_regex_is_anchored() {
        let p = Predicate::compile("r", &PredicateDefinition::path_regex("/files/[0-9]+")).unwrap();
        assert!(p.matches(&get("/files/12")));
        assert!(!p.matches(&get("/v1/files/12")));
        assert!(!p.matches(&get("/files/12/raw")));
    }

    #[test]
    fn test_header_and_method() {
        let p = Predicate::compile(
            "r",
            &PredicateDefinition::and(vec![
                PredicateDefinition::header("X-Tenant", "hse"),
                PredicateDefinition::method(&["post", "PUT"]),
            ]),
        )
        .unwrap();

        let req = GatewayRequest::new(Method::POST, "/").header("x-tenant", "hse");
        assert!(p.matches(&req));
        let req = GatewayRequest::new(Method::GET, "/").header("x-tenant", "hse");
        assert!(!p.matches(&req));
        let req = GatewayRequest::new(Method::POST, "/").header("x-tenant", "other");
        assert!(!p.matches(&req));
    }

    #[test]
    fn test_named_captures() {
        let p = Predicate::compile(
            "r",
            &PredicateDefinition::path_regex("/files/(?P<id>[^/]+)"),
        )
        .unwrap();
        let mut vars = HashMap::new();
        p.captures("/files/abc", &mut vars);
        assert_eq!(vars.get("id").map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_compile_failures_are_fatal() {
        let cases = vec![
            PredicateDefinition::path_regex(""),
            PredicateDefinition::path_regex("/files/(unclosed"),
            PredicateDefinition::header("", "x"),
            PredicateDefinition::and(vec![]),
            PredicateDefinition::method(&[]),
            PredicateDefinition::path_prefix("api"),
        ];
        for predicate in cases {
            let def = RouteDefinition::new("broken", predicate.clone(), "svc");
            let err = RouteTable::compile(&[def]).unwrap_err();
            assert!(err.is_fatal(), "expected fatal error for {:?}", predicate);
        }
    }

    #[test]
    fn test_bad_route_fields() {
        let empty_service = RouteDefinition::new("r", PredicateDefinition::path_prefix("/"), " ");
        assert!(RouteTable::compile(&[empty_service]).is_err());

        let bad_filter = RouteDefinition::new("r", PredicateDefinition::path_prefix("/"), "svc")
            .filter("Teleport=1");
        assert!(RouteTable::compile(&[bad_filter]).unwrap_err().is_fatal());

        let a = RouteDefinition::new("dup", PredicateDefinition::path_prefix("/a"), "svc");
        let b = RouteDefinition::new("dup", PredicateDefinition::path_prefix("/b"), "svc");
        assert!(RouteTable::compile(&[a, b]).is_err());
    }

    #[test]
    fn test_first_declared_route_wins() {
        let table = RouteTable::compile(&[
            RouteDefinition::new("specific", PredicateDefinition::path_prefix("/api/files"), "first"),
            RouteDefinition::new("catch-all", PredicateDefinition::path_prefix("/api"), "second"),
        ])
        .unwrap();

        assert_eq!(table.find(&get("/api/files/1")).unwrap().service, "first");
        assert_eq!(table.find(&get("/api/other")).unwrap().service, "second");
        assert!(table.find(&get("/health")).is_none());
    }

    #[test]
    fn test_definitions_from_toml() {
        let toml = r#"
            id = "files"
            service = "File-Storage-Service"
            filters = ["StripPrefix=1"]
            predicate = { type = "path_prefix", prefix = "/files" }
        "#;
        let def: RouteDefinition = toml_from_str(toml);
        let route = CompiledRoute::compile(&def).unwrap();
        assert_eq!(route.service, "file-storage-service");
        assert_eq!(route.filters.len(), 1);
    }

    fn toml_from_str(s: &str) -> RouteDefinition {
        let value = lodestar_config::ConfigLoader::new(lodestar_config::FileFormat::Toml)
            .parse(s)
            .unwrap();
        serde_json::from_value(value).unwrap()
    }
}
