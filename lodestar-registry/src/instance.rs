//! Service instances and their lifecycle status

use crate::error::{RegistryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a registered instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Registered, no heartbeat seen yet
    Starting,
    /// Receiving traffic
    Up,
    /// Lease expired or reported down
    Down,
    /// Administratively drained
    OutOfService,
    #[default]
    Unknown,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::OutOfService => "OUT_OF_SERVICE",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn is_routable(&self) -> bool {
        matches!(self, Self::Up)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "STARTING" => Ok(Self::Starting),
            "UP" => Ok(Self::Up),
            "DOWN" => Ok(Self::Down),
            "OUT_OF_SERVICE" => Ok(Self::OutOfService),
            "UNKNOWN" => Ok(Self::Unknown),
            other => Err(RegistryError::BadRequest(format!(
                "unknown instance status '{}'",
                other
            ))),
        }
    }
}

/// Canonical form of a service name: trimmed and lowercased.
///
/// Every registry entry point routes names through here, so `FILE-STORAGE`
/// and `file-storage` address the same service.
pub fn normalize_service_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Identifies one instance of one service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub service_name: String,
    pub instance_id: String,
}

impl InstanceKey {
    pub fn new(service_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_name, self.instance_id)
    }
}

/// What an instance announces about itself when it registers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub service_name: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Registration {
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            host: host.into(),
            port,
            metadata: HashMap::new(),
        }
    }

    /// Registration with the conventional `host:service:port` instance id
    pub fn with_default_id(service_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let service_name = service_name.into();
        let host = host.into();
        let instance_id = format!("{}:{}:{}", host, normalize_service_name(&service_name), port);
        Self::new(service_name, instance_id, host, port)
    }

    /// Add metadata
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Normalize names and reject incomplete descriptors
    pub fn validated(mut self) -> Result<Self> {
        self.service_name = normalize_service_name(&self.service_name);
        self.instance_id = self.instance_id.trim().to_string();
        self.host = self.host.trim().to_string();

        if self.service_name.is_empty() {
            return Err(RegistryError::invalid("service name cannot be empty"));
        }
        if self.instance_id.is_empty() {
            return Err(RegistryError::invalid("instance id cannot be empty"));
        }
        if self.host.is_empty() {
            return Err(RegistryError::invalid("host cannot be empty"));
        }
        if self.port == 0 {
            return Err(RegistryError::invalid("port must be non-zero"));
        }
        Ok(self)
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(normalize_service_name(&self.service_name), self.instance_id.trim())
    }
}

/// A registered service instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub instance_id: String,
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub status: InstanceStatus,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    /// Set when the sweeper evicts the lease and removal is deferred by a grace window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evicted_at: Option<DateTime<Utc>>,
}

impl ServiceInstance {
    /// Fresh instance from a validated registration
    pub fn from_registration(registration: Registration, now: DateTime<Utc>) -> Self {
        Self {
            instance_id: registration.instance_id,
            service_name: registration.service_name,
            host: registration.host,
            port: registration.port,
            status: InstanceStatus::Starting,
            metadata: registration.metadata,
            registered_at: now,
            last_heartbeat_at: now,
            evicted_at: None,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(&self.service_name, &self.instance_id)
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL for forwarding, honoring a `secure` metadata flag
    pub fn base_url(&self) -> String {
        let scheme = match self.metadata.get("secure").map(String::as_str) {
            Some("true") => "https",
            _ => "http",
        };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn is_up(&self) -> bool {
        self.status.is_routable() && self.evicted_at.is_none()
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted_at.is_some()
    }

    /// Whether two versions of an instance differ in anything a router cares about
    pub(crate) fn routing_differs(&self, other: &ServiceInstance) -> bool {
        self.status != other.status
            || self.host != other.host
            || self.port != other.port
            || self.metadata != other.metadata
            || self.evicted_at != other.evicted_at
    }
}
