//! Remote access to a registry over its HTTP API
//!
//! [`RegistryClient`] is what gateways and service instances hold.
//! [`HeartbeatAgent`] runs inside a service instance: it registers on start,
//! renews every heartbeat interval, registers again when the registry has
//! forgotten the instance and deregisters on shutdown.

use crate::error::{RegistryError, Result};
use crate::http::{RegisterRequest, ServiceInstances};
use crate::instance::{InstanceStatus, Registration, ServiceInstance, normalize_service_name};
use crate::store::RegistrySnapshot;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// HTTP client for the registry API
#[derive(Debug, Clone)]
pub struct RegistryClient {
    base_url: String,
    http: Client,
}

impl RegistryClient {
    /// Create a client for the registry at `base_url`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let parsed = Url::parse(base_url)?;
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn app_url(&self, service_name: &str) -> String {
        format!(
            "{}/registry/apps/{}",
            self.base_url,
            urlencoding::encode(&normalize_service_name(service_name))
        )
    }

    fn instance_url(&self, service_name: &str, instance_id: &str) -> String {
        format!(
            "{}/{}",
            self.app_url(service_name),
            urlencoding::encode(instance_id)
        )
    }

    pub async fn register(&self, registration: &Registration) -> Result<()> {
        let response = self
            .http
            .post(self.app_url(&registration.service_name))
            .json(&RegisterRequest::from(registration))
            .send()
            .await?;
        expect_success(response, registration).await
    }

    pub async fn renew(&self, service_name: &str, instance_id: &str) -> Result<()> {
        let response = self
            .http
            .put(self.instance_url(service_name, instance_id))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::not_found(service_name, instance_id));
        }
        expect_success(response, &(service_name, instance_id)).await
    }

    pub async fn deregister(&self, service_name: &str, instance_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.instance_url(service_name, instance_id))
            .send()
            .await?;
        expect_success(response, &(service_name, instance_id)).await
    }

    pub async fn set_status(
        &self,
        service_name: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<()> {
        let response = self
            .http
            .put(format!("{}/status", self.instance_url(service_name, instance_id)))
            .query(&[("value", status.as_str())])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::not_found(service_name, instance_id));
        }
        expect_success(response, &(service_name, instance_id)).await
    }

    /// UP instances of one service
    pub async fn query(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        let response = self.http.get(self.app_url(service_name)).send().await?;
        let response = check_status(response).await?;
        Ok(response.json::<ServiceInstances>().await?.instances)
    }

    /// Full registry snapshot
    pub async fn fetch_snapshot(&self) -> Result<RegistrySnapshot> {
        let response = self
            .http
            .get(format!("{}/registry/apps", self.base_url))
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(RegistryError::UnexpectedStatus {
        status: status.as_u16(),
        message,
    })
}

async fn expect_success<T: std::fmt::Debug + ?Sized>(
    response: reqwest::Response,
    subject: &T,
) -> Result<()> {
    check_status(response).await.map(|_| ()).inspect_err(|e| {
        debug!("Registry call for {:?} failed: {}", subject, e);
    })
}

/// What one heartbeat did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    Renewed,
    /// The registry had no lease, so the instance registered again
    Reregistered,
}

/// Keeps one instance's lease alive
#[derive(Debug, Clone)]
pub struct HeartbeatAgent {
    client: RegistryClient,
    registration: Registration,
    interval: Duration,
}

impl HeartbeatAgent {
    pub fn new(client: RegistryClient, registration: Registration, interval: Duration) -> Self {
        Self {
            client,
            registration,
            interval,
        }
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    /// Renew once, registering again if the lease is gone
    pub async fn beat(&self) -> Result<Heartbeat> {
        let key = self.registration.key();
        match self.client.renew(&key.service_name, &key.instance_id).await {
            Ok(()) => Ok(Heartbeat::Renewed),
            Err(e) if e.is_not_found() => {
                info!("Lease for {} not found, registering again", key);
                self.client.register(&self.registration).await?;
                Ok(Heartbeat::Reregistered)
            }
            Err(e) => Err(e),
        }
    }

    /// Register and renew in the background until `shutdown` fires, then
    /// deregister.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let key = self.registration.key();

        match self.client.register(&self.registration).await {
            Ok(()) => info!("Registered {} with {}", key, self.client.base_url()),
            Err(e) => warn!("Initial registration of {} failed, will retry: {}", key, e),
        }

        let mut interval =
            tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.beat().await {
                        warn!("Heartbeat for {} failed: {}", key, e);
                    }
                }
            }
        }

        match self
            .client
            .deregister(&key.service_name, &key.instance_id)
            .await
        {
            Ok(()) => info!("Deregistered {}", key),
            Err(e) => warn!("Deregistration of {} failed: {}", key, e),
        }
    }
}
