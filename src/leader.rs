//! Lease-based leader election
//!
//! Only the replica holding the coordination Lease reconciles. The holder
//! renews every [`RENEW_INTERVAL`]; other replicas retry every
//! [`RETRY_INTERVAL`] and take over once the lease has gone unrenewed for
//! its full duration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub const LEASE_NAME: &str = "storage-client-operator-leader";
pub const LEASE_DURATION_SECS: i32 = 15;
pub const RENEW_INTERVAL: Duration = Duration::from_secs(10);
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Whether a lease last renewed per `spec` may be taken over at `now`
pub fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let Some(renewed) = spec.and_then(|s| s.renew_time.as_ref()) else {
        return true;
    };
    let duration = spec
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or(LEASE_DURATION_SECS);
    now > renewed.0 + chrono::Duration::seconds(i64::from(duration))
}

/// The Lease this replica competes for
pub struct LeaseLock {
    leases: Api<Lease>,
    namespace: String,
    identity: String,
}

impl LeaseLock {
    pub fn new(client: Client, namespace: &str, identity: &str) -> Self {
        Self {
            leases: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }
    }

    async fn patch_spec(&self, spec: serde_json::Value) -> Result<()> {
        self.leases
            .patch(
                LEASE_NAME,
                &PatchParams::default(),
                &Patch::Merge(&json!({ "spec": spec })),
            )
            .await?;
        Ok(())
    }

    /// Renew the lease if held, take it over if expired, create it if absent.
    /// Returns whether this replica holds the lease afterwards.
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();

        let existing = match self.leases.get_opt(LEASE_NAME).await? {
            Some(lease) => lease,
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(LEASE_NAME.to_string()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec {
                        holder_identity: Some(self.identity.clone()),
                        acquire_time: Some(MicroTime(now)),
                        renew_time: Some(MicroTime(now)),
                        lease_duration_seconds: Some(LEASE_DURATION_SECS),
                        ..Default::default()
                    }),
                };
                self.leases.create(&PostParams::default(), &lease).await?;
                info!("Created lease {} with holder {}", LEASE_NAME, self.identity);
                return Ok(true);
            }
        };

        let spec = existing.spec.as_ref();
        let holder = spec.and_then(|s| s.holder_identity.as_deref());

        if holder == Some(self.identity.as_str()) {
            self.patch_spec(json!({
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION_SECS,
            }))
            .await?;
            return Ok(true);
        }

        if !lease_expired(spec, now) {
            debug!("Lease {} held by {:?}", LEASE_NAME, holder);
            return Ok(false);
        }

        info!("Lease held by {:?} has expired, taking over", holder);
        self.patch_spec(json!({
            "holderIdentity": self.identity,
            "acquireTime": MicroTime(now),
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": LEASE_DURATION_SECS,
        }))
        .await?;
        Ok(true)
    }

    /// Compete for the lease forever, publishing the result in `is_leader`
    pub async fn run(self, is_leader: Arc<AtomicBool>) {
        loop {
            let held = match self.try_acquire_or_renew().await {
                Ok(held) => held,
                Err(e) => {
                    warn!("Leader election error: {:?}", e);
                    false
                }
            };

            let was_leader = is_leader.swap(held, Ordering::Relaxed);
            match (was_leader, held) {
                (false, true) => info!("Acquired leadership for lease {}", LEASE_NAME),
                (true, false) => warn!("Lost leadership for lease {}", LEASE_NAME),
                _ => {}
            }

            tokio::time::sleep(if held { RENEW_INTERVAL } else { RETRY_INTERVAL }).await;
        }
    }
}

/// Identity this replica claims the lease with
pub fn holder_identity() -> Result<String> {
    if let Ok(name) = std::env::var("HOSTNAME") {
        return Ok(name);
    }
    hostname::get()
        .map_err(|e| Error::ConfigError(format!("cannot determine hostname: {e}")))?
        .into_string()
        .map_err(|_| Error::ConfigError("hostname is not valid UTF-8".to_string()))
}
