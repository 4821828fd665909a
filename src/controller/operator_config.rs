//! Operator configuration map and the CSI deployment flag
//!
//! The configuration map is optional. When it does not exist the operator
//! behaves as if it were empty.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{ObjectKey, ObjectStore, ResourceKind};

/// Name of the operator configuration map in the operator namespace
pub const OPERATOR_CONFIG_MAP_NAME: &str = "ocs-client-operator-config";

/// Boolean flag controlling deployment of the CSI driver stack
pub const DEPLOY_CSI_KEY: &str = "DEPLOY_CSI";

/// Newline separated `key:value` labels applied to the monitoring rule
pub const METRICS_LABELS_KEY: &str = "OCS_METRICS_LABELS";

/// CRD whose presence means another component owns the CSI decision
pub const STORAGE_CLUSTER_CRD_NAME: &str = "storageclusters.ocs.openshift.io";

/// Contents of the operator configuration map
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperatorConfig {
    data: BTreeMap<String, String>,
}

impl OperatorConfig {
    pub fn new(data: BTreeMap<String, String>) -> Self {
        Self { data }
    }

    /// Read the configuration map, treating absence as an empty map
    pub async fn load<S>(store: &S, namespace: &str) -> Result<Self>
    where
        S: ObjectStore + ?Sized,
    {
        let key =
            ObjectKey::namespaced(ResourceKind::ConfigMap, namespace, OPERATOR_CONFIG_MAP_NAME);
        match store.get(&key).await {
            Ok(cm) => {
                let data = match cm.data.get("data") {
                    Some(data) if !data.is_null() => serde_json::from_value(data.clone())?,
                    _ => BTreeMap::new(),
                };
                Ok(Self { data })
            }
            Err(e) if e.is_not_found() => {
                debug!("{} not found, using empty configuration", key);
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// Labels for the monitoring rule, parsed from [`METRICS_LABELS_KEY`]
    pub fn metric_labels(&self) -> BTreeMap<String, String> {
        self.get(METRICS_LABELS_KEY)
            .map(parse_labels)
            .unwrap_or_default()
    }
}

/// Capability to check whether a CustomResourceDefinition is registered
#[async_trait]
pub trait CrdProbe: Send + Sync {
    async fn crd_exists(&self, name: &str) -> Result<bool>;
}

#[async_trait]
impl<S: ObjectStore + ?Sized> CrdProbe for S {
    async fn crd_exists(&self, name: &str) -> Result<bool> {
        let key = ObjectKey::cluster(ResourceKind::CustomResourceDefinition, name);
        match self.get(&key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Decide whether the operator should deploy the CSI driver stack.
///
/// An explicit [`DEPLOY_CSI_KEY`] wins and must be a boolean. Without it the
/// operator deploys CSI only when the storage cluster CRD is absent, i.e.
/// nothing else on the cluster is positioned to own that decision.
pub async fn resolve_deploy_flag<P>(config: &OperatorConfig, probe: &P) -> Result<bool>
where
    P: CrdProbe + ?Sized,
{
    if let Some(value) = config.get(DEPLOY_CSI_KEY) {
        return parse_bool(value).ok_or_else(|| Error::ConfigParseError {
            key: DEPLOY_CSI_KEY.to_string(),
            value: value.to_string(),
        });
    }

    let crd_present = probe.crd_exists(STORAGE_CLUSTER_CRD_NAME).await?;
    debug!(
        "{} not set, {} present: {}",
        DEPLOY_CSI_KEY, STORAGE_CLUSTER_CRD_NAME, crd_present
    );
    Ok(!crd_present)
}

/// Boolean spellings accepted in the configuration map
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Parse newline separated `key:value` pairs.
///
/// Keys and values are trimmed; the first colon splits, so values may
/// contain colons. Blank lines are ignored. Lines without a colon or with an
/// empty key cannot form a label and are skipped with a warning.
pub fn parse_labels(text: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match line.split_once(':') {
            Some((key, value)) if !key.trim().is_empty() => {
                labels.insert(key.trim().to_string(), value.trim().to_string());
            }
            _ => warn!("Ignoring malformed label line {:?} in {}", line, METRICS_LABELS_KEY),
        }
    }
    labels
}
