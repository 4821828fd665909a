//! ClusterVersion: the platform's cluster-wide version signal
//!
//! Only the fields the operator reads are modelled. The singleton object is
//! named [`CLUSTER_VERSION_NAME`] and is the trigger for every reconciliation.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name of the singleton ClusterVersion object
pub const CLUSTER_VERSION_NAME: &str = "version";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "ClusterVersion",
    status = "ClusterVersionStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVersionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVersionStatus {
    /// Release the cluster is converging to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<Release>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Release {
    #[serde(default)]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl ClusterVersion {
    /// Desired platform version, if the cluster has reported one
    pub fn desired_version(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.desired.as_ref())
            .map(|d| d.version.as_str())
            .filter(|v| !v.is_empty())
    }
}
