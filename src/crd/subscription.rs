//! OLM Subscription, read and labelled but never created by the operator

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Package name of the subscription that installed this operator
pub const OPERATOR_PACKAGE: &str = "ocs-client-operator";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operators.coreos.com",
    version = "v1alpha1",
    kind = "Subscription",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSpec {
    /// Package the subscription installs (serialized as `name`)
    #[serde(default, rename = "name")]
    pub package: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    #[serde(default)]
    pub source: String,

    #[serde(default)]
    pub source_namespace: String,
}
