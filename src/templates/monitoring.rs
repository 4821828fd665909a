//! PrometheusRule with PVC usage alerts for CSI-provisioned volumes

use kube::api::DynamicObject;

use crate::error::Result;

const PVC_RULES: &str = include_str!("pvc-rules.yaml");

/// Decode the embedded rule document and place it in `namespace`
pub fn pvc_prometheus_rule(namespace: &str) -> Result<DynamicObject> {
    let mut rule: DynamicObject = serde_yaml::from_str(PVC_RULES)?;
    rule.metadata.namespace = Some(namespace.to_string());
    Ok(rule)
}
