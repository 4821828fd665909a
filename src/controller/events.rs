//! Routing of watched-input changes to the single reconciliation key
//!
//! Every managed object is a function of inputs gated behind the
//! ClusterVersion singleton, so each relevant change re-enters
//! reconciliation through that one identity.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::reflector::ObjectRef;

use crate::crd::{ClusterVersion, CLUSTER_VERSION_NAME};
use crate::templates::webhook::SUBSCRIPTION_WEBHOOK_NAME;

use super::operator_config::OPERATOR_CONFIG_MAP_NAME;

/// Watched input an event was observed on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchedInput {
    ClusterVersion,
    OperatorConfig,
    CustomResourceDefinition,
    Subscription,
    WebhookConfiguration,
}

/// Identity every reconciliation is requested for
pub fn trigger_ref() -> ObjectRef<ClusterVersion> {
    ObjectRef::new(CLUSTER_VERSION_NAME)
}

/// Maps change notifications to zero or one reconciliation request
#[derive(Clone, Debug)]
pub struct EventRouter {
    namespace: String,
}

impl EventRouter {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Request for a change to `meta` observed on `input`, if it is relevant.
    ///
    /// Generation and label filtering happen on the watch streams; this only
    /// decides whether the object is one the operator cares about.
    pub fn route(
        &self,
        input: WatchedInput,
        meta: &ObjectMeta,
    ) -> Option<ObjectRef<ClusterVersion>> {
        let name = meta.name.as_deref();
        let in_operator_namespace = meta.namespace.as_deref() == Some(self.namespace.as_str());

        let relevant = match input {
            WatchedInput::ClusterVersion => name == Some(CLUSTER_VERSION_NAME),
            WatchedInput::OperatorConfig => {
                in_operator_namespace && name == Some(OPERATOR_CONFIG_MAP_NAME)
            }
            WatchedInput::CustomResourceDefinition => true,
            WatchedInput::Subscription => in_operator_namespace,
            WatchedInput::WebhookConfiguration => name == Some(SUBSCRIPTION_WEBHOOK_NAME),
        };
        relevant.then(trigger_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(namespace: Option<&str>, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(str::to_string),
            ..Default::default()
        }
    }

    fn router() -> EventRouter {
        EventRouter::new("storage")
    }

    #[test]
    fn test_trigger_routes_to_itself() {
        let request = router().route(WatchedInput::ClusterVersion, &meta(None, "version"));
        assert_eq!(request, Some(trigger_ref()));
        assert_eq!(router().route(WatchedInput::ClusterVersion, &meta(None, "other")), None);
    }

    #[test]
    fn test_operator_config_filtered_by_name_and_namespace() {
        let r = router();
        assert_eq!(
            r.route(
                WatchedInput::OperatorConfig,
                &meta(Some("storage"), OPERATOR_CONFIG_MAP_NAME)
            ),
            Some(trigger_ref())
        );
        assert_eq!(
            r.route(
                WatchedInput::OperatorConfig,
                &meta(Some("elsewhere"), OPERATOR_CONFIG_MAP_NAME)
            ),
            None
        );
        assert_eq!(
            r.route(WatchedInput::OperatorConfig, &meta(Some("storage"), "unrelated")),
            None
        );
    }

    #[test]
    fn test_any_crd_change_routes_to_trigger() {
        let request = router().route(
            WatchedInput::CustomResourceDefinition,
            &meta(None, "storageclusters.ocs.openshift.io"),
        );
        assert_eq!(request, Some(trigger_ref()));
    }

    #[test]
    fn test_subscription_filtered_by_namespace() {
        let r = router();
        assert!(r
            .route(WatchedInput::Subscription, &meta(Some("storage"), "any"))
            .is_some());
        assert!(r
            .route(WatchedInput::Subscription, &meta(Some("openshift-operators"), "any"))
            .is_none());
    }

    #[test]
    fn test_webhook_filtered_by_name() {
        let r = router();
        assert!(r
            .route(WatchedInput::WebhookConfiguration, &meta(None, SUBSCRIPTION_WEBHOOK_NAME))
            .is_some());
        assert!(r
            .route(WatchedInput::WebhookConfiguration, &meta(None, "another.webhook"))
            .is_none());
    }
}
