//! Validating webhook guarding the operator's own Subscription

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{
    RuleWithOperations, ServiceReference, ValidatingWebhook, ValidatingWebhookConfiguration,
    WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

pub const SUBSCRIPTION_WEBHOOK_NAME: &str = "subscription.ocs.openshift.io";

/// Label marking the Subscription the webhook intercepts
pub const SUBSCRIPTION_LABEL_KEY: &str = "managed-by";
pub const SUBSCRIPTION_LABEL_VALUE: &str = "webhook.subscription.ocs.openshift.io";

pub const WEBHOOK_SERVICE_NAME: &str = "ocs-client-operator-webhook-server";

/// Injected by the OpenShift service CA operator; never written by us
pub const CA_BUNDLE_POINTER: &str = "/webhooks/0/clientConfig/caBundle";

const INJECT_CA_BUNDLE_ANNOTATION: &str = "service.beta.openshift.io/inject-cabundle";

fn match_labels(key: &str, value: &str) -> Option<LabelSelector> {
    Some(LabelSelector {
        match_labels: Some(BTreeMap::from([(key.to_string(), value.to_string())])),
        ..Default::default()
    })
}

/// Desired webhook registration for an operator namespace.
///
/// The CA bundle is left empty; the service CA operator fills it in.
pub fn subscription_webhook(namespace: &str) -> ValidatingWebhookConfiguration {
    let webhook = ValidatingWebhook {
        name: SUBSCRIPTION_WEBHOOK_NAME.to_string(),
        client_config: WebhookClientConfig {
            service: Some(ServiceReference {
                name: WEBHOOK_SERVICE_NAME.to_string(),
                namespace: namespace.to_string(),
                path: Some("/validate-subscription".to_string()),
                port: Some(443),
            }),
            ..Default::default()
        },
        rules: Some(vec![RuleWithOperations {
            api_groups: Some(vec!["operators.coreos.com".to_string()]),
            api_versions: Some(vec!["v1alpha1".to_string()]),
            operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
            resources: Some(vec!["subscriptions".to_string()]),
            scope: Some("Namespaced".to_string()),
        }]),
        namespace_selector: match_labels("kubernetes.io/metadata.name", namespace),
        object_selector: match_labels(SUBSCRIPTION_LABEL_KEY, SUBSCRIPTION_LABEL_VALUE),
        admission_review_versions: vec!["v1".to_string()],
        side_effects: "None".to_string(),
        failure_policy: Some("Fail".to_string()),
        match_policy: Some("Equivalent".to_string()),
        timeout_seconds: Some(10),
        ..Default::default()
    };

    ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(SUBSCRIPTION_WEBHOOK_NAME.to_string()),
            annotations: Some(BTreeMap::from([(
                INJECT_CA_BUNDLE_ANNOTATION.to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        },
        webhooks: Some(vec![webhook]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_targets_operator_namespace() {
        let config = subscription_webhook("storage");
        let webhooks = config.webhooks.unwrap();
        assert_eq!(webhooks.len(), 1);

        let wh = &webhooks[0];
        assert_eq!(wh.name, SUBSCRIPTION_WEBHOOK_NAME);
        assert_eq!(wh.client_config.service.as_ref().unwrap().namespace, "storage");
        assert!(wh.client_config.ca_bundle.is_none());

        let ns = wh.namespace_selector.clone().unwrap().match_labels.unwrap();
        assert_eq!(ns.get("kubernetes.io/metadata.name").map(String::as_str), Some("storage"));
        let objects = wh.object_selector.clone().unwrap().match_labels.unwrap();
        assert_eq!(
            objects.get(SUBSCRIPTION_LABEL_KEY).map(String::as_str),
            Some(SUBSCRIPTION_LABEL_VALUE)
        );
    }

    #[test]
    fn test_ca_injection_is_requested() {
        let annotations = subscription_webhook("storage").metadata.annotations.unwrap();
        assert_eq!(
            annotations.get(INJECT_CA_BUNDLE_ANNOTATION).map(String::as_str),
            Some("true")
        );
    }
}
