//! Tests for the reconciler module
//!
//! These tests drive full passes against an in-memory store:
//! - first pass creates the managed set
//! - repeated passes are write-free
//! - externally written fields and write-once objects survive
//! - the deploy flag gates the CSI stack

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    use super::super::operator_config::{
        DEPLOY_CSI_KEY, METRICS_LABELS_KEY, OPERATOR_CONFIG_MAP_NAME, STORAGE_CLUSTER_CRD_NAME,
    };
    use super::super::reconciler::*;
    use super::super::sync::Outcome;
    use crate::config::OperatorSettings;
    use crate::crd::{
        ClusterVersion, ClusterVersionSpec, ClusterVersionStatus, Release, Subscription,
        SubscriptionSpec, CLUSTER_VERSION_NAME, OPERATOR_PACKAGE,
    };
    use crate::error::Error;
    use crate::store::{to_dynamic, MemoryStore, ObjectKey, ObjectStore, ResourceKind};
    use crate::templates::console::{CONSOLE_PLUGIN_NAME, SERVICE_NAME};
    use crate::templates::csi::{ENCRYPTION_CONFIG_MAP_NAME, MON_CONFIG_MAP_NAME, SCC_NAME};
    use crate::templates::webhook::{
        CA_BUNDLE_POINTER, SUBSCRIPTION_LABEL_KEY, SUBSCRIPTION_LABEL_VALUE,
        SUBSCRIPTION_WEBHOOK_NAME,
    };

    const NS: &str = "storage";

    fn settings() -> OperatorSettings {
        OperatorSettings::new(NS)
    }

    fn cluster_version(version: &str) -> ClusterVersion {
        let mut cv = ClusterVersion::new(CLUSTER_VERSION_NAME, ClusterVersionSpec::default());
        cv.status = Some(ClusterVersionStatus {
            desired: Some(Release {
                version: version.to_string(),
                image: None,
            }),
        });
        cv
    }

    fn operator_subscription() -> Subscription {
        let mut sub = Subscription::new(
            OPERATOR_PACKAGE,
            SubscriptionSpec {
                package: OPERATOR_PACKAGE.to_string(),
                channel: Some("stable-4.16".to_string()),
                source: "redhat-operators".to_string(),
                source_namespace: "openshift-marketplace".to_string(),
            },
        );
        sub.metadata.namespace = Some(NS.to_string());
        sub
    }

    fn key(kind: ResourceKind, name: &str) -> ObjectKey {
        if kind.is_namespaced() {
            ObjectKey::namespaced(kind, NS, name)
        } else {
            ObjectKey::cluster(kind, name)
        }
    }

    /// Store holding everything the operator expects to find on a fresh cluster
    async fn cluster(version: &str) -> MemoryStore {
        let store = MemoryStore::new();
        let s = settings();
        store
            .seed(ResourceKind::ClusterVersion, &to_dynamic(&cluster_version(version)).unwrap())
            .await
            .unwrap();
        store
            .seed(ResourceKind::Subscription, &to_dynamic(&operator_subscription()).unwrap())
            .await
            .unwrap();
        for name in [&s.operator_deployment, &s.console_deployment] {
            store
                .seed(ResourceKind::Deployment, &key(ResourceKind::Deployment, name).shell())
                .await
                .unwrap();
        }
        store
    }

    async fn seed_operator_config(store: &MemoryStore, pairs: &[(&str, &str)]) {
        let mut cm = key(ResourceKind::ConfigMap, OPERATOR_CONFIG_MAP_NAME).shell();
        let data: serde_json::Map<String, serde_json::Value> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect();
        cm.data["data"] = serde_json::Value::Object(data);
        store.seed(ResourceKind::ConfigMap, &cm).await.unwrap();
    }

    #[tokio::test]
    async fn test_first_pass_creates_managed_set() {
        let store = cluster("4.16.2").await;
        let report = assert_ok!(reconcile_pass(&store, &settings()).await);

        assert!(report.csi_deployed);
        assert_eq!(report.outcomes.len(), 15);
        assert_eq!(report.writes(), 15);
        assert_eq!(
            report.outcome(&key(ResourceKind::Subscription, OPERATOR_PACKAGE)),
            Some(Outcome::Updated)
        );
        for (name, kind) in [
            ("csi-cephfsplugin-provisioner", ResourceKind::Deployment),
            ("csi-rbdplugin-provisioner", ResourceKind::Deployment),
            ("csi-cephfsplugin", ResourceKind::DaemonSet),
            ("csi-rbdplugin", ResourceKind::DaemonSet),
            ("storage.cephfs.csi.ceph.com", ResourceKind::CsiDriver),
            ("storage.rbd.csi.ceph.com", ResourceKind::CsiDriver),
            (SCC_NAME, ResourceKind::SecurityContextConstraints),
            (CONSOLE_PLUGIN_NAME, ResourceKind::ConsolePlugin),
        ] {
            assert_eq!(report.outcome(&key(kind, name)), Some(Outcome::Created), "{name}");
        }

        let sub = assert_ok!(store.get(&key(ResourceKind::Subscription, OPERATOR_PACKAGE)).await);
        let labels = sub.metadata.labels.unwrap();
        assert_eq!(
            labels.get(SUBSCRIPTION_LABEL_KEY).map(String::as_str),
            Some(SUBSCRIPTION_LABEL_VALUE)
        );
    }

    #[tokio::test]
    async fn test_second_pass_performs_no_writes() {
        let store = cluster("4.16.2").await;
        assert_ok!(reconcile_pass(&store, &settings()).await);
        let writes = store.writes().await;

        let report = assert_ok!(reconcile_pass(&store, &settings()).await);
        assert_eq!(report.writes(), 0);
        assert_eq!(store.writes().await, writes);
        assert!(report
            .outcomes
            .iter()
            .all(|(_, outcome)| *outcome == Outcome::Unchanged));
    }

    #[tokio::test]
    async fn test_server_defaults_do_not_cause_writes() {
        let store = cluster("4.16.2").await;
        assert_ok!(reconcile_pass(&store, &settings()).await);

        let service_key = key(ResourceKind::Service, SERVICE_NAME);
        let mut service = assert_ok!(store.get(&service_key).await);
        service.data["spec"]["type"] = json!("ClusterIP");
        service.data["spec"]["sessionAffinity"] = json!("None");
        service.data["spec"]["clusterIP"] = json!("172.30.0.10");
        service.data["spec"]["ports"][0]["protocol"] = json!("TCP");
        assert_ok!(store.update(ResourceKind::Service, &service).await);

        let deployment_key = key(ResourceKind::Deployment, "csi-rbdplugin-provisioner");
        let mut deployment = assert_ok!(store.get(&deployment_key).await);
        deployment.data["spec"]["revisionHistoryLimit"] = json!(10);
        deployment.data["spec"]["progressDeadlineSeconds"] = json!(600);
        deployment.data["spec"]["template"]["spec"]["containers"][0]["imagePullPolicy"] =
            json!("IfNotPresent");
        assert_ok!(store.update(ResourceKind::Deployment, &deployment).await);

        let report = assert_ok!(reconcile_pass(&store, &settings()).await);
        assert_eq!(report.outcome(&service_key), Some(Outcome::Unchanged));
        assert_eq!(report.outcome(&deployment_key), Some(Outcome::Unchanged));
        assert_eq!(report.writes(), 0);

        let deployment = assert_ok!(store.get(&deployment_key).await);
        assert_eq!(deployment.data["spec"]["revisionHistoryLimit"], json!(10));
        let service = assert_ok!(store.get(&service_key).await);
        assert_eq!(service.data["spec"]["clusterIP"], json!("172.30.0.10"));
    }

    #[tokio::test]
    async fn test_injected_ca_bundle_survives_webhook_refresh() {
        let store = cluster("4.16.2").await;
        assert_ok!(reconcile_pass(&store, &settings()).await);

        let webhook_key = key(
            ResourceKind::ValidatingWebhookConfiguration,
            SUBSCRIPTION_WEBHOOK_NAME,
        );
        let mut webhook = assert_ok!(store.get(&webhook_key).await);
        webhook.data["webhooks"][0]["clientConfig"]["caBundle"] = json!("LS0tLS1CRUdJTg==");
        webhook.data["webhooks"][0]["timeoutSeconds"] = json!(30);
        assert_ok!(
            store
                .update(ResourceKind::ValidatingWebhookConfiguration, &webhook)
                .await
        );

        let report = assert_ok!(reconcile_pass(&store, &settings()).await);
        assert_eq!(report.outcome(&webhook_key), Some(Outcome::Updated));

        let webhook = assert_ok!(store.get(&webhook_key).await);
        let as_json = serde_json::to_value(&webhook).unwrap();
        assert_eq!(as_json.pointer(CA_BUNDLE_POINTER), Some(&json!("LS0tLS1CRUdJTg==")));
        assert_eq!(webhook.data["webhooks"][0]["timeoutSeconds"], json!(10));

        let report = assert_ok!(reconcile_pass(&store, &settings()).await);
        assert_eq!(report.outcome(&webhook_key), Some(Outcome::Unchanged));
    }

    #[tokio::test]
    async fn test_write_once_config_maps_keep_external_edits() {
        let store = cluster("4.16.2").await;
        assert_ok!(reconcile_pass(&store, &settings()).await);

        let edited = r#"[{"clusterID":"abc","monitors":["10.0.0.1:6789"]}]"#;
        for name in [MON_CONFIG_MAP_NAME, ENCRYPTION_CONFIG_MAP_NAME] {
            let mut cm = assert_ok!(store.get(&key(ResourceKind::ConfigMap, name)).await);
            assert_eq!(cm.data["data"]["config.json"], json!("[]"));
            cm.data["data"]["config.json"] = json!(edited);
            assert_ok!(store.update(ResourceKind::ConfigMap, &cm).await);
        }

        let report = assert_ok!(reconcile_pass(&store, &settings()).await);
        for name in [MON_CONFIG_MAP_NAME, ENCRYPTION_CONFIG_MAP_NAME] {
            let cm_key = key(ResourceKind::ConfigMap, name);
            assert_eq!(report.outcome(&cm_key), Some(Outcome::Unchanged));
            let cm = assert_ok!(store.get(&cm_key).await);
            assert_eq!(cm.data["data"]["config.json"], json!(edited));
        }
    }

    #[tokio::test]
    async fn test_disabled_flag_stops_before_csi() {
        let store = cluster("4.16.2").await;
        seed_operator_config(&store, &[(DEPLOY_CSI_KEY, "false")]).await;

        let report = assert_ok!(reconcile_pass(&store, &settings()).await);
        assert!(!report.csi_deployed);
        assert_eq!(report.outcomes.len(), 5);
        assert!(!store.contains(&key(ResourceKind::SecurityContextConstraints, SCC_NAME)).await);
        assert!(store.contains(&key(ResourceKind::ConsolePlugin, CONSOLE_PLUGIN_NAME)).await);
    }

    #[tokio::test]
    async fn test_storage_cluster_crd_disables_csi_by_default() {
        let store = cluster("4.16.2").await;
        let crd = key(ResourceKind::CustomResourceDefinition, STORAGE_CLUSTER_CRD_NAME).shell();
        assert_ok!(store.seed(ResourceKind::CustomResourceDefinition, &crd).await);

        let report = assert_ok!(reconcile_pass(&store, &settings()).await);
        assert!(!report.csi_deployed);
    }

    #[tokio::test]
    async fn test_disabling_leaves_existing_csi_resources() {
        let store = cluster("4.16.2").await;
        assert_ok!(reconcile_pass(&store, &settings()).await);
        seed_operator_config(&store, &[(DEPLOY_CSI_KEY, "0")]).await;

        let report = assert_ok!(reconcile_pass(&store, &settings()).await);
        assert!(!report.csi_deployed);
        assert!(store.contains(&key(ResourceKind::DaemonSet, "csi-rbdplugin")).await);
    }

    #[tokio::test]
    async fn test_malformed_flag_fails_the_pass() {
        let store = cluster("4.16.2").await;
        seed_operator_config(&store, &[(DEPLOY_CSI_KEY, "enabled")]).await;

        let err = assert_err!(reconcile_pass(&store, &settings()).await);
        assert!(matches!(err, Error::ConfigParseError { .. }));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_metric_labels_replace_rule_labels() {
        let store = cluster("4.16.2").await;
        seed_operator_config(
            &store,
            &[(METRICS_LABELS_KEY, "team: storage\nenv:  prod\n\n")],
        )
        .await;
        assert_ok!(reconcile_pass(&store, &settings()).await);

        let rule_key = key(ResourceKind::PrometheusRule, "ocs-client-operator-pvc-rules");
        let mut rule = assert_ok!(store.get(&rule_key).await);
        let labels = rule.metadata.labels.clone().unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get("env").map(String::as_str), Some("prod"));

        rule.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("stray".to_string(), "x".to_string());
        assert_ok!(store.update(ResourceKind::PrometheusRule, &rule).await);

        let report = assert_ok!(reconcile_pass(&store, &settings()).await);
        assert_eq!(report.outcome(&rule_key), Some(Outcome::Updated));
        let rule = assert_ok!(store.get(&rule_key).await);
        assert!(!rule.metadata.labels.unwrap().contains_key("stray"));
    }

    #[tokio::test]
    async fn test_missing_subscription_fails_the_pass() {
        let store = MemoryStore::new();
        store
            .seed(ResourceKind::ClusterVersion, &to_dynamic(&cluster_version("4.16.2")).unwrap())
            .await
            .unwrap();

        let err = assert_err!(reconcile_pass(&store, &settings()).await);
        assert!(matches!(err, Error::NotFound(ref k) if k.kind == ResourceKind::Subscription));
    }

    #[tokio::test]
    async fn test_missing_console_deployment_fails_the_pass() {
        let store = cluster("4.16.2").await;
        let console = key(ResourceKind::Deployment, &settings().console_deployment);
        assert_ok!(store.delete(&console).await);

        let err = assert_err!(reconcile_pass(&store, &settings()).await);
        assert!(matches!(err, Error::NotFound(ref k) if *k == console));
    }

    #[tokio::test]
    async fn test_unsupported_platform_version() {
        let store = cluster("4.9.0").await;

        let err = assert_err!(reconcile_pass(&store, &settings()).await);
        assert!(matches!(err, Error::UnsupportedVersion(_)));
        assert!(!store.contains(&key(ResourceKind::SecurityContextConstraints, SCC_NAME)).await);
    }

    #[tokio::test]
    async fn test_console_resources_owned_by_console_deployment() {
        let store = cluster("4.16.2").await;
        assert_ok!(reconcile_pass(&store, &settings()).await);

        let console = key(ResourceKind::Deployment, &settings().console_deployment);
        let removed = assert_ok!(store.delete(&console).await);
        assert_eq!(removed.len(), 3);
        assert!(store.contains(&key(ResourceKind::ConsolePlugin, CONSOLE_PLUGIN_NAME)).await);
    }
}
