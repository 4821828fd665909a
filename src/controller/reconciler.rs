//! Main reconciler for the ClusterVersion trigger
//!
//! Implements the controller pattern using kube-rs runtime. Each pass runs
//! the full sequence fresh: webhook, subscription label, console plugin,
//! deploy flag and, when enabled, the CSI driver stack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{future, StreamExt, TryStreamExt};
use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, DynamicObject, ListParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        metadata_watcher, predicates, reflector, watcher, WatchStreamExt,
    },
    ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use crate::config::OperatorSettings;
use crate::crd::{ClusterVersion, Subscription, CLUSTER_VERSION_NAME, OPERATOR_PACKAGE};
use crate::error::{Error, Result};
use crate::store::{from_dynamic, to_dynamic, KubeStore, ObjectKey, ObjectStore, ResourceKind};
use crate::templates::webhook::{
    self, SUBSCRIPTION_LABEL_KEY, SUBSCRIPTION_LABEL_VALUE, SUBSCRIPTION_WEBHOOK_NAME,
};
use crate::templates::{console, csi, monitoring, CsiParams, Protocol, SidecarImages};

use super::events::{EventRouter, WatchedInput};
use super::merge::{overlay, replace_with, StickyFields};
use super::operator_config::{resolve_deploy_flag, OperatorConfig, OPERATOR_CONFIG_MAP_NAME};
use super::ownership::attach_owner;
use super::sync::{create_if_absent, create_or_update, Outcome};

const WEBHOOK_STICKY: StickyFields = StickyFields::new(&[webhook::CA_BUNDLE_POINTER]);

/// Server-assigned metadata kept when an object is overwritten wholesale
const SINGLETON_STICKY: StickyFields = StickyFields::new(&[
    "/metadata/resourceVersion",
    "/metadata/uid",
    "/metadata/creationTimestamp",
    "/metadata/generation",
    "/metadata/managedFields",
]);

/// Requeue delay for replicas that do not hold the leader lease
const NOT_LEADER_REQUEUE: Duration = Duration::from_secs(5);

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub settings: OperatorSettings,
    pub is_leader: Arc<AtomicBool>,
}

/// What one reconciliation pass did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Every managed object the pass visited, in order
    pub outcomes: Vec<(ObjectKey, Outcome)>,
    /// Whether the CSI driver stack was ensured in this pass
    pub csi_deployed: bool,
}

impl ReconcileReport {
    /// Number of create and update calls issued
    pub fn writes(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_write()).count()
    }

    pub fn outcome(&self, key: &ObjectKey) -> Option<Outcome> {
        self.outcomes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, o)| *o)
    }
}

/// Values shared by the steps of a single pass and dropped afterwards
struct PassContext<'a, S: ObjectStore + ?Sized> {
    store: &'a S,
    settings: &'a OperatorSettings,
    report: ReconcileReport,
}

impl<'a, S: ObjectStore + ?Sized> PassContext<'a, S> {
    fn namespaced(&self, kind: ResourceKind, name: &str) -> ObjectKey {
        ObjectKey::namespaced(kind, &self.settings.namespace, name)
    }

    async fn sync<F>(&mut self, key: ObjectKey, sticky: StickyFields, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut DynamicObject) -> Result<()>,
    {
        let outcome = create_or_update(self.store, &key, |obj| sticky.apply(obj, mutate)).await?;
        self.report.outcomes.push((key, outcome));
        Ok(())
    }

    async fn create_once(&mut self, key: ObjectKey, desired: &DynamicObject) -> Result<()> {
        let outcome = create_if_absent(self.store, &key, desired).await?;
        self.report.outcomes.push((key, outcome));
        Ok(())
    }

    // ========================================================================
    // Step 1: subscription webhook
    // ========================================================================

    async fn ensure_subscription_webhook(&mut self) -> Result<()> {
        let key = ObjectKey::cluster(
            ResourceKind::ValidatingWebhookConfiguration,
            SUBSCRIPTION_WEBHOOK_NAME,
        );
        let desired = to_dynamic(&webhook::subscription_webhook(&self.settings.namespace))?;
        self.sync(key, WEBHOOK_STICKY, |obj| {
            overlay(obj, desired);
            Ok(())
        })
        .await?;
        info!("Registered validating webhook {}", SUBSCRIPTION_WEBHOOK_NAME);
        Ok(())
    }

    // ========================================================================
    // Step 2: label the operator's own Subscription
    // ========================================================================

    async fn label_operator_subscription(&mut self) -> Result<()> {
        let namespace = self.settings.namespace.as_str();
        let mut subscription = self
            .store
            .list(ResourceKind::Subscription, Some(namespace))
            .await?
            .into_iter()
            .find(|s| {
                s.data.pointer("/spec/name").and_then(|v| v.as_str()) == Some(OPERATOR_PACKAGE)
            })
            .ok_or_else(|| {
                Error::NotFound(self.namespaced(ResourceKind::Subscription, OPERATOR_PACKAGE))
            })?;
        let key = ObjectKey::of(ResourceKind::Subscription, &subscription);

        let labels = subscription.labels_mut();
        let outcome = if labels.get(SUBSCRIPTION_LABEL_KEY).map(String::as_str)
            == Some(SUBSCRIPTION_LABEL_VALUE)
        {
            debug!("{} already labelled", key);
            Outcome::Unchanged
        } else {
            labels.insert(
                SUBSCRIPTION_LABEL_KEY.to_string(),
                SUBSCRIPTION_LABEL_VALUE.to_string(),
            );
            self.store
                .update(ResourceKind::Subscription, &subscription)
                .await?;
            info!("Labelled {} for webhook targeting", key);
            Outcome::Updated
        };
        self.report.outcomes.push((key, outcome));
        Ok(())
    }

    // ========================================================================
    // Step 3: console plugin
    // ========================================================================

    async fn ensure_console_plugin(&mut self) -> Result<()> {
        let settings = self.settings;
        let namespace = settings.namespace.as_str();
        let port = settings.console_port;

        let console_deployment = self
            .store
            .get(&self.namespaced(ResourceKind::Deployment, &settings.console_deployment))
            .await?;

        let nginx = to_dynamic(&console::nginx_config_map(namespace, port))?;
        let key = self.namespaced(ResourceKind::ConfigMap, console::NGINX_CONFIG_MAP_NAME);
        self.sync(key, StickyFields::NONE, |obj| {
            overlay(obj, nginx);
            attach_owner(&console_deployment, obj)
        })
        .await?;

        let service = to_dynamic(&console::console_service(
            namespace,
            &settings.console_deployment,
            port,
        ))?;
        let key = self.namespaced(ResourceKind::Service, console::SERVICE_NAME);
        self.sync(key, StickyFields::NONE, |obj| {
            overlay(obj, service);
            attach_owner(&console_deployment, obj)
        })
        .await?;

        let plugin = console::console_plugin(namespace, port);
        let key = ObjectKey::cluster(ResourceKind::ConsolePlugin, console::CONSOLE_PLUGIN_NAME);
        self.sync(key, SINGLETON_STICKY, |obj| {
            replace_with(obj, plugin);
            Ok(())
        })
        .await
    }

    // ========================================================================
    // Step 5: CSI driver stack
    // ========================================================================

    async fn ensure_csi(&mut self, config: &OperatorConfig) -> Result<()> {
        let settings = self.settings;
        let namespace = settings.namespace.as_str();

        let version_key = ObjectKey::cluster(ResourceKind::ClusterVersion, CLUSTER_VERSION_NAME);
        let cluster_version: ClusterVersion = from_dynamic(&self.store.get(&version_key).await?)?;
        let version = cluster_version.desired_version().unwrap_or_default();
        let sidecars = SidecarImages::for_platform_version(version)?;
        debug!("Using CSI sidecars for platform version {}", version);

        let owner = self
            .store
            .get(&self.namespaced(ResourceKind::Deployment, &settings.operator_deployment))
            .await?;

        let scc = csi::security_context_constraints(namespace);
        let key = ObjectKey::cluster(ResourceKind::SecurityContextConstraints, csi::SCC_NAME);
        self.sync(key, SINGLETON_STICKY, |obj| {
            replace_with(obj, scc);
            Ok(())
        })
        .await?;

        for name in [csi::MON_CONFIG_MAP_NAME, csi::ENCRYPTION_CONFIG_MAP_NAME] {
            let mut desired = to_dynamic(&csi::write_once_config_map(name, namespace))?;
            attach_owner(&owner, &mut desired)?;
            let key = self.namespaced(ResourceKind::ConfigMap, name);
            self.create_once(key, &desired).await?;
        }

        let params = CsiParams {
            namespace,
            driver_image: &settings.csi_driver_image,
            sidecars: &sidecars,
        };
        for protocol in Protocol::ALL {
            let deployment = to_dynamic(&csi::provisioner_deployment(protocol, params))?;
            let key = self.namespaced(ResourceKind::Deployment, &protocol.provisioner_name());
            self.sync(key, StickyFields::NONE, |obj| {
                overlay(obj, deployment);
                attach_owner(&owner, obj)
            })
            .await?;

            let daemonset = to_dynamic(&csi::node_plugin_daemonset(protocol, params))?;
            let key = self.namespaced(ResourceKind::DaemonSet, &protocol.node_plugin_name());
            self.sync(key, StickyFields::NONE, |obj| {
                overlay(obj, daemonset);
                attach_owner(&owner, obj)
            })
            .await?;
        }

        // Cluster-scoped, so no owner reference; nothing removes these on uninstall.
        for protocol in Protocol::ALL {
            let driver = to_dynamic(&csi::csi_driver(protocol, namespace))?;
            let key = ObjectKey::cluster(ResourceKind::CsiDriver, &protocol.driver_name(namespace));
            self.create_once(key, &driver).await?;
        }

        let rule = monitoring::pvc_prometheus_rule(namespace)?;
        let key = ObjectKey::of(ResourceKind::PrometheusRule, &rule);
        let labels = config.metric_labels();
        self.sync(key, StickyFields::NONE, |obj| {
            overlay(obj, rule);
            obj.metadata.labels = (!labels.is_empty()).then_some(labels);
            attach_owner(&owner, obj)
        })
        .await?;
        info!("Prometheus rules deployed in {}", namespace);
        Ok(())
    }
}

/// Run one full reconciliation pass against `store`.
///
/// The first failing step aborts the pass; nothing is rolled back since
/// every step converges when re-run.
#[instrument(skip(store, settings), fields(namespace = %settings.namespace))]
pub async fn reconcile_pass<S>(store: &S, settings: &OperatorSettings) -> Result<ReconcileReport>
where
    S: ObjectStore + ?Sized,
{
    let mut pass = PassContext {
        store,
        settings,
        report: ReconcileReport::default(),
    };

    pass.ensure_subscription_webhook().await?;
    pass.label_operator_subscription().await?;
    pass.ensure_console_plugin().await?;

    let config = OperatorConfig::load(store, &settings.namespace).await?;
    if !resolve_deploy_flag(&config, store).await? {
        info!("CSI deployment disabled, leaving driver resources as they are");
        return Ok(pass.report);
    }

    pass.ensure_csi(&config).await?;
    pass.report.csi_deployed = true;
    Ok(pass.report)
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let namespace = state.settings.namespace.clone();
    let router = EventRouter::new(&namespace);
    let versions: Api<ClusterVersion> = Api::all(client.clone());

    info!("Starting ClusterVersion controller in namespace {}", namespace);

    // Verify the trigger type is served
    if let Err(e) = versions.list(&ListParams::default().limit(1)).await {
        error!("ClusterVersion is not queryable; is this an OpenShift cluster? {:?}", e);
        return Err(Error::ConfigError(
            "ClusterVersion API not available".to_string(),
        ));
    }

    let (reader, writer) = reflector::store();
    let trigger = reflector(writer, watcher(versions, watcher::Config::default()))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::generation)
        .try_filter({
            let router = router.clone();
            move |cv| {
                let relevant = router.route(WatchedInput::ClusterVersion, &cv.metadata);
                future::ready(relevant.is_some())
            }
        });

    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);
    let config_changes = metadata_watcher(
        config_maps,
        watcher::Config::default().fields(&format!("metadata.name={OPERATOR_CONFIG_MAP_NAME}")),
    )
    .default_backoff()
    .touched_objects();

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crd_changes = metadata_watcher(crds, watcher::Config::default())
        .default_backoff()
        .touched_objects();

    let subscriptions: Api<Subscription> = Api::namespaced(client.clone(), &namespace);
    let subscription_changes = metadata_watcher(subscriptions, watcher::Config::default())
        .default_backoff()
        .touched_objects()
        .predicate_filter(predicates::labels);

    let webhooks: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    let webhook_changes = metadata_watcher(
        webhooks,
        watcher::Config::default().fields(&format!("metadata.name={SUBSCRIPTION_WEBHOOK_NAME}")),
    )
    .default_backoff()
    .touched_objects();

    let (r1, r2, r3, r4) = (router.clone(), router.clone(), router.clone(), router);
    Controller::for_stream(trigger, reader)
        .watches_stream(config_changes, move |meta| {
            r1.route(WatchedInput::OperatorConfig, &meta.metadata)
        })
        .watches_stream(crd_changes, move |meta| {
            r2.route(WatchedInput::CustomResourceDefinition, &meta.metadata)
        })
        .watches_stream(subscription_changes, move |meta| {
            r3.route(WatchedInput::Subscription, &meta.metadata)
        })
        .watches_stream(webhook_changes, move |meta| {
            r4.route(WatchedInput::WebhookConfiguration, &meta.metadata)
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// The main reconciliation function
///
/// Called for the ClusterVersion singleton whenever any watched input
/// changes; see [`EventRouter`].
#[instrument(skip(obj, ctx), fields(name = %obj.name_any()))]
async fn reconcile(obj: Arc<ClusterVersion>, ctx: Arc<ControllerState>) -> Result<Action> {
    if !ctx.is_leader.load(Ordering::Relaxed) {
        debug!("Not the leader, skipping reconciliation");
        return Ok(Action::requeue(NOT_LEADER_REQUEUE));
    }

    info!("Reconciling ClusterVersion {}", obj.name_any());
    let store = KubeStore::new(ctx.client.clone());
    let report = reconcile_pass(&store, &ctx.settings).await?;
    info!(
        "Reconciliation complete: {} objects checked, {} written, CSI deployed: {}",
        report.outcomes.len(),
        report.writes(),
        report.csi_deployed
    );
    Ok(Action::await_change())
}

/// Error policy for the controller
fn error_policy(obj: Arc<ClusterVersion>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {:?}", obj.name_any(), error);

    // Use shorter retry for retriable errors
    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        warn!("Non-retriable error, backing off: {}", error);
        Duration::from_secs(60)
    };

    Action::requeue(retry_duration)
}
