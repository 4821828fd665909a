//! Desired state of the Ceph CSI driver stack

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, Deployment, DeploymentSpec,
    RollingUpdateDaemonSet,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    HostPathVolumeSource, ObjectFieldSelector, PodSpec, PodTemplateSpec, SecurityContext,
    Volume, VolumeMount,
};
use k8s_openapi::api::storage::v1::{CSIDriver, CSIDriverSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::DynamicObject;
use serde_json::json;

use crate::error::{Error, Result};
use crate::store::{ObjectKey, ResourceKind};

pub const SCC_NAME: &str = "ocs-client-operator-csi-scc";

/// Monitor endpoints, appended to by storage class claims after creation
pub const MON_CONFIG_MAP_NAME: &str = "ceph-csi-configs";

/// Encryption (KMS) settings, edited by users before creating encrypted claims
pub const ENCRYPTION_CONFIG_MAP_NAME: &str = "ceph-csi-kms-config";

const KUBELET_DIR: &str = "/var/lib/kubelet";
const CONTROLLER_SOCKET: &str = "unix:///csi/csi-provisioner.sock";
const NODE_SOCKET: &str = "unix:///csi/csi.sock";

/// Storage protocols served by the CSI stack
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    CephFs,
    Rbd,
}

impl Protocol {
    pub const ALL: [Protocol; 2] = [Protocol::CephFs, Protocol::Rbd];

    fn short(&self) -> &'static str {
        match self {
            Protocol::CephFs => "cephfs",
            Protocol::Rbd => "rbd",
        }
    }

    /// Name of the registered CSI driver for an operator namespace
    pub fn driver_name(&self, namespace: &str) -> String {
        format!("{}.{}.csi.ceph.com", namespace, self.short())
    }

    pub fn provisioner_name(&self) -> String {
        format!("csi-{}plugin-provisioner", self.short())
    }

    pub fn node_plugin_name(&self) -> String {
        format!("csi-{}plugin", self.short())
    }

    fn provisioner_service_account(&self) -> String {
        format!("csi-{}-provisioner-sa", self.short())
    }

    fn node_plugin_service_account(&self) -> String {
        format!("csi-{}-plugin-sa", self.short())
    }
}

/// Container images of the CSI sidecars for one platform release
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SidecarImages {
    pub provisioner: String,
    pub attacher: String,
    pub resizer: String,
    pub snapshotter: String,
    pub registrar: String,
}

struct SidecarRelease {
    platform: (u32, u32),
    provisioner: &'static str,
    attacher: &'static str,
    resizer: &'static str,
    snapshotter: &'static str,
    registrar: &'static str,
}

const SIG_STORAGE: &str = "registry.k8s.io/sig-storage";

// Ordered oldest to newest.
const SIDECAR_RELEASES: &[SidecarRelease] = &[
    SidecarRelease {
        platform: (4, 12),
        provisioner: "csi-provisioner:v3.3.0",
        attacher: "csi-attacher:v4.0.0",
        resizer: "csi-resizer:v1.6.0",
        snapshotter: "csi-snapshotter:v6.1.0",
        registrar: "csi-node-driver-registrar:v2.6.2",
    },
    SidecarRelease {
        platform: (4, 13),
        provisioner: "csi-provisioner:v3.4.0",
        attacher: "csi-attacher:v4.2.0",
        resizer: "csi-resizer:v1.7.0",
        snapshotter: "csi-snapshotter:v6.2.1",
        registrar: "csi-node-driver-registrar:v2.7.0",
    },
    SidecarRelease {
        platform: (4, 14),
        provisioner: "csi-provisioner:v3.5.0",
        attacher: "csi-attacher:v4.3.0",
        resizer: "csi-resizer:v1.8.0",
        snapshotter: "csi-snapshotter:v6.2.2",
        registrar: "csi-node-driver-registrar:v2.8.0",
    },
    SidecarRelease {
        platform: (4, 15),
        provisioner: "csi-provisioner:v3.6.2",
        attacher: "csi-attacher:v4.4.2",
        resizer: "csi-resizer:v1.9.2",
        snapshotter: "csi-snapshotter:v6.3.2",
        registrar: "csi-node-driver-registrar:v2.9.1",
    },
    SidecarRelease {
        platform: (4, 16),
        provisioner: "csi-provisioner:v4.0.1",
        attacher: "csi-attacher:v4.5.1",
        resizer: "csi-resizer:v1.10.1",
        snapshotter: "csi-snapshotter:v7.0.2",
        registrar: "csi-node-driver-registrar:v2.10.1",
    },
];

impl SidecarImages {
    /// Sidecars of the newest supported release not newer than `version`
    pub fn for_platform_version(version: &str) -> Result<Self> {
        let platform = parse_major_minor(version)
            .ok_or_else(|| Error::UnsupportedVersion(version.to_string()))?;
        let release = SIDECAR_RELEASES
            .iter()
            .rev()
            .find(|r| r.platform <= platform)
            .ok_or_else(|| Error::UnsupportedVersion(version.to_string()))?;

        let image = |name: &str| format!("{SIG_STORAGE}/{name}");
        Ok(Self {
            provisioner: image(release.provisioner),
            attacher: image(release.attacher),
            resizer: image(release.resizer),
            snapshotter: image(release.snapshotter),
            registrar: image(release.registrar),
        })
    }
}

fn parse_major_minor(version: &str) -> Option<(u32, u32)> {
    let version = version.trim().trim_start_matches('v');
    let mut parts = version.split(['.', '-', '+']);
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Inputs shared by every CSI workload template
#[derive(Clone, Copy, Debug)]
pub struct CsiParams<'a> {
    pub namespace: &'a str,
    pub driver_image: &'a str,
    pub sidecars: &'a SidecarImages,
}

fn app_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

fn container(name: &str, image: &str, args: &[String]) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(args.to_vec()),
        volume_mounts: Some(vec![mount("socket-dir", "/csi")]),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn host_path(name: &str, path: &str, type_: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: Some(type_.to_string()),
        }),
        ..Default::default()
    }
}

fn config_map_volume(name: &str, config_map: &str) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(config_map.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn driver_container(protocol: Protocol, params: CsiParams<'_>, controller: bool) -> Container {
    let mut args = vec![
        format!("--type={}", protocol.short()),
        format!("--drivername={}", protocol.driver_name(params.namespace)),
        "--nodeid=$(NODE_ID)".to_string(),
        "--pidlimit=-1".to_string(),
        "--v=5".to_string(),
    ];
    if controller {
        args.push("--controllerserver=true".to_string());
        args.push(format!("--endpoint={CONTROLLER_SOCKET}"));
    } else {
        args.push("--nodeserver=true".to_string());
        args.push(format!("--endpoint={NODE_SOCKET}"));
    }

    let mut mounts = vec![
        mount("socket-dir", "/csi"),
        mount("ceph-csi-configs", "/etc/ceph-csi-config"),
        mount("keys-tmp-dir", "/tmp/csi/keys"),
    ];
    if protocol == Protocol::Rbd {
        mounts.push(mount("ceph-csi-kms-config", "/etc/ceph-csi-encryption-kms-config"));
    }
    if !controller {
        mounts.push(mount("host-dev", "/dev"));
        mounts.push(mount("host-sys", "/sys"));
        mounts.push(mount("lib-modules", "/lib/modules"));
        mounts.push(VolumeMount {
            mount_propagation: Some("Bidirectional".to_string()),
            ..mount("mountpoint-dir", &format!("{KUBELET_DIR}/pods"))
        });
        mounts.push(VolumeMount {
            mount_propagation: Some("Bidirectional".to_string()),
            ..mount("plugin-dir", &format!("{KUBELET_DIR}/plugins"))
        });
    }

    Container {
        name: format!("csi-{}plugin", protocol.short()),
        image: Some(params.driver_image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(args),
        env: Some(vec![
            field_env("NODE_ID", "spec.nodeName"),
            field_env("POD_NAMESPACE", "metadata.namespace"),
        ]),
        security_context: (!controller).then(|| SecurityContext {
            privileged: Some(true),
            allow_privilege_escalation: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(mounts),
        ..Default::default()
    }
}

fn shared_volumes(protocol: Protocol) -> Vec<Volume> {
    let mut volumes = vec![
        Volume {
            name: "socket-dir".to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "keys-tmp-dir".to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        config_map_volume("ceph-csi-configs", MON_CONFIG_MAP_NAME),
    ];
    if protocol == Protocol::Rbd {
        volumes.push(config_map_volume("ceph-csi-kms-config", ENCRYPTION_CONFIG_MAP_NAME));
    }
    volumes
}

/// Controller-side provisioner Deployment
pub fn provisioner_deployment(protocol: Protocol, params: CsiParams<'_>) -> Deployment {
    let name = protocol.provisioner_name();
    let labels = app_labels(&name);
    let sidecar_args = |extra: &[&str]| -> Vec<String> {
        let mut args = vec![
            format!("--csi-address={CONTROLLER_SOCKET}"),
            "--v=5".to_string(),
            "--timeout=150s".to_string(),
            "--leader-election=true".to_string(),
            format!("--leader-election-namespace={}", params.namespace),
        ];
        args.extend(extra.iter().map(|a| a.to_string()));
        args
    };

    let mut containers = vec![
        container(
            "csi-provisioner",
            &params.sidecars.provisioner,
            &sidecar_args(&[
                "--retry-interval-start=500ms",
                "--default-fstype=ext4",
                "--extra-create-metadata=true",
            ]),
        ),
        container(
            "csi-resizer",
            &params.sidecars.resizer,
            &sidecar_args(&["--handle-volume-inuse-error=false"]),
        ),
        container(
            "csi-snapshotter",
            &params.sidecars.snapshotter,
            &sidecar_args(&["--extra-create-metadata=true"]),
        ),
    ];
    if protocol == Protocol::Rbd {
        containers.push(container(
            "csi-attacher",
            &params.sidecars.attacher,
            &sidecar_args(&[]),
        ));
    }
    containers.push(driver_container(protocol, params, true));

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(params.namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(2),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(protocol.provisioner_service_account()),
                    priority_class_name: Some("system-cluster-critical".to_string()),
                    containers,
                    volumes: Some(shared_volumes(protocol)),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Node-side plugin DaemonSet
pub fn node_plugin_daemonset(protocol: Protocol, params: CsiParams<'_>) -> DaemonSet {
    let name = protocol.node_plugin_name();
    let labels = app_labels(&name);
    let driver = protocol.driver_name(params.namespace);

    let registrar = Container {
        volume_mounts: Some(vec![
            mount("plugin-dir", "/csi"),
            mount("registration-dir", "/registration"),
        ]),
        env: Some(vec![field_env("KUBE_NODE_NAME", "spec.nodeName")]),
        ..container(
            "driver-registrar",
            &params.sidecars.registrar,
            &[
                "--v=5".to_string(),
                "--csi-address=/csi/csi.sock".to_string(),
                format!("--kubelet-registration-path={KUBELET_DIR}/plugins/{driver}/csi.sock"),
            ],
        )
    };

    let mut volumes = shared_volumes(protocol);
    volumes.retain(|v| v.name != "socket-dir");
    volumes.extend([
        host_path("socket-dir", &format!("{KUBELET_DIR}/plugins/{driver}"), "DirectoryOrCreate"),
        host_path("plugin-dir", &format!("{KUBELET_DIR}/plugins"), "Directory"),
        host_path("registration-dir", &format!("{KUBELET_DIR}/plugins_registry"), "Directory"),
        host_path("mountpoint-dir", &format!("{KUBELET_DIR}/pods"), "DirectoryOrCreate"),
        host_path("host-dev", "/dev", ""),
        host_path("host-sys", "/sys", ""),
        host_path("lib-modules", "/lib/modules", ""),
    ]);

    DaemonSet {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(params.namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            update_strategy: Some(DaemonSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDaemonSet {
                    max_unavailable: Some(IntOrString::String("10%".to_string())),
                    ..Default::default()
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(protocol.node_plugin_service_account()),
                    priority_class_name: Some("system-node-critical".to_string()),
                    host_network: Some(true),
                    host_pid: Some(true),
                    dns_policy: Some("ClusterFirstWithHostNet".to_string()),
                    containers: vec![registrar, driver_container(protocol, params, false)],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Cluster-scoped driver registration
pub fn csi_driver(protocol: Protocol, namespace: &str) -> CSIDriver {
    CSIDriver {
        metadata: ObjectMeta {
            name: Some(protocol.driver_name(namespace)),
            ..Default::default()
        },
        spec: CSIDriverSpec {
            attach_required: Some(protocol == Protocol::Rbd),
            pod_info_on_mount: Some(false),
            fs_group_policy: Some("File".to_string()),
            ..Default::default()
        },
    }
}

/// Seed content for the monitor and encryption config maps
pub fn write_once_config_map(name: &str, namespace: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "config.json".to_string(),
            "[]".to_string(),
        )])),
        ..Default::default()
    }
}

/// SecurityContextConstraints granting the CSI service accounts host access
pub fn security_context_constraints(namespace: &str) -> DynamicObject {
    let users: Vec<String> = Protocol::ALL
        .iter()
        .flat_map(|p| [p.provisioner_service_account(), p.node_plugin_service_account()])
        .map(|sa| format!("system:serviceaccount:{namespace}:{sa}"))
        .collect();

    let mut scc = ObjectKey::cluster(ResourceKind::SecurityContextConstraints, SCC_NAME).shell();
    scc.data = json!({
        "allowHostDirVolumePlugin": true,
        "allowHostIPC": true,
        "allowHostNetwork": true,
        "allowHostPID": true,
        "allowHostPorts": true,
        "allowPrivilegedContainer": true,
        "allowedCapabilities": ["SYS_ADMIN"],
        "defaultAddCapabilities": [],
        "fsGroup": { "type": "RunAsAny" },
        "readOnlyRootFilesystem": false,
        "requiredDropCapabilities": [],
        "runAsUser": { "type": "RunAsAny" },
        "seLinuxContext": { "type": "RunAsAny" },
        "supplementalGroups": { "type": "RunAsAny" },
        "users": users,
        "volumes": ["configMap", "emptyDir", "hostPath", "projected", "secret"],
    });
    scc
}
