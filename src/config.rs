//! Runtime settings handed to the reconciler

/// Default port the console plugin is served on
pub const DEFAULT_CONSOLE_PORT: u16 = 9001;

pub const DEFAULT_OPERATOR_DEPLOYMENT: &str = "ocs-client-operator-controller-manager";
pub const DEFAULT_CONSOLE_DEPLOYMENT: &str = "ocs-client-operator-console";
pub const DEFAULT_CSI_DRIVER_IMAGE: &str = "quay.io/cephcsi/cephcsi:v3.11.0";

/// Values resolved once at startup from flags and environment.
///
/// The reconciler never reads the environment itself; everything it needs
/// beyond the cluster state is carried here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorSettings {
    /// Namespace the operator and every namespaced managed object live in
    pub namespace: String,
    /// Name of the operator's own Deployment, owner of the CSI stack
    pub operator_deployment: String,
    /// Name of the console Deployment, owner of the console resources
    pub console_deployment: String,
    pub console_port: u16,
    pub csi_driver_image: String,
}

impl OperatorSettings {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            operator_deployment: DEFAULT_OPERATOR_DEPLOYMENT.to_string(),
            console_deployment: DEFAULT_CONSOLE_DEPLOYMENT.to_string(),
            console_port: DEFAULT_CONSOLE_PORT,
            csi_driver_image: DEFAULT_CSI_DRIVER_IMAGE.to_string(),
        }
    }
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self::new("openshift-storage-client")
    }
}
