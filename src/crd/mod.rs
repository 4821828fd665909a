//! Typed definitions of the foreign resources the operator watches
//!
//! These CRDs are owned by the platform, not by this operator; only the
//! fields the reconciler reads are modelled.

mod cluster_version;
mod subscription;

pub use cluster_version::{
    ClusterVersion, ClusterVersionSpec, ClusterVersionStatus, Release, CLUSTER_VERSION_NAME,
};
pub use subscription::{Subscription, SubscriptionSpec, OPERATOR_PACKAGE};
