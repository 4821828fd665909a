//! storage-client-operator: reconciliation engine for the OpenShift storage client
//!
//! This crate keeps the CSI driver stack, the subscription webhook, the
//! console plugin and the PVC alerting rules consistent with the cluster
//! version, the operator configuration map and the installed CRDs.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod leader;
pub mod store;
pub mod telemetry;
pub mod templates;

pub use crate::config::OperatorSettings;
pub use crate::error::{Error, Result};
