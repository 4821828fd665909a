//! Desired state of every managed object
//!
//! Functions here are pure. They take the few scalar parameters each object
//! depends on and return a filled-in object; reading and writing the cluster
//! is the reconciler's job.

pub mod console;
pub mod csi;
pub mod monitoring;
pub mod webhook;

pub use csi::{CsiParams, Protocol, SidecarImages};
