//! Controller module for ClusterVersion reconciliation
//! This module contains the controller loop, the reconciliation pass and
//! the building blocks it applies to every managed object.

pub mod events;
pub mod merge;
pub mod operator_config;
pub mod ownership;
mod reconciler;
#[cfg(test)]
mod reconciler_test;
pub mod sync;

pub use events::{trigger_ref, EventRouter, WatchedInput};
pub use merge::{merge_preserving, overlay, replace_with, StickyFields};
pub use operator_config::{
    parse_bool, parse_labels, resolve_deploy_flag, CrdProbe, OperatorConfig,
};
pub use ownership::{attach_owner, controller_reference};
pub use reconciler::{reconcile_pass, run_controller, ControllerState, ReconcileReport};
pub use sync::{create_if_absent, create_or_update, Outcome};
