//! Controller owner references for namespace-scoped managed objects
//!
//! Owned objects are garbage-collected by the cluster when their owner is
//! deleted. Cluster-scoped objects cannot be owned by a namespaced owner and
//! must never be passed here.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;

use crate::error::{Error, Result};

/// Build the controller reference pointing at `owner`
pub fn controller_reference(owner: &DynamicObject) -> Result<OwnerReference> {
    let types = owner
        .types
        .as_ref()
        .ok_or_else(|| Error::Ownership("owner has no apiVersion/kind".to_string()))?;
    let name = owner
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::Ownership("owner has no name".to_string()))?;
    let uid = owner
        .metadata
        .uid
        .clone()
        .ok_or_else(|| Error::Ownership(format!("owner {name} has no uid")))?;

    Ok(OwnerReference {
        api_version: types.api_version.clone(),
        kind: types.kind.clone(),
        name,
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Make `owner` the controller of `target`.
///
/// Owners are matched by group, kind and name, so a recreated owner takes
/// over its predecessor's reference with the new uid. Fails when `target` is
/// cluster-scoped, lives in a different namespace than `owner`, or is
/// already controlled by another object.
pub fn attach_owner(owner: &DynamicObject, target: &mut DynamicObject) -> Result<()> {
    let target_name = target.metadata.name.clone().unwrap_or_default();
    let owner_ns = owner.metadata.namespace.as_deref().ok_or_else(|| {
        Error::Ownership(format!(
            "cluster-scoped owner cannot control {target_name} through the garbage collector"
        ))
    })?;
    let target_ns = target.metadata.namespace.as_deref().ok_or_else(|| {
        Error::Ownership(format!(
            "cluster-scoped object {target_name} cannot be owned by a namespaced object"
        ))
    })?;
    if owner_ns != target_ns {
        return Err(Error::Ownership(format!(
            "cross-namespace owner references are disallowed: \
             owner namespace {owner_ns}, object {target_ns}/{target_name}"
        )));
    }

    let reference = controller_reference(owner)?;
    let refs = target.metadata.owner_references.get_or_insert_with(Vec::new);

    if let Some(other) = refs
        .iter()
        .find(|r| r.controller == Some(true) && !same_owner(r, &reference))
    {
        return Err(Error::Ownership(format!(
            "{target_name} is already controlled by {} {}",
            other.kind, other.name
        )));
    }

    match refs.iter_mut().find(|r| same_owner(r, &reference)) {
        Some(existing) => *existing = reference,
        None => refs.push(reference),
    }
    Ok(())
}

fn api_group(api_version: &str) -> &str {
    api_version.rsplit_once('/').map(|(g, _)| g).unwrap_or("")
}

fn same_owner(a: &OwnerReference, b: &OwnerReference) -> bool {
    api_group(&a.api_version) == api_group(&b.api_version) && a.kind == b.kind && a.name == b.name
}
