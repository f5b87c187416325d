//! Tree builder
//!
//! Builds the full resource tree of a composition and keeps single nodes
//! current. The tree root is the composition's sibling CompositionReference
//! object; every managed reference (plus the composition itself) becomes a
//! leaf pointing back at the root. Node health is derived from
//! `status.conditions` of the fetched object.

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, SecondsFormat, Utc};
use kube::{Client, ResourceExt};
use kube::core::DynamicObject;
use serde_json::{Value, json};

use crate::cache::TreeCache;
use crate::filters::{
    self, COMPOSITION_REFERENCE_API_VERSION, COMPOSITION_REFERENCE_KIND,
    COMPOSITION_REFERENCE_RESOURCE,
};
use crate::kube as cluster;
use crate::models::{Health, Reference, ResourceNodeSpec, ResourceNodeStatus, ResourceTree};

const CONDITION_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Condition types counted as readiness-relevant. The empty needle makes
/// every type relevant; kept spelled out so the intent survives.
const POSITIVE_TYPES: [&str; 6] = ["", "ready", "complete", "healthy", "active", "able"];

/// Build the full resource tree for a composition, publish it to the
/// cache, and write readiness back to the composition's status
/// subresource.
pub async fn build(
    client: &Client,
    cache: &TreeCache,
    composition: &DynamicObject,
    reference: &Reference,
) -> Result<()> {
    let composition_id = composition.uid().unwrap_or_default();

    let companion = filters::get_composition_reference(client, reference)
        .await
        .context("could not obtain CompositionReference while building resource tree")?;
    let tree_filters = filters::extract_filters(&companion);

    let root_reference = Reference {
        api_version: COMPOSITION_REFERENCE_API_VERSION.to_string(),
        kind: COMPOSITION_REFERENCE_KIND.to_string(),
        resource: COMPOSITION_REFERENCE_RESOURCE.to_string(),
        name: companion.name_any(),
        namespace: companion.namespace().unwrap_or_default(),
        uid: String::new(),
    };
    let (root_spec, root_status) = object_status(client, &root_reference, None)
        .await
        .context("could not obtain CompositionReference status while building resource tree")?;

    let status = composition
        .data
        .get("status")
        .context("could not find 'status' field in composition object")?;
    let managed = status
        .get("managed")
        .context("could not find 'managed' field in composition object")?
        .as_array()
        .context("'managed' field is not a sequence as expected")?;

    let mut managed_references: Vec<Reference> = managed
        .iter()
        .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
        .collect();
    managed_references.push(reference.clone());

    let mut tree = ResourceTree {
        composition_id: composition_id.clone(),
        root_status: 0,
        spec_nodes: vec![root_spec],
        status_nodes: vec![root_status],
    };

    for managed_reference in &managed_references {
        match object_status(client, managed_reference, Some((&root_reference, 0))).await {
            Ok((spec, status)) => {
                tree.spec_nodes.push(spec);
                tree.status_nodes.push(status);
            }
            Err(err) => {
                tracing::warn!("error retrieving object status, continuing: {:#}", err);
            }
        }
    }

    cache
        .put(tree.clone(), &composition_id, reference.clone(), tree_filters)
        .await;

    set_composition_status(client, reference, &tree)
        .await
        .with_context(|| {
            format!(
                "updating the composition status for composition id {}",
                composition_id
            )
        })?;
    Ok(())
}

/// Fetch one object and derive its tree nodes. When `root` is given and the
/// reference is not the root itself, the node's parent edges point at the
/// root (by reference in the spec node, by index in the status node).
pub async fn object_status(
    client: &Client,
    reference: &Reference,
    root: Option<(&Reference, usize)>,
) -> Result<(ResourceNodeSpec, ResourceNodeStatus)> {
    let object = cluster::get_object(client, reference).await?;

    let health = object
        .data
        .pointer("/status/conditions")
        .and_then(|conditions| conditions.as_array())
        .and_then(|conditions| select_condition(conditions))
        .map(|record| vec![record])
        .unwrap_or_default();

    let mut spec = ResourceNodeSpec {
        api_version: reference.api_version.clone(),
        resource: reference.resource.clone(),
        name: reference.name.clone(),
        namespace: reference.namespace.clone(),
        parent_refs: Vec::new(),
    };
    let mut status = ResourceNodeStatus {
        version: object
            .types
            .as_ref()
            .map(|types| types.api_version.clone())
            .unwrap_or_else(|| reference.api_version.clone()),
        kind: object
            .types
            .as_ref()
            .map(|types| types.kind.clone())
            .unwrap_or_default(),
        name: reference.name.clone(),
        namespace: reference.namespace.clone(),
        uid: object.uid().unwrap_or_default(),
        resource_version: object.resource_version().unwrap_or_default(),
        created_at: object.creation_timestamp().map(|time| time.0),
        health,
        parent_refs: Vec::new(),
    };

    if let Some((root_reference, root_index)) = root {
        if !spec.matches(root_reference) {
            spec.parent_refs = vec![root_reference.clone()];
            status.parent_refs = vec![root_index];
        }
    }

    Ok((spec, status))
}

/// Pick the condition that represents the object's health: a `Ready`-typed
/// condition wins outright, otherwise the one with the most recent
/// transition time, otherwise the first.
pub fn select_condition(conditions: &[Value]) -> Option<Health> {
    if conditions.is_empty() {
        return None;
    }
    let ready = conditions
        .iter()
        .find(|condition| condition.get("type").and_then(|t| t.as_str()) == Some("Ready"));
    let chosen = ready
        .or_else(|| most_recent_condition(conditions))
        .unwrap_or(&conditions[0]);
    Some(health_from_condition(chosen))
}

fn most_recent_condition(conditions: &[Value]) -> Option<&Value> {
    let mut latest: Option<(&Value, NaiveDateTime)> = None;
    for condition in conditions {
        let Some(raw) = condition
            .get("lastTransitionTime")
            .and_then(|time| time.as_str())
        else {
            continue;
        };
        match NaiveDateTime::parse_from_str(raw, CONDITION_TIME_FORMAT) {
            Ok(timestamp) => {
                if latest.map_or(true, |(_, best)| timestamp > best) {
                    latest = Some((condition, timestamp));
                }
            }
            Err(err) => {
                tracing::warn!(
                    "could not parse condition lastTransitionTime '{}': {}",
                    raw,
                    err
                );
            }
        }
    }
    if latest.is_none() {
        tracing::warn!("could not find latest condition, using condition in first position");
    }
    latest.map(|(condition, _)| condition)
}

fn health_from_condition(condition: &Value) -> Health {
    let field = |key: &str| {
        condition
            .get(key)
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_string()
    };
    Health {
        status: field("status"),
        type_: field("type"),
        reason: field("reason"),
        message: field("message"),
    }
}

/// Whether a condition type participates in the readiness check.
pub fn is_positive_type(condition_type: &str) -> bool {
    let lowered = condition_type.to_lowercase();
    POSITIVE_TYPES.iter().any(|needle| lowered.contains(needle))
}

/// Readiness of a tree: every non-root node's positive-typed health records
/// must report status `true` (case-insensitive). The first violation is
/// returned as a message.
pub fn is_ready(tree: &ResourceTree) -> (bool, String) {
    for (index, node) in tree.status_nodes.iter().enumerate() {
        if index == tree.root_status {
            continue;
        }
        for health in &node.health {
            if !is_positive_type(&health.type_) {
                continue;
            }
            if !health.status.eq_ignore_ascii_case("true") {
                let message = format!(
                    "Kind:{} Name:{} Namespace:{} Message:{}",
                    node.kind, node.name, node.namespace, health.message
                );
                return (false, message);
            }
        }
    }
    (true, String::new())
}

/// Write tree readiness into the composition's status subresource as a
/// single condition.
async fn set_composition_status(
    client: &Client,
    reference: &Reference,
    tree: &ResourceTree,
) -> Result<()> {
    if reference.kind.is_empty() {
        anyhow::bail!("composition reference does not contain a kind");
    }
    let (ready, message) = is_ready(tree);
    let condition = json!({
        "lastTransitionTime": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "message": message,
        "reason": if ready { "Available" } else { "Unavailable" },
        "status": if ready { "True" } else { "False" },
        "type": "CompositionStatus",
    });
    cluster::patch_object_status(client, reference, json!({ "conditions": [condition] })).await
}

/// Replace the spec node occupying `reference`'s slot, inheriting its
/// parent edges; append when no slot matches.
pub fn upsert_spec_node(tree: &mut ResourceTree, reference: &Reference, node: ResourceNodeSpec) {
    let mut node = node;
    match tree
        .spec_nodes
        .iter()
        .position(|existing| existing.matches(reference))
    {
        Some(position) => {
            node.parent_refs = tree.spec_nodes[position].parent_refs.clone();
            tree.spec_nodes[position] = node;
        }
        None => tree.spec_nodes.push(node),
    }
}

/// Replace the status node matching {kind, version, name, namespace},
/// inheriting its parent edges; append pointing at the root when no slot
/// matches.
pub fn upsert_status_node(
    tree: &mut ResourceTree,
    reference: &Reference,
    kind: &str,
    node: ResourceNodeStatus,
) {
    let mut node = node;
    let position = tree.status_nodes.iter().position(|existing| {
        existing.kind == kind
            && existing.version == reference.api_version
            && existing.name == reference.name
            && existing.namespace == reference.namespace
    });
    match position {
        Some(position) => {
            node.parent_refs = tree.status_nodes[position].parent_refs.clone();
            tree.status_nodes[position] = node;
        }
        None => {
            node.parent_refs = vec![tree.root_status];
            tree.status_nodes.push(node);
        }
    }
}

/// Refresh a single node of a cached tree after a managed-object event.
/// The cluster reads happen up front; the actual node replacement runs as
/// an atomic cache update, and readiness is written back afterwards.
pub async fn single_node_refresh(
    client: &Client,
    cache: &TreeCache,
    new_reference: &Reference,
    new_kind: &str,
    composition_id: &str,
) -> Result<()> {
    let entry = cache.get(composition_id).await.with_context(|| {
        format!("resource tree for composition id {} not found", composition_id)
    })?;
    let composition_reference = entry.composition_reference.clone();

    tracing::info!(
        "update event for object {} {} {} {} in composition id {}",
        new_reference.api_version,
        new_reference.resource,
        new_reference.name,
        new_reference.namespace,
        composition_id
    );

    let companion = filters::get_composition_reference(client, &composition_reference)
        .await
        .context("could not resolve tree root for refresh")?;
    let root_reference = Reference {
        api_version: COMPOSITION_REFERENCE_API_VERSION.to_string(),
        kind: COMPOSITION_REFERENCE_KIND.to_string(),
        resource: COMPOSITION_REFERENCE_RESOURCE.to_string(),
        name: companion.name_any(),
        namespace: companion.namespace().unwrap_or_default(),
        uid: String::new(),
    };

    let (new_spec, new_status) = object_status(
        client,
        new_reference,
        Some((&root_reference, entry.tree.root_status)),
    )
    .await
    .context("error retrieving object status")?;

    let op_reference = new_reference.clone();
    let op_kind = new_kind.to_string();
    cache
        .queue_update(
            composition_id,
            Box::new(move |entry| {
                upsert_spec_node(&mut entry.tree, &op_reference, new_spec);
                upsert_status_node(&mut entry.tree, &op_reference, &op_kind, new_status);
                Ok(())
            }),
        )
        .await?;

    // The composition must still exist before its status is patched; an
    // entry can outlive its object briefly around deletion events.
    cluster::get_object(client, &composition_reference)
        .await
        .context("retrieving composition object, could not update composition status")?;

    let refreshed = cache.get(composition_id).await.with_context(|| {
        format!(
            "resource tree for composition id {} disappeared during refresh",
            composition_id
        )
    })?;
    set_composition_status(client, &composition_reference, &refreshed.tree)
        .await
        .with_context(|| {
            format!(
                "updating the composition status for composition id {} (refresh)",
                composition_id
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(type_: &str, status: &str, time: &str) -> Value {
        json!({
            "type": type_,
            "status": status,
            "reason": "Testing",
            "message": "m",
            "lastTransitionTime": time,
        })
    }

    #[test]
    fn test_select_condition_prefers_ready() {
        let conditions = vec![
            condition("Synced", "True", "2024-06-01T10:00:00Z"),
            condition("Ready", "False", "2023-01-01T00:00:00Z"),
        ];
        let health = select_condition(&conditions).unwrap();
        assert_eq!(health.type_, "Ready");
        assert_eq!(health.status, "False");
    }

    #[test]
    fn test_select_condition_falls_back_to_most_recent() {
        let conditions = vec![
            condition("Synced", "True", "2024-06-01T10:00:00Z"),
            condition("Healthy", "False", "2024-06-02T10:00:00Z"),
            condition("Stalled", "False", "2024-05-01T10:00:00Z"),
        ];
        let health = select_condition(&conditions).unwrap();
        assert_eq!(health.type_, "Healthy");
    }

    #[test]
    fn test_select_condition_unparsable_times_use_first() {
        let conditions = vec![
            condition("Synced", "True", "not-a-timestamp"),
            condition("Healthy", "False", "also wrong"),
        ];
        let health = select_condition(&conditions).unwrap();
        assert_eq!(health.type_, "Synced");
    }

    #[test]
    fn test_select_condition_empty() {
        assert!(select_condition(&[]).is_none());
    }

    #[test]
    fn test_health_missing_fields_become_empty() {
        let conditions = vec![json!({"type": "Ready"})];
        let health = select_condition(&conditions).unwrap();
        assert_eq!(health.status, "");
        assert_eq!(health.reason, "");
        assert_eq!(health.message, "");
    }

    #[test]
    fn test_positive_types() {
        assert!(is_positive_type("Ready"));
        assert!(is_positive_type("ArtifactHealthy"));
        assert!(is_positive_type("Complete"));
        // The empty needle makes every type participate.
        assert!(is_positive_type("Stalled"));
        assert!(is_positive_type(""));
    }

    fn tree_with_leaf_health(health: Vec<Health>) -> ResourceTree {
        ResourceTree {
            composition_id: "u1".to_string(),
            root_status: 0,
            spec_nodes: Vec::new(),
            status_nodes: vec![
                ResourceNodeStatus {
                    kind: "CompositionReference".to_string(),
                    name: "root".to_string(),
                    // An unhealthy root must not affect readiness.
                    health: vec![Health {
                        status: "False".to_string(),
                        type_: "Ready".to_string(),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                ResourceNodeStatus {
                    kind: "Deployment".to_string(),
                    name: "web".to_string(),
                    namespace: "demo".to_string(),
                    health,
                    ..Default::default()
                },
            ],
        }
    }

    #[test]
    fn test_is_ready_all_true() {
        let tree = tree_with_leaf_health(vec![Health {
            status: "TRUE".to_string(),
            type_: "Ready".to_string(),
            ..Default::default()
        }]);
        assert_eq!(is_ready(&tree), (true, String::new()));
    }

    #[test]
    fn test_is_ready_violation_reports_node() {
        let tree = tree_with_leaf_health(vec![Health {
            status: "False".to_string(),
            type_: "Ready".to_string(),
            message: "progress deadline exceeded".to_string(),
            ..Default::default()
        }]);
        let (ready, message) = is_ready(&tree);
        assert!(!ready);
        assert_eq!(
            message,
            "Kind:Deployment Name:web Namespace:demo Message:progress deadline exceeded"
        );
    }

    #[test]
    fn test_is_ready_no_health_records() {
        let tree = tree_with_leaf_health(Vec::new());
        assert_eq!(is_ready(&tree), (true, String::new()));
    }

    #[test]
    fn test_upsert_spec_node_replaces_in_place_and_inherits_parents() {
        let parent = Reference {
            api_version: "resourcetrees.krateo.io/v1".to_string(),
            resource: "compositionreferences".to_string(),
            name: "root".to_string(),
            namespace: "demo".to_string(),
            ..Default::default()
        };
        let mut tree = ResourceTree {
            spec_nodes: vec![ResourceNodeSpec {
                api_version: "apps/v1".to_string(),
                resource: "deployments".to_string(),
                name: "web".to_string(),
                namespace: "demo".to_string(),
                parent_refs: vec![parent.clone()],
            }],
            ..Default::default()
        };
        let reference = Reference {
            api_version: "apps/v1".to_string(),
            resource: "deployments".to_string(),
            name: "web".to_string(),
            namespace: "demo".to_string(),
            ..Default::default()
        };
        // The incoming node carries no parents; it must inherit them.
        upsert_spec_node(
            &mut tree,
            &reference,
            ResourceNodeSpec {
                api_version: "apps/v1".to_string(),
                resource: "deployments".to_string(),
                name: "web".to_string(),
                namespace: "demo".to_string(),
                parent_refs: Vec::new(),
            },
        );
        assert_eq!(tree.spec_nodes.len(), 1);
        assert_eq!(tree.spec_nodes[0].parent_refs, vec![parent]);
    }

    #[test]
    fn test_upsert_spec_node_appends_when_new() {
        let mut tree = ResourceTree::default();
        let reference = Reference {
            api_version: "v1".to_string(),
            resource: "configmaps".to_string(),
            name: "settings".to_string(),
            namespace: "demo".to_string(),
            ..Default::default()
        };
        upsert_spec_node(
            &mut tree,
            &reference,
            ResourceNodeSpec {
                api_version: "v1".to_string(),
                resource: "configmaps".to_string(),
                name: "settings".to_string(),
                namespace: "demo".to_string(),
                parent_refs: Vec::new(),
            },
        );
        assert_eq!(tree.spec_nodes.len(), 1);
    }

    #[test]
    fn test_upsert_status_node_appends_pointing_at_root() {
        let mut tree = ResourceTree {
            root_status: 0,
            status_nodes: vec![ResourceNodeStatus {
                kind: "CompositionReference".to_string(),
                name: "root".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let reference = Reference {
            api_version: "v1".to_string(),
            name: "settings".to_string(),
            namespace: "demo".to_string(),
            ..Default::default()
        };
        upsert_status_node(
            &mut tree,
            &reference,
            "ConfigMap",
            ResourceNodeStatus {
                version: "v1".to_string(),
                kind: "ConfigMap".to_string(),
                name: "settings".to_string(),
                namespace: "demo".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(tree.status_nodes.len(), 2);
        assert_eq!(tree.status_nodes[1].parent_refs, vec![0]);
    }

    #[test]
    fn test_upsert_status_node_replaces_matching_slot() {
        let mut tree = ResourceTree {
            root_status: 0,
            status_nodes: vec![
                ResourceNodeStatus {
                    kind: "CompositionReference".to_string(),
                    name: "root".to_string(),
                    ..Default::default()
                },
                ResourceNodeStatus {
                    version: "apps/v1".to_string(),
                    kind: "Deployment".to_string(),
                    name: "web".to_string(),
                    namespace: "demo".to_string(),
                    resource_version: "100".to_string(),
                    parent_refs: vec![0],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let reference = Reference {
            api_version: "apps/v1".to_string(),
            name: "web".to_string(),
            namespace: "demo".to_string(),
            ..Default::default()
        };
        upsert_status_node(
            &mut tree,
            &reference,
            "Deployment",
            ResourceNodeStatus {
                version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                name: "web".to_string(),
                namespace: "demo".to_string(),
                resource_version: "101".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(tree.status_nodes.len(), 2);
        assert_eq!(tree.status_nodes[1].resource_version, "101");
        assert_eq!(tree.status_nodes[1].parent_refs, vec![0]);
    }
}
