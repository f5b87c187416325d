//! Data model for compositions and their resource trees
//!
//! Cluster objects themselves are handled as schema-less `serde_json::Value`
//! maps; these types only model the fields the service actually reads and
//! the wire shapes it serves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies a single cluster object by group-version-resource, name and
/// namespace. `resource` is the plural form; it may be filled in later by
/// API discovery when only `kind` is known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Reference {
    pub api_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kind: String,
    pub resource: String,
    pub name: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uid: String,
}

impl Reference {
    /// The API group half of `api_version` (empty for the core group).
    pub fn group(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }

    /// The version half of `api_version`.
    pub fn version(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((_, version)) => version,
            None => &self.api_version,
        }
    }

}

/// One health record derived from a `status.conditions` entry.
/// Missing condition fields become empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Health {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub type_: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Spec-side node: the identity of a tree member plus its parent edges.
/// The root node has no parents; every other node points at the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceNodeSpec {
    pub api_version: String,
    pub resource: String,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parent_refs: Vec<Reference>,
}

impl ResourceNodeSpec {
    /// Whether this spec node occupies the same tree slot as `reference`.
    pub fn matches(&self, reference: &Reference) -> bool {
        self.api_version == reference.api_version
            && self.resource == reference.resource
            && self.name == reference.name
            && self.namespace == reference.namespace
    }
}

/// Status-side node. Parent edges are indexes into the owning tree's
/// `status_nodes` table rather than nested pointers, so back-references from
/// leaves to the root never form ownership cycles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceNodeStatus {
    pub version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub resource_version: String,
    pub created_at: Option<DateTime<Utc>>,
    pub health: Vec<Health>,
    pub parent_refs: Vec<usize>,
}

/// The full resource tree for one composition. `root_status` indexes into
/// `status_nodes`; spec and status tables are kept pairwise consistent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceTree {
    pub composition_id: String,
    pub root_status: usize,
    pub spec_nodes: Vec<ResourceNodeSpec>,
    pub status_nodes: Vec<ResourceNodeStatus>,
}

impl ResourceTree {
    /// Reconstruct the reference identifying a status node, pairing it with
    /// its spec node to recover the resource plural. Matching is on
    /// {apiVersion, name, namespace} per the tree invariant.
    pub fn status_reference(&self, index: usize) -> Option<Reference> {
        let status = self.status_nodes.get(index)?;
        let spec = self.spec_nodes.iter().find(|spec| {
            spec.api_version == status.version
                && spec.name == status.name
                && spec.namespace == status.namespace
        })?;
        Some(Reference {
            api_version: status.version.clone(),
            kind: status.kind.clone(),
            resource: spec.resource.clone(),
            name: status.name.clone(),
            namespace: status.namespace.clone(),
            uid: status.uid.clone(),
        })
    }

    /// Render a status node into its wire shape, expanding parent indexes
    /// into nested identity objects.
    pub fn render_status_node(&self, index: usize) -> Option<StatusNode> {
        let node = self.status_nodes.get(index)?;
        let parent_refs = node
            .parent_refs
            .iter()
            .filter_map(|&parent| self.status_nodes.get(parent))
            .map(|parent| StatusParentRef {
                version: parent.version.clone(),
                kind: parent.kind.clone(),
                namespace: parent.namespace.clone(),
                name: parent.name.clone(),
            })
            .collect();
        Some(StatusNode {
            version: node.version.clone(),
            kind: node.kind.clone(),
            namespace: node.namespace.clone(),
            name: node.name.clone(),
            parent_refs,
            uid: node.uid.clone(),
            resource_version: node.resource_version.clone(),
            created_at: node.created_at,
            health: node.health.clone(),
        })
    }
}

/// Identity of a parent node as rendered on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusParentRef {
    pub version: String,
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
}

/// Wire shape of a status node as served to UI clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusNode {
    pub version: String,
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parent_refs: Vec<StatusParentRef>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub health: Vec<Health>,
}

/// Exclude-filter set carried by a CompositionReference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Filters {
    pub exclude: Vec<Exclude>,
}

/// One exclusion rule. Each field is either a literal, a regular expression
/// (anchored at end-of-line before matching), or empty meaning match-any.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Exclude {
    pub api_version: String,
    pub resource: String,
    pub name: String,
}

/// Cache value: a built tree plus the context needed to rebuild it.
#[derive(Debug, Clone)]
pub struct ResourceTreeEntry {
    pub last_update: DateTime<Utc>,
    pub tree: ResourceTree,
    pub composition_reference: Reference,
    pub filters: Filters,
}

/// The object an incoming event is about, as delivered by the event bus and
/// the lifecycle webhook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvolvedObject {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
}

impl InvolvedObject {
    /// The API group half of `api_version` (empty for the core group).
    pub fn group(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }
}

/// Payload of one SSE event from the upstream bus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectEvent {
    pub involved_object: InvolvedObject,
}

/// Body of the inbound lifecycle webhook: a Kubernetes Event, of which only
/// the involved object and the reason are read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LifecycleEvent {
    pub involved_object: InvolvedObject,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_group_version_split() {
        let r = Reference {
            api_version: "composition.krateo.io/v1".to_string(),
            ..Default::default()
        };
        assert_eq!(r.group(), "composition.krateo.io");
        assert_eq!(r.version(), "v1");

        let core = Reference {
            api_version: "v1".to_string(),
            ..Default::default()
        };
        assert_eq!(core.group(), "");
        assert_eq!(core.version(), "v1");
    }

    #[test]
    fn test_reference_deserializes_managed_entry() {
        let json = r#"{"apiVersion":"apps/v1","resource":"deployments","name":"web","namespace":"demo"}"#;
        let r: Reference = serde_json::from_str(json).unwrap();
        assert_eq!(r.api_version, "apps/v1");
        assert_eq!(r.resource, "deployments");
        assert_eq!(r.kind, "");
        assert_eq!(r.uid, "");
    }

    #[test]
    fn test_status_node_wire_shape() {
        let node = StatusNode {
            version: "resourcetrees.krateo.io/v1".to_string(),
            kind: "CompositionReference".to_string(),
            namespace: "demo".to_string(),
            name: "comp-a".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["version"], "resourcetrees.krateo.io/v1");
        assert_eq!(json["kind"], "CompositionReference");
        // Empty collections are omitted entirely.
        assert!(json.get("parentRefs").is_none());
        assert!(json.get("health").is_none());
    }

    #[test]
    fn test_render_status_node_expands_parents() {
        let tree = ResourceTree {
            composition_id: "u1".to_string(),
            root_status: 0,
            spec_nodes: vec![
                ResourceNodeSpec {
                    api_version: "resourcetrees.krateo.io/v1".to_string(),
                    resource: "compositionreferences".to_string(),
                    name: "root".to_string(),
                    namespace: "demo".to_string(),
                    parent_refs: Vec::new(),
                },
                ResourceNodeSpec {
                    api_version: "apps/v1".to_string(),
                    resource: "deployments".to_string(),
                    name: "web".to_string(),
                    namespace: "demo".to_string(),
                    parent_refs: vec![Reference {
                        api_version: "resourcetrees.krateo.io/v1".to_string(),
                        resource: "compositionreferences".to_string(),
                        name: "root".to_string(),
                        namespace: "demo".to_string(),
                        ..Default::default()
                    }],
                },
            ],
            status_nodes: vec![
                ResourceNodeStatus {
                    version: "resourcetrees.krateo.io/v1".to_string(),
                    kind: "CompositionReference".to_string(),
                    name: "root".to_string(),
                    namespace: "demo".to_string(),
                    ..Default::default()
                },
                ResourceNodeStatus {
                    version: "apps/v1".to_string(),
                    kind: "Deployment".to_string(),
                    name: "web".to_string(),
                    namespace: "demo".to_string(),
                    parent_refs: vec![0],
                    ..Default::default()
                },
            ],
        };

        let rendered = tree.render_status_node(1).unwrap();
        assert_eq!(rendered.parent_refs.len(), 1);
        assert_eq!(rendered.parent_refs[0].kind, "CompositionReference");
        assert_eq!(rendered.parent_refs[0].name, "root");

        let reference = tree.status_reference(1).unwrap();
        assert_eq!(reference.resource, "deployments");
        assert_eq!(reference.api_version, "apps/v1");
    }
}
