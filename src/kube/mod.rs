//! Cluster adapter
//!
//! All cluster access goes through the dynamic API: objects are fetched and
//! listed as [`DynamicObject`] regardless of type, and only the fields the
//! service reads are validated. Provides namespaced get with cluster-scoped
//! fallback, label-selector listing, status subresource patching, and
//! kind-to-plural resolution via API discovery.

use anyhow::{Context, Result};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject};
use kube::discovery::{self, verbs};
use kube::{Client, ResourceExt};

use crate::models::Reference;

/// API group of composition objects.
pub const COMPOSITION_GROUP: &str = "composition.krateo.io";

/// Label carrying the composition uid on managed objects.
pub const LABEL_COMPOSITION_ID: &str = "krateo.io/composition-id";
/// Label carrying the installed composition version on CompositionReferences.
pub const LABEL_COMPOSITION_INSTALLED_VERSION: &str = "krateo.io/composition-installed-version";
/// Label carrying the installed version on the composition object itself.
pub const LABEL_COMPOSITION_VERSION: &str = "krateo.io/composition-version";

/// Create a Kubernetes client using the default inference chain
/// (in-cluster config first, then kubeconfig).
pub async fn create_client() -> Result<Client> {
    let config = kube::Config::infer()
        .await
        .context("resolving Kubernetes client configuration")?;
    let client = Client::try_from(config).context("creating Kubernetes client")?;
    tracing::debug!("Kubernetes client created successfully");
    Ok(client)
}

/// Build the dynamic [`ApiResource`] described by a reference.
/// `kind` may be empty; it is not needed for get/list calls.
pub fn api_resource(reference: &Reference) -> ApiResource {
    ApiResource {
        group: reference.group().to_string(),
        version: reference.version().to_string(),
        api_version: reference.api_version.clone(),
        kind: reference.kind.clone(),
        plural: reference.resource.clone(),
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

/// Fetch the object identified by `reference`. A namespaced get that comes
/// back NotFound is retried cluster-scoped, since managed references do not
/// say whether their target is namespaced.
pub async fn get_object(client: &Client, reference: &Reference) -> Result<DynamicObject> {
    let resource = api_resource(reference);
    let api: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), &reference.namespace, &resource);
    match api.get(&reference.name).await {
        Ok(obj) => Ok(obj),
        Err(err) if is_not_found(&err) => {
            tracing::debug!(
                "resource {} {}/{} not found namespaced, retrying cluster-scoped",
                reference.resource,
                reference.namespace,
                reference.name
            );
            let api: Api<DynamicObject> = Api::all_with(client.clone(), &resource);
            api.get(&reference.name).await.with_context(|| {
                format!(
                    "fetching resource {} with name {} (apiVersion {})",
                    reference.resource, reference.name, reference.api_version
                )
            })
        }
        Err(err) => Err(err).with_context(|| {
            format!(
                "fetching resource {} with name {} in namespace {} (apiVersion {})",
                reference.resource, reference.name, reference.namespace, reference.api_version
            )
        }),
    }
}

/// List objects of the group-version-resource in `reference` across all
/// namespaces, filtered by a label selector.
pub async fn list_by_labels(
    client: &Client,
    reference: &Reference,
    selector: &str,
) -> Result<Vec<DynamicObject>> {
    let resource = api_resource(reference);
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &resource);
    let params = ListParams::default().labels(selector);
    let list = api.list(&params).await.with_context(|| {
        format!(
            "listing {} with label selector {}",
            reference.resource, selector
        )
    })?;
    Ok(list.items)
}

/// Merge-patch the status subresource of the object at `reference`.
pub async fn patch_object_status(
    client: &Client,
    reference: &Reference,
    status: serde_json::Value,
) -> Result<()> {
    let resource = api_resource(reference);
    let api: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), &reference.namespace, &resource);
    api.patch_status(
        &reference.name,
        &PatchParams::default(),
        &Patch::Merge(&serde_json::json!({ "status": status })),
    )
    .await
    .with_context(|| {
        format!(
            "updating status of {} {}/{}",
            reference.resource, reference.namespace, reference.name
        )
    })?;
    Ok(())
}

/// Resolve the plural resource name for a kind via API discovery.
pub async fn infer_plural(client: &Client, api_version: &str, kind: &str) -> Result<String> {
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    };
    let apigroup = discovery::group(client, group)
        .await
        .with_context(|| format!("discovering API group '{}'", group))?;
    for (resource, _caps) in apigroup.versioned_resources(version) {
        if resource.kind == kind {
            return Ok(resource.plural);
        }
    }
    // The requested version may not be served; fall back to whatever
    // version the server recommends for this kind.
    for (resource, _caps) in apigroup.recommended_resources() {
        if resource.kind == kind {
            return Ok(resource.plural);
        }
    }
    anyhow::bail!("no resource with kind {} found in group '{}'", kind, group)
}

/// Locate a composition object by its uid, searching every served version
/// and listable resource of the composition group. The returned reference
/// carries the installed version from the composition's labels rather than
/// the version the object happened to be listed under.
pub async fn get_composition_by_id(
    client: &Client,
    composition_id: &str,
) -> Result<(DynamicObject, Reference)> {
    let apigroup = discovery::group(client, COMPOSITION_GROUP)
        .await
        .with_context(|| format!("discovering API group '{}'", COMPOSITION_GROUP))?;

    for version in apigroup.versions() {
        for (resource, caps) in apigroup.versioned_resources(&version) {
            if !caps.supports_operation(verbs::LIST) {
                continue;
            }
            let api: Api<DynamicObject> = Api::all_with(client.clone(), &resource);
            let list = match api.list(&ListParams::default()).await {
                Ok(list) => list,
                Err(err) => {
                    tracing::warn!(
                        "error listing resources of type {} in version {}: {}",
                        resource.plural,
                        version,
                        err
                    );
                    continue;
                }
            };
            for item in list.items {
                if item.uid().as_deref() != Some(composition_id) {
                    continue;
                }
                let first_reason = item
                    .data
                    .pointer("/status/conditions/0/reason")
                    .and_then(|reason| reason.as_str());
                if first_reason == Some("Creating") {
                    anyhow::bail!("composition {} is still creating", composition_id);
                }
                let installed_version = item
                    .labels()
                    .get(LABEL_COMPOSITION_VERSION)
                    .cloned()
                    .with_context(|| {
                        format!(
                            "composition {} missing label '{}'",
                            composition_id, LABEL_COMPOSITION_VERSION
                        )
                    })?;
                let kind = item
                    .types
                    .as_ref()
                    .map(|types| types.kind.clone())
                    .unwrap_or_default();
                let reference = Reference {
                    api_version: format!("{}/{}", COMPOSITION_GROUP, installed_version),
                    kind,
                    resource: resource.plural.clone(),
                    name: item.name_any(),
                    namespace: item.namespace().unwrap_or_default(),
                    uid: composition_id.to_string(),
                };
                return Ok((item, reference));
            }
        }
    }

    anyhow::bail!(
        "did not find composition with id {} in any version or resource type of group '{}'",
        composition_id,
        COMPOSITION_GROUP
    )
}
