//! Filter resolver
//!
//! Every composition has a sibling CompositionReference object carrying an
//! exclude-filter set. This module locates that object through the
//! well-known labels, extracts and compares filter sets, and decides
//! whether a managed reference is excluded from the served tree.

use anyhow::{Context, Result};
use kube::Client;
use kube::core::DynamicObject;
use regex::Regex;

use crate::kube as cluster;
use crate::kube::{LABEL_COMPOSITION_ID, LABEL_COMPOSITION_INSTALLED_VERSION};
use crate::models::{Exclude, Filters, Reference};

/// apiVersion of the CompositionReference companion object.
pub const COMPOSITION_REFERENCE_API_VERSION: &str = "resourcetrees.krateo.io/v1";
/// Plural resource of the CompositionReference companion object.
pub const COMPOSITION_REFERENCE_RESOURCE: &str = "compositionreferences";
/// Kind of the CompositionReference companion object.
pub const COMPOSITION_REFERENCE_KIND: &str = "CompositionReference";

/// Locate the sibling CompositionReference of a composition by label
/// selector. Returns the first match or an error when none exists.
pub async fn get_composition_reference(
    client: &Client,
    composition: &Reference,
) -> Result<DynamicObject> {
    let mut composition = composition.clone();
    if composition.resource.is_empty() {
        composition.resource =
            cluster::infer_plural(client, &composition.api_version, &composition.kind)
                .await
                .unwrap_or_default();
    }

    let selector = format!(
        "{}={},{}={}",
        LABEL_COMPOSITION_ID,
        composition.uid,
        LABEL_COMPOSITION_INSTALLED_VERSION,
        composition.version(),
    );
    tracing::debug!("filters: looking for labels: {}", selector);

    let listing = Reference {
        api_version: COMPOSITION_REFERENCE_API_VERSION.to_string(),
        resource: COMPOSITION_REFERENCE_RESOURCE.to_string(),
        ..Default::default()
    };
    let items = cluster::list_by_labels(client, &listing, &selector).await?;
    items
        .into_iter()
        .next()
        .with_context(|| format!("no composition reference found for labels {}", selector))
}

/// Extract the exclude set from a CompositionReference object.
pub fn extract_filters(composition_reference: &DynamicObject) -> Filters {
    let exclude = composition_reference
        .data
        .pointer("/spec/filters/exclude")
        .cloned()
        .and_then(|value| serde_json::from_value::<Vec<Exclude>>(value).ok())
        .unwrap_or_default();
    Filters { exclude }
}

/// Fetch the current filter set for a composition. Failure to resolve the
/// CompositionReference degrades to an empty set so callers can proceed
/// unfiltered.
pub async fn get_filters(client: &Client, composition: &Reference) -> Filters {
    match get_composition_reference(client, composition).await {
        Ok(reference) => {
            let filters = extract_filters(&reference);
            tracing::debug!("obtained list of filters, with length {}", filters.exclude.len());
            filters
        }
        Err(err) => {
            tracing::error!(
                "error while retrieving filters, continuing without filters: {:#}",
                err
            );
            Filters::default()
        }
    }
}

/// Set equality on the exclude sets: order does not matter, and the
/// relation is symmetric.
pub fn filters_equal(a: &Filters, b: &Filters) -> bool {
    let contains_all = |outer: &[Exclude], inner: &[Exclude]| {
        outer.iter().all(|x| inner.iter().any(|y| x == y))
    };
    contains_all(&a.exclude, &b.exclude) && contains_all(&b.exclude, &a.exclude)
}

/// Whether a managed reference is excluded. All three fields must match:
/// empty matches anything, a literal matches on equality, anything else is
/// treated as a regular expression anchored at end-of-string.
pub fn matches(exclude: &Exclude, candidate: &Reference) -> bool {
    field_matches(&exclude.api_version, &candidate.api_version)
        && field_matches(&exclude.resource, &candidate.resource)
        && field_matches(&exclude.name, &candidate.name)
}

fn field_matches(pattern: &str, value: &str) -> bool {
    if pattern.is_empty() || pattern == value {
        return true;
    }
    is_full_match(pattern, value)
}

/// Regex match with a `$` appended when the pattern does not already end
/// with one. An invalid pattern never matches.
fn is_full_match(pattern: &str, value: &str) -> bool {
    let anchored = if pattern.ends_with('$') {
        pattern.to_string()
    } else {
        format!("{}$", pattern)
    };
    match Regex::new(&anchored) {
        Ok(regex) => regex.is_match(value),
        Err(err) => {
            tracing::warn!("invalid exclude pattern '{}': {}", pattern, err);
            false
        }
    }
}
