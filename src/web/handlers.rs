//! HTTP handlers
//!
//! Thin shell over the cache, regulator and dispatcher. GET handlers never
//! block on cluster I/O for cached entries; building always goes through
//! admission and the job queue.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde_json::json;

use crate::dispatch::BuildJob;
use crate::kube as cluster;
use crate::models::{LifecycleEvent, Reference, ResourceTreeEntry};
use crate::web::{AppState, ServiceError};

/// Entries older than this trigger a background rebuild on read.
pub const CACHE_FRESHNESS_HOURS: i64 = 8;

const REASON_COMPOSITION_CREATED: &str = "CompositionCreated";
const REASON_COMPOSITION_UPDATED: &str = "CompositionUpdated";
const REASON_COMPOSITION_DELETED: &str = "CompositionDeleted";

fn queued_message(composition_id: &str) -> String {
    format!("Job for composition {} has been queued", composition_id)
}

/// Whether an entry has outlived the freshness window.
pub fn is_stale(entry: &ResourceTreeEntry) -> bool {
    Utc::now().signed_duration_since(entry.last_update)
        > chrono::Duration::hours(CACHE_FRESHNESS_HOURS)
}

pub async fn home() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn list(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let ids = state.cache.list_ids().await;
    Json(json!({ "composition_ids": ids.join(" ") }))
}

/// Serve the filtered status nodes of a composition. A hit on a stale
/// entry re-enqueues a build without delaying the response; a miss
/// resolves the composition, admits it and queues the first build.
pub async fn get_composition(
    State(state): State<Arc<AppState>>,
    Path(composition_id): Path<String>,
) -> Result<Response, ServiceError> {
    if let Some(entry) = state.cache.get(&composition_id).await {
        if is_stale(&entry) && state.regulator.try_admit(&composition_id) {
            tracing::info!(
                "cache entry for composition {} is older than {}h, scheduling refresh",
                composition_id,
                CACHE_FRESHNESS_HOURS
            );
            let state = state.clone();
            let id = composition_id.clone();
            tokio::spawn(async move {
                if let Err(err) = resolve_and_enqueue(&state, &id).await {
                    state.regulator.release(&id);
                    tracing::error!("background refresh of composition {} failed: {:#}", id, err);
                }
            });
        }
        let nodes = crate::cache::filtered_status_nodes(&entry);
        return Ok(Json(nodes).into_response());
    }

    let (composition, reference) = cluster::get_composition_by_id(&state.client, &composition_id)
        .await
        .map_err(|err| {
            ServiceError::NotFound(format!(
                "could not find resource tree for composition {}: {:#}",
                composition_id, err
            ))
        })?;

    if !state.regulator.try_admit(&composition_id) {
        return Err(ServiceError::TooManyRequests(format!(
            "a job for composition {} is already queued or running",
            composition_id
        )));
    }
    enqueue_or_release(&state, composition, reference, &composition_id).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": queued_message(&composition_id) })),
    )
        .into_response())
}

/// Force a rebuild for the composition reference in the request body.
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Path(composition_id): Path<String>,
    Json(reference): Json<Reference>,
) -> Result<Response, ServiceError> {
    let mut reference = reference;
    if reference.name.is_empty() {
        return Err(ServiceError::BadRequest(
            "reference body must carry a name".to_string(),
        ));
    }
    if reference.resource.is_empty() {
        reference.resource =
            cluster::infer_plural(&state.client, &reference.api_version, &reference.kind)
                .await
                .map_err(|err| {
                    ServiceError::BadRequest(format!(
                        "could not resolve resource for kind {}: {:#}",
                        reference.kind, err
                    ))
                })?;
    }
    reference.uid = composition_id.clone();

    if !state.regulator.try_admit(&composition_id) {
        return Err(ServiceError::TooManyRequests(format!(
            "a job for composition {} is already queued or running",
            composition_id
        )));
    }

    let composition = match cluster::get_object(&state.client, &reference).await {
        Ok(composition) => composition,
        Err(err) => {
            state.regulator.release(&composition_id);
            return Err(ServiceError::NotFound(format!(
                "could not fetch composition {}: {:#}",
                composition_id, err
            )));
        }
    };
    enqueue_or_release(&state, composition, reference, &composition_id).await?;

    Ok(Json(json!({ "message": queued_message(&composition_id) })).into_response())
}

/// Inbound lifecycle webhook. Only events about composition-group objects
/// are acted on; deletions drop cache and subscription, everything else
/// that is new or changed gets subscribed and rebuilt.
pub async fn handle_lifecycle_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<LifecycleEvent>,
) -> Result<Response, ServiceError> {
    let involved = &event.involved_object;
    if involved.group() != cluster::COMPOSITION_GROUP {
        tracing::debug!(
            "ignoring event for involved object group '{}'",
            involved.group()
        );
        return Ok(Json(json!({ "message": "event ignored" })).into_response());
    }

    let composition_id = involved.uid.clone();
    if composition_id.is_empty() {
        return Err(ServiceError::BadRequest(
            "event involved object has no uid".to_string(),
        ));
    }

    if event.reason == REASON_COMPOSITION_DELETED {
        tracing::info!("composition {} deleted, dropping tree and subscription", composition_id);
        state.cache.delete(&composition_id).await;
        state.sse.unsubscribe_from(&composition_id);
        return Ok(Json(json!({
            "message": format!("composition {} removed", composition_id)
        }))
        .into_response());
    }

    let cached = state.cache.contains(&composition_id).await;
    let lifecycle_change =
        event.reason == REASON_COMPOSITION_CREATED || event.reason == REASON_COMPOSITION_UPDATED;
    if !lifecycle_change && cached {
        return Ok(Json(json!({ "message": "event handled" })).into_response());
    }

    state.sse.subscribe_to(&composition_id);

    let (composition, reference) = cluster::get_composition_by_id(&state.client, &composition_id)
        .await
        .map_err(|err| {
            ServiceError::Internal(format!(
                "could not resolve composition {}: {:#}",
                composition_id, err
            ))
        })?;

    if !state.regulator.try_admit(&composition_id) {
        return Err(ServiceError::TooManyRequests(format!(
            "a job for composition {} is already queued or running",
            composition_id
        )));
    }
    enqueue_or_release(&state, composition, reference, &composition_id).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": queued_message(&composition_id) })),
    )
        .into_response())
}

async fn resolve_and_enqueue(state: &Arc<AppState>, composition_id: &str) -> anyhow::Result<()> {
    let (composition, reference) =
        cluster::get_composition_by_id(&state.client, composition_id).await?;
    state
        .dispatcher
        .enqueue(BuildJob {
            composition,
            reference,
            composition_id: composition_id.to_string(),
        })
        .await
}

async fn enqueue_or_release(
    state: &Arc<AppState>,
    composition: kube::core::DynamicObject,
    reference: Reference,
    composition_id: &str,
) -> Result<(), ServiceError> {
    let job = BuildJob {
        composition,
        reference,
        composition_id: composition_id.to_string(),
    };
    if let Err(err) = state.dispatcher.enqueue(job).await {
        state.regulator.release(composition_id);
        return Err(ServiceError::Internal(format!("{:#}", err)));
    }
    Ok(())
}
