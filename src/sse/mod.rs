//! SSE client
//!
//! Maintains one long-lived connection to the upstream event bus with
//! exponential-backoff reconnection. Delivered events are multiplexed by
//! their event id, which carries the composition id: events for ids without
//! a registered subscription are dropped. Each accepted event is handled in
//! its own task, since handling may block up to the wait-for-tree timeout.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use kube::{Client, ResourceExt};

use crate::cache::{TreeCache, WaitOutcome};
use crate::filters;
use crate::kube as cluster;
use crate::models::{ObjectEvent, Reference};
use crate::tree;

pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

/// How long an event callback may wait for a composition's first tree.
const WAIT_FOR_TREE_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to the SSE connection and its subscription map. Cheap to clone.
#[derive(Clone)]
pub struct SseClient {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: String,
    http: reqwest::Client,
    client: Client,
    cache: TreeCache,
    subscriptions: Mutex<HashSet<String>>,
    connected: AtomicBool,
}

impl SseClient {
    pub fn new(endpoint: String, client: Client, cache: TreeCache) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint,
                http: reqwest::Client::new(),
                client,
                cache,
                subscriptions: Mutex::new(HashSet::new()),
                connected: AtomicBool::new(false),
            }),
        }
    }

    /// Start the connection-maintenance loop. Non-blocking; the returned
    /// handle can be used to abort the loop on shutdown.
    pub fn spinup(&self) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        let handle = tokio::spawn(maintain_connection(inner));
        tracing::debug!("end of SSE spinup");
        handle
    }

    /// Register interest in a composition's events. Idempotent, and allowed
    /// while the connection is down.
    pub fn subscribe_to(&self, composition_id: &str) {
        tracing::info!(
            "subscribing to notifications for composition id {}",
            composition_id
        );
        if !self.is_connected() {
            tracing::warn!(
                "SSE client not connected, registering subscription anyway; managed resource events may be missed"
            );
        }
        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .insert(composition_id.to_string());
    }

    /// Drop a subscription. A no-op when none exists.
    pub fn unsubscribe_from(&self, composition_id: &str) {
        tracing::info!(
            "unsubscribing from notifications for composition id {}",
            composition_id
        );
        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .remove(composition_id);
    }

    pub fn is_subscribed(&self, composition_id: &str) -> bool {
        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .contains(composition_id)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

async fn maintain_connection(inner: Arc<Inner>) {
    let mut attempt: u32 = 0;
    loop {
        tracing::debug!("connection checker loop");
        match stream_events(&inner, &mut attempt).await {
            Ok(()) => {
                inner.connected.store(false, Ordering::SeqCst);
                tracing::info!("event stream ended, reconnecting");
                tokio::time::sleep(INITIAL_RETRY_DELAY).await;
            }
            Err(err) => {
                inner.connected.store(false, Ordering::SeqCst);
                attempt += 1;
                if attempt > MAX_RETRY_ATTEMPTS {
                    tracing::error!(
                        "maximum number of retry attempts ({}) reached, stopping reconnection attempts; the resource tree will NOT be updated with managed resources' events, use the /refresh endpoint manually to update the resource tree or restart the service",
                        MAX_RETRY_ATTEMPTS
                    );
                    return;
                }
                let backoff = INITIAL_RETRY_DELAY
                    .saturating_mul(2u32.saturating_pow(attempt - 1))
                    .min(MAX_RETRY_DELAY);
                tracing::warn!(
                    "connection attempt {} failed: {:#}. Retrying in {:?}...",
                    attempt,
                    err,
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Connect and pump events until the stream ends or errors. A successful
/// connection resets the caller's retry budget.
async fn stream_events(inner: &Arc<Inner>, attempt: &mut u32) -> Result<()> {
    let response = inner
        .http
        .get(&inner.endpoint)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
        .context("connecting to SSE endpoint")?
        .error_for_status()
        .context("SSE endpoint returned an error status")?;

    inner.connected.store(true, Ordering::SeqCst);
    *attempt = 0;
    tracing::info!("successfully connected to SSE server");

    let mut events = response.bytes_stream().eventsource();
    while let Some(event) = events.next().await {
        let event = event.context("reading from event stream")?;
        let composition_id = event.id.clone();
        if !inner
            .subscriptions
            .lock()
            .unwrap()
            .contains(&composition_id)
        {
            tracing::debug!("dropping event for unsubscribed composition id {}", composition_id);
            continue;
        }
        let inner = inner.clone();
        tokio::spawn(async move {
            handle_event(inner, composition_id, event.data).await;
        });
    }
    Ok(())
}

/// Callback for one delivered event: fetch the involved object, wait for
/// the composition's tree if the initial build has not finished, then
/// either refresh the single node or rebuild the whole tree when the
/// filter set changed.
async fn handle_event(inner: Arc<Inner>, event_id: String, data: String) {
    tracing::info!("function callback for event {}", event_id);

    let event: ObjectEvent = match serde_json::from_str(&data) {
        Ok(event) => event,
        Err(err) => {
            tracing::error!("there was an error decoding the event {}: {}", data, err);
            return;
        }
    };
    let involved = event.involved_object;

    let resource = cluster::infer_plural(&inner.client, &involved.api_version, &involved.kind)
        .await
        .unwrap_or_else(|err| {
            tracing::error!("could not resolve plural for kind {}: {:#}", involved.kind, err);
            String::new()
        });
    let object_reference = Reference {
        api_version: involved.api_version.clone(),
        kind: involved.kind.clone(),
        resource,
        name: involved.name.clone(),
        namespace: involved.namespace.clone(),
        uid: String::new(),
    };

    let object = match cluster::get_object(&inner.client, &object_reference).await {
        Ok(object) => object,
        Err(err) => {
            tracing::error!("retrieving event object, stopping event handling: {:#}", err);
            return;
        }
    };

    // Objects without the composition label are not part of any tree.
    let Some(composition_id) = object.labels().get(cluster::LABEL_COMPOSITION_ID).cloned() else {
        return;
    };

    match inner
        .cache
        .wait_for(&composition_id, &involved.uid, WAIT_FOR_TREE_TIMEOUT)
        .await
    {
        WaitOutcome::TimedOut => {
            tracing::error!(
                "timeout waiting for resource tree for composition id {}",
                composition_id
            );
        }
        WaitOutcome::Discarded => {
            tracing::warn!(
                "discarded function callback for event {}, object uid {}, event obsolete",
                event_id,
                involved.uid
            );
        }
        WaitOutcome::Ready(entry) => {
            let fresh = filters::get_filters(&inner.client, &entry.composition_reference).await;
            if filters::filters_equal(&fresh, &entry.filters) {
                tracing::info!(
                    "handling object update for object {} {} {} {} and composition id {}",
                    object_reference.resource,
                    object_reference.api_version,
                    object_reference.name,
                    object_reference.namespace,
                    composition_id
                );
                if let Err(err) = tree::single_node_refresh(
                    &inner.client,
                    &inner.cache,
                    &object_reference,
                    &involved.kind,
                    &composition_id,
                )
                .await
                {
                    tracing::error!(
                        "single node refresh failed for composition id {}: {:#}",
                        composition_id,
                        err
                    );
                }
            } else {
                // Filter changes can change tree membership, so only a full
                // rebuild is safe.
                tracing::info!(
                    "filter update detected, updating resource tree for composition id {}",
                    composition_id
                );
                match cluster::get_object(&inner.client, &entry.composition_reference).await {
                    Ok(composition) => {
                        if let Err(err) = tree::build(
                            &inner.client,
                            &inner.cache,
                            &composition,
                            &entry.composition_reference,
                        )
                        .await
                        {
                            tracing::error!(
                                "resource tree rebuild failed for composition id {}: {:#}",
                                composition_id,
                                err
                            );
                        }
                    }
                    Err(err) => {
                        tracing::error!("retrieving composition object: {:#}", err);
                    }
                }
            }
        }
    }
}
