//! Tree cache
//!
//! Serialized store of resource trees keyed by composition id. A single
//! owner task consumes a command inbox and is the only code that touches
//! the entry map and the waiter table, so cross-field races cannot occur.
//! The owner never performs I/O; callers needing cluster data fetch it
//! before queuing an update.
//!
//! The wait primitive lets SSE callbacks block until a composition's first
//! tree appears: a managed-object event can be delivered before the initial
//! build finishes, and a newer event for the same object preempts an older
//! waiter with a discard signal.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use crate::models::{Filters, Reference, ResourceTree, ResourceTreeEntry, StatusNode};

/// An atomic in-memory mutation applied to a cache entry by the owner task.
/// Must be CPU-only: no I/O, no re-entry into the cache.
pub type UpdateOp = Box<dyn FnOnce(&mut ResourceTreeEntry) -> anyhow::Result<()> + Send>;

/// Failure modes of [`TreeCache::queue_update`].
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("resource tree for composition id {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Resolution of a [`TreeCache::wait_for`] call.
#[derive(Debug)]
pub enum WaitOutcome {
    /// The entry exists (it was already cached, or a build published it
    /// while waiting).
    Ready(ResourceTreeEntry),
    /// A newer waiter for the same event object superseded this one.
    Discarded,
    /// No entry appeared within the timeout; the registration was removed.
    TimedOut,
}

enum Command {
    Put {
        id: String,
        tree: ResourceTree,
        reference: Reference,
        filters: Filters,
        reply: oneshot::Sender<()>,
    },
    Replace {
        id: String,
        tree: ResourceTree,
        reference: Reference,
        reply: oneshot::Sender<()>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<Option<ResourceTreeEntry>>,
    },
    Delete {
        id: String,
        reply: oneshot::Sender<()>,
    },
    ListIds {
        reply: oneshot::Sender<Vec<String>>,
    },
    Contains {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    QueueUpdate {
        id: String,
        op: UpdateOp,
        reply: oneshot::Sender<Result<(), UpdateError>>,
    },
    WaitFor {
        id: String,
        event_object_id: String,
        reply: oneshot::Sender<WaitOutcome>,
    },
    CleanupWaiter {
        id: String,
        event_object_id: String,
        reply: oneshot::Sender<()>,
    },
}

struct Owner {
    entries: HashMap<String, ResourceTreeEntry>,
    waiters: HashMap<String, HashMap<String, oneshot::Sender<WaitOutcome>>>,
}

impl Owner {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            waiters: HashMap::new(),
        }
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = inbox.recv().await {
            self.handle(command);
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Put {
                id,
                tree,
                reference,
                filters,
                reply,
            } => {
                self.entries.insert(
                    id.clone(),
                    ResourceTreeEntry {
                        last_update: Utc::now(),
                        tree,
                        composition_reference: reference,
                        filters,
                    },
                );
                let _ = reply.send(());
                self.notify_waiters(&id);
            }

            Command::Replace {
                id,
                tree,
                reference,
                reply,
            } => {
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.last_update = Utc::now();
                    entry.tree = tree;
                    entry.composition_reference = reference;
                }
                let _ = reply.send(());
            }

            Command::Get { id, reply } => {
                let _ = reply.send(self.entries.get(&id).cloned());
            }

            Command::Delete { id, reply } => {
                self.entries.remove(&id);
                let _ = reply.send(());
            }

            Command::ListIds { reply } => {
                let _ = reply.send(self.entries.keys().cloned().collect());
            }

            Command::Contains { id, reply } => {
                let _ = reply.send(self.entries.contains_key(&id));
            }

            Command::QueueUpdate { id, op, reply } => {
                let result = match self.entries.get_mut(&id) {
                    Some(entry) => match op(entry) {
                        Ok(()) => {
                            entry.last_update = Utc::now();
                            Ok(())
                        }
                        Err(err) => Err(UpdateError::Failed(err)),
                    },
                    None => Err(UpdateError::NotFound(id.clone())),
                };
                let _ = reply.send(result);
            }

            Command::WaitFor {
                id,
                event_object_id,
                reply,
            } => {
                if let Some(entry) = self.entries.get(&id) {
                    let _ = reply.send(WaitOutcome::Ready(entry.clone()));
                    return;
                }
                tracing::warn!(
                    "composition not ready {}, setting up waiter {}",
                    id,
                    event_object_id
                );
                let waiters = self.waiters.entry(id.clone()).or_default();
                if let Some(previous) = waiters.remove(&event_object_id) {
                    tracing::warn!("sending discard to {} {}", id, event_object_id);
                    let _ = previous.send(WaitOutcome::Discarded);
                }
                waiters.insert(event_object_id, reply);
            }

            Command::CleanupWaiter {
                id,
                event_object_id,
                reply,
            } => {
                if let Some(waiters) = self.waiters.get_mut(&id) {
                    waiters.remove(&event_object_id);
                    if waiters.is_empty() {
                        self.waiters.remove(&id);
                    }
                }
                let _ = reply.send(());
            }
        }
    }

    fn notify_waiters(&mut self, id: &str) {
        let Some(waiters) = self.waiters.remove(id) else {
            return;
        };
        // Put has just inserted the entry, so the lookup cannot miss.
        let Some(entry) = self.entries.get(id) else {
            return;
        };
        tracing::info!("notifying event waiters for composition id {}", id);
        for (event_object_id, waiter) in waiters {
            tracing::info!("\tnotifying event waiter for object id {}", event_object_id);
            let _ = waiter.send(WaitOutcome::Ready(entry.clone()));
        }
    }
}

/// Handle to the cache owner task. Cheap to clone; every clone talks to the
/// same store.
#[derive(Clone)]
pub struct TreeCache {
    inbox: mpsc::UnboundedSender<Command>,
}

impl TreeCache {
    /// Spawn the owner task and return a handle to it. Must be called from
    /// within a tokio runtime.
    pub fn new() -> Self {
        let (inbox, rx) = mpsc::unbounded_channel();
        tokio::spawn(Owner::new().run(rx));
        Self { inbox }
    }

    /// Unconditionally store a freshly built tree and wake every waiter
    /// registered for this composition.
    pub async fn put(
        &self,
        tree: ResourceTree,
        composition_id: &str,
        reference: Reference,
        filters: Filters,
    ) {
        let (reply, rx) = oneshot::channel();
        let command = Command::Put {
            id: composition_id.to_string(),
            tree,
            reference,
            filters,
            reply,
        };
        if self.inbox.send(command).is_ok() {
            let _ = rx.await;
        }
    }

    /// Overwrite the tree of an existing entry. A no-op when the entry is
    /// absent; waiters are not notified.
    pub async fn replace(&self, composition_id: &str, tree: ResourceTree, reference: Reference) {
        let (reply, rx) = oneshot::channel();
        let command = Command::Replace {
            id: composition_id.to_string(),
            tree,
            reference,
            reply,
        };
        if self.inbox.send(command).is_ok() {
            let _ = rx.await;
        }
    }

    /// Snapshot read of an entry.
    pub async fn get(&self, composition_id: &str) -> Option<ResourceTreeEntry> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Get {
            id: composition_id.to_string(),
            reply,
        };
        if self.inbox.send(command).is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Snapshot read with the entry's exclude filters applied to its status
    /// nodes, rendered into their wire shape.
    pub async fn get_filtered(&self, composition_id: &str) -> Option<Vec<StatusNode>> {
        let entry = self.get(composition_id).await?;
        Some(filtered_status_nodes(&entry))
    }

    pub async fn delete(&self, composition_id: &str) {
        let (reply, rx) = oneshot::channel();
        let command = Command::Delete {
            id: composition_id.to_string(),
            reply,
        };
        if self.inbox.send(command).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn list_ids(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self.inbox.send(Command::ListIds { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn contains(&self, composition_id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let command = Command::Contains {
            id: composition_id.to_string(),
            reply,
        };
        if self.inbox.send(command).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Run an atomic mutation against an entry inside the owner task. Fails
    /// with [`UpdateError::NotFound`] when the entry is absent; on success
    /// the entry's last-update instant is refreshed.
    pub async fn queue_update(
        &self,
        composition_id: &str,
        op: UpdateOp,
    ) -> Result<(), UpdateError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::QueueUpdate {
            id: composition_id.to_string(),
            op,
            reply,
        };
        if self.inbox.send(command).is_err() {
            return Err(UpdateError::NotFound(composition_id.to_string()));
        }
        rx.await
            .unwrap_or_else(|_| Err(UpdateError::NotFound(composition_id.to_string())))
    }

    /// Return the entry immediately when present, otherwise register a
    /// waiter keyed by the event object id and block until the entry is
    /// published, the waiter is preempted by a newer one for the same
    /// object, or the timeout elapses (in which case the registration is
    /// cleaned up).
    pub async fn wait_for(
        &self,
        composition_id: &str,
        event_object_id: &str,
        timeout: Duration,
    ) -> WaitOutcome {
        let (reply, rx) = oneshot::channel();
        let command = Command::WaitFor {
            id: composition_id.to_string(),
            event_object_id: event_object_id.to_string(),
            reply,
        };
        if self.inbox.send(command).is_err() {
            return WaitOutcome::TimedOut;
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => WaitOutcome::TimedOut,
            Err(_) => {
                self.cleanup_waiter(composition_id, event_object_id).await;
                WaitOutcome::TimedOut
            }
        }
    }

    /// Remove a waiter registration. Idempotent.
    pub async fn cleanup_waiter(&self, composition_id: &str, event_object_id: &str) {
        let (reply, rx) = oneshot::channel();
        let command = Command::CleanupWaiter {
            id: composition_id.to_string(),
            event_object_id: event_object_id.to_string(),
            reply,
        };
        if self.inbox.send(command).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Apply an entry's exclude filters to its status nodes. Pure: produces a
/// fresh sequence and leaves the entry untouched.
pub fn filtered_status_nodes(entry: &ResourceTreeEntry) -> Vec<StatusNode> {
    let tree = &entry.tree;
    let mut nodes = Vec::with_capacity(tree.status_nodes.len());
    for index in 0..tree.status_nodes.len() {
        let reference = tree.status_reference(index).unwrap_or_else(|| {
            let status = &tree.status_nodes[index];
            Reference {
                api_version: status.version.clone(),
                kind: status.kind.clone(),
                name: status.name.clone(),
                namespace: status.namespace.clone(),
                ..Default::default()
            }
        });
        let excluded = entry
            .filters
            .exclude
            .iter()
            .any(|exclude| crate::filters::matches(exclude, &reference));
        if excluded {
            continue;
        }
        if let Some(rendered) = tree.render_status_node(index) {
            nodes.push(rendered);
        }
    }
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Exclude, ResourceNodeSpec, ResourceNodeStatus};

    fn sample_tree(id: &str) -> ResourceTree {
        ResourceTree {
            composition_id: id.to_string(),
            root_status: 0,
            spec_nodes: vec![ResourceNodeSpec {
                api_version: "resourcetrees.krateo.io/v1".to_string(),
                resource: "compositionreferences".to_string(),
                name: "root".to_string(),
                namespace: "demo".to_string(),
                parent_refs: Vec::new(),
            }],
            status_nodes: vec![ResourceNodeStatus {
                version: "resourcetrees.krateo.io/v1".to_string(),
                kind: "CompositionReference".to_string(),
                name: "root".to_string(),
                namespace: "demo".to_string(),
                ..Default::default()
            }],
        }
    }

    #[tokio::test]
    async fn test_put_get_contains_delete() {
        let cache = TreeCache::new();
        assert!(!cache.contains("u1").await);
        assert!(cache.get("u1").await.is_none());

        cache
            .put(sample_tree("u1"), "u1", Reference::default(), Filters::default())
            .await;
        assert!(cache.contains("u1").await);
        let entry = cache.get("u1").await.unwrap();
        assert_eq!(entry.tree.composition_id, "u1");

        cache.delete("u1").await;
        assert!(!cache.contains("u1").await);
    }

    #[tokio::test]
    async fn test_list_ids() {
        let cache = TreeCache::new();
        cache
            .put(sample_tree("a"), "a", Reference::default(), Filters::default())
            .await;
        cache
            .put(sample_tree("b"), "b", Reference::default(), Filters::default())
            .await;
        let mut ids = cache.list_ids().await;
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_queue_update_missing_entry_is_not_found() {
        let cache = TreeCache::new();
        let result = cache
            .queue_update("missing", Box::new(|_entry| Ok(())))
            .await;
        assert!(matches!(result, Err(UpdateError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_queue_update_mutates_and_refreshes_last_update() {
        let cache = TreeCache::new();
        cache
            .put(sample_tree("u1"), "u1", Reference::default(), Filters::default())
            .await;
        let before = cache.get("u1").await.unwrap().last_update;

        cache
            .queue_update(
                "u1",
                Box::new(|entry| {
                    entry.tree.status_nodes[0].kind = "Edited".to_string();
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let entry = cache.get("u1").await.unwrap();
        assert_eq!(entry.tree.status_nodes[0].kind, "Edited");
        assert!(entry.last_update >= before);
    }

    #[tokio::test]
    async fn test_queue_update_surfaces_op_error() {
        let cache = TreeCache::new();
        cache
            .put(sample_tree("u1"), "u1", Reference::default(), Filters::default())
            .await;
        let result = cache
            .queue_update("u1", Box::new(|_entry| anyhow::bail!("op failed")))
            .await;
        assert!(matches!(result, Err(UpdateError::Failed(_))));
    }

    #[tokio::test]
    async fn test_replace_is_noop_when_absent() {
        let cache = TreeCache::new();
        cache
            .replace("ghost", sample_tree("ghost"), Reference::default())
            .await;
        assert!(!cache.contains("ghost").await);
    }

    #[tokio::test]
    async fn test_filtered_status_nodes_applies_excludes() {
        let mut tree = sample_tree("u1");
        tree.spec_nodes.push(ResourceNodeSpec {
            api_version: "apps/v1".to_string(),
            resource: "deployments".to_string(),
            name: "web".to_string(),
            namespace: "demo".to_string(),
            parent_refs: Vec::new(),
        });
        tree.status_nodes.push(ResourceNodeStatus {
            version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: "web".to_string(),
            namespace: "demo".to_string(),
            parent_refs: vec![0],
            ..Default::default()
        });
        let entry = ResourceTreeEntry {
            last_update: Utc::now(),
            tree,
            composition_reference: Reference::default(),
            filters: Filters {
                exclude: vec![Exclude {
                    api_version: String::new(),
                    resource: "deployments".to_string(),
                    name: String::new(),
                }],
            },
        };

        let nodes = filtered_status_nodes(&entry);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].kind, "CompositionReference");
    }
}
