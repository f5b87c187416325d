//! Job dispatcher
//!
//! Bounded FIFO of build jobs feeding a small pool of workers. Workers do
//! the blocking cluster I/O of tree construction; the queue is large enough
//! that enqueues rarely block. A worker failure is logged and the
//! regulator released; the worker itself keeps running. Closing the queue
//! drains and stops the pool.

pub mod regulator;

pub use regulator::{BuildState, Regulator};

use std::sync::Arc;

use anyhow::{Context, Result};
use kube::Client;
use kube::core::DynamicObject;
use tokio::sync::{Mutex, mpsc};

use crate::cache::TreeCache;
use crate::models::Reference;
use crate::tree;

/// Number of build workers.
pub const WORKER_COUNT: usize = 10;
/// Capacity of the job queue.
pub const QUEUE_CAPACITY: usize = 1000;

/// One admitted build request.
pub struct BuildJob {
    pub composition: DynamicObject,
    pub reference: Reference,
    pub composition_id: String,
}

/// Sending half of the job queue. Cloneable; the workers share the
/// receiving half.
#[derive(Clone)]
pub struct Dispatcher {
    queue: mpsc::Sender<BuildJob>,
}

impl Dispatcher {
    /// Spawn the worker pool with default sizing.
    pub fn spawn(client: Client, cache: TreeCache, regulator: Arc<Regulator>) -> Self {
        Self::spawn_with(client, cache, regulator, WORKER_COUNT, QUEUE_CAPACITY)
    }

    pub fn spawn_with(
        client: Client,
        cache: TreeCache,
        regulator: Arc<Regulator>,
        workers: usize,
        capacity: usize,
    ) -> Self {
        let (queue, jobs) = mpsc::channel(capacity);
        let jobs = Arc::new(Mutex::new(jobs));
        for worker in 0..workers {
            tokio::spawn(worker_loop(
                worker,
                jobs.clone(),
                client.clone(),
                cache.clone(),
                regulator.clone(),
            ));
        }
        Self { queue }
    }

    /// Queue a build job. The caller must already hold admission for the
    /// composition through the regulator.
    pub async fn enqueue(&self, job: BuildJob) -> Result<()> {
        let composition_id = job.composition_id.clone();
        self.queue
            .send(job)
            .await
            .ok()
            .with_context(|| format!("job queue closed, dropping build for {}", composition_id))
    }
}

async fn worker_loop(
    worker: usize,
    jobs: Arc<Mutex<mpsc::Receiver<BuildJob>>>,
    client: Client,
    cache: TreeCache,
    regulator: Arc<Regulator>,
) {
    loop {
        let job = { jobs.lock().await.recv().await };
        let Some(job) = job else {
            tracing::debug!("worker {} stopping, job queue closed", worker);
            break;
        };

        regulator.mark_busy(&job.composition_id);
        tracing::info!(
            "worker {} building resource tree for composition {}",
            worker,
            job.composition_id
        );
        if let Err(err) = tree::build(&client, &cache, &job.composition, &job.reference).await {
            tracing::error!(
                "worker {}: resource tree build failed for composition {}: {:#}",
                worker,
                job.composition_id,
                err
            );
        }
        regulator.release(&job.composition_id);
    }
}
