//! Two-tier admission control
//!
//! The queue gate bounds the number of outstanding requests and never waits.
//! The worker gate bounds concurrent CPU-heavy work and waits for a slot
//! under the request's cancellation and deadline. Image requests and
//! administrative refreshes draw from the same worker gate.
//!
//! Permits are RAII guards: dropping one releases its slot exactly once, on
//! every exit path.

use imgate_common::{GatewayError, RequestContext};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Slot held in the queue gate. Holds nothing when the queue gate is disabled.
#[derive(Debug)]
pub struct QueuePermit {
    _permit: Option<OwnedSemaphorePermit>,
}

/// Slot held in the worker gate
#[derive(Debug)]
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone)]
pub struct AdmissionGate {
    queue: Option<Arc<Semaphore>>,
    workers: Arc<Semaphore>,
    worker_capacity: usize,
}

impl AdmissionGate {
    /// `queue_size` is the number of requests allowed to wait for one of the
    /// `workers` slots; 0 disables the queue gate entirely.
    pub fn new(workers: usize, queue_size: usize) -> Self {
        let workers = workers.max(1);
        let queue = (queue_size > 0).then(|| Arc::new(Semaphore::new(queue_size + workers)));
        Self {
            queue,
            workers: Arc::new(Semaphore::new(workers)),
            worker_capacity: workers,
        }
    }

    /// Take a queue slot without waiting. Saturation is a 429.
    pub fn try_acquire_queue(&self) -> Result<QueuePermit, GatewayError> {
        let Some(queue) = &self.queue else {
            return Ok(QueuePermit { _permit: None });
        };

        queue
            .clone()
            .try_acquire_owned()
            .map(|permit| QueuePermit {
                _permit: Some(permit),
            })
            .map_err(|_| GatewayError::too_many_requests())
    }

    /// Wait for a worker slot.
    ///
    /// Fails with a timeout when the deadline passes first and with a
    /// cancellation when the request goes away. A closed gate is a broken
    /// invariant.
    pub async fn acquire_worker(&self, ctx: &RequestContext) -> Result<WorkerPermit, GatewayError> {
        let workers = self.workers.clone();
        ctx.run(async move {
            workers
                .acquire_owned()
                .await
                .map(|permit| WorkerPermit { _permit: permit })
                .map_err(|_| GatewayError::internal("Worker gate is closed"))
        })
        .await
    }

    pub fn worker_capacity(&self) -> usize {
        self.worker_capacity
    }

    /// Worker slots currently free
    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Queue slots currently free, `None` when the queue gate is disabled
    pub fn available_queue(&self) -> Option<usize> {
        self.queue.as_ref().map(|q| q.available_permits())
    }
}
