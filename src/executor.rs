use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::trace;

use crate::device::CommandQueue;
use crate::error::AttentionError;
use crate::tensor::ExecutionDomain;

/// A unit of pipeline work submitted to an executor.
pub type StageTask = Box<dyn FnOnce() -> Result<(), AttentionError> + Send + 'static>;

/// Dispatches pipeline stages into one of the two execution domains.
///
/// Stages submitted through one executor observe strict pipeline order:
/// the host executor runs each stage to completion before returning, the
/// device executor relies on its queue's in-order execution guarantee.
pub trait StageExecutor: Send + Sync {
    fn domain(&self) -> ExecutionDomain;

    /// Submits one stage. Host: runs it to completion (data parallelism
    /// happens inside the stage, on the injected pool). Device: enqueues and
    /// returns immediately.
    fn dispatch(&self, label: &'static str, task: StageTask) -> Result<(), AttentionError>;

    /// Blocks until all previously dispatched stages have executed.
    fn synchronize(&self) -> Result<(), AttentionError>;
}

/// Thread-pool backed executor for the host CPU domain.
///
/// The pool is an explicit dependency: multiple operator instances can share
/// one pool or run on separate pools, and tests can pin the thread count.
pub struct HostExecutor {
    pool: Arc<ThreadPool>,
}

impl HostExecutor {
    pub fn new(pool: Arc<ThreadPool>) -> Self {
        Self { pool }
    }

    pub fn with_threads(threads: usize) -> Result<Self, AttentionError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("attn-host-{i}"))
            .build()
            .map_err(|e| AttentionError::Scheduler(e.to_string()))?;
        Ok(Self { pool: Arc::new(pool) })
    }
}

impl StageExecutor for HostExecutor {
    fn domain(&self) -> ExecutionDomain {
        ExecutionDomain::Host
    }

    fn dispatch(&self, label: &'static str, task: StageTask) -> Result<(), AttentionError> {
        trace!(stage = label, domain = "host", "dispatching stage");
        self.pool.install(move || task())
    }

    fn synchronize(&self) -> Result<(), AttentionError> {
        // Host dispatch is synchronous; there is nothing outstanding.
        Ok(())
    }
}

/// Command-queue backed executor for the device domain.
///
/// Stage bodies execute on the queue's worker thread but partition their
/// iteration space on the injected pool, the same dependency-injection rule
/// the host executor follows.
pub struct DeviceExecutor {
    queue: CommandQueue,
    pool: Arc<ThreadPool>,
}

impl DeviceExecutor {
    pub fn new(queue: CommandQueue, pool: Arc<ThreadPool>) -> Self {
        Self { queue, pool }
    }

    pub fn with_threads(queue: CommandQueue, threads: usize) -> Result<Self, AttentionError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("attn-device-pool-{i}"))
            .build()
            .map_err(|e| AttentionError::Scheduler(e.to_string()))?;
        Ok(Self {
            queue,
            pool: Arc::new(pool),
        })
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }
}

impl StageExecutor for DeviceExecutor {
    fn domain(&self) -> ExecutionDomain {
        ExecutionDomain::Device
    }

    fn dispatch(&self, label: &'static str, task: StageTask) -> Result<(), AttentionError> {
        trace!(stage = label, domain = "device", "dispatching stage");
        let pool = Arc::clone(&self.pool);
        self.queue.enqueue(label, Box::new(move || pool.install(move || task())))
    }

    fn synchronize(&self) -> Result<(), AttentionError> {
        self.queue.finish()
    }
}
