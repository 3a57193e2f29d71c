use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::trace;

use crate::error::AttentionError;
use crate::executor::StageTask;

enum Command {
    Run { label: &'static str, job: StageTask },
    Fence(Arc<Fence>),
}

struct Fence {
    done: Mutex<bool>,
    cvar: Condvar,
}

struct QueueState {
    error: Mutex<Option<AttentionError>>,
}

struct QueueInner {
    tx: Mutex<Option<Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
    state: Arc<QueueState>,
}

/// An in-order command queue modeling the accelerator execution domain.
///
/// `enqueue` returns immediately; submitted work executes on a dedicated
/// worker thread in submission order. `finish` is the explicit
/// synchronization point: it blocks until every previously enqueued job has
/// executed and surfaces the first job error, after which the queue skips any
/// remaining work.
#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<QueueInner>,
}

impl CommandQueue {
    pub fn new() -> Result<Self, AttentionError> {
        let (tx, rx) = channel::<Command>();
        let state = Arc::new(QueueState {
            error: Mutex::new(None),
        });
        let worker_state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name("attn-device-queue".into())
            .spawn(move || {
                for cmd in rx {
                    match cmd {
                        Command::Run { label, job } => {
                            let poisoned = worker_state
                                .error
                                .lock()
                                .map(|e| e.is_some())
                                .unwrap_or(true);
                            if poisoned {
                                continue;
                            }
                            trace!(stage = label, "device queue executing");
                            if let Err(err) = job() {
                                if let Ok(mut slot) = worker_state.error.lock() {
                                    *slot = Some(err);
                                }
                            }
                        }
                        Command::Fence(fence) => {
                            if let Ok(mut done) = fence.done.lock() {
                                *done = true;
                            }
                            fence.cvar.notify_all();
                        }
                    }
                }
            })
            .map_err(|e| AttentionError::Scheduler(e.to_string()))?;
        let worker_id = handle.thread().id();
        Ok(Self {
            inner: Arc::new(QueueInner {
                tx: Mutex::new(Some(tx)),
                worker: Mutex::new(Some(handle)),
                worker_id,
                state,
            }),
        })
    }

    fn send(&self, cmd: Command) -> Result<(), AttentionError> {
        let guard = self.inner.tx.lock().map_err(|_| AttentionError::QueueShutDown)?;
        let tx = guard.as_ref().ok_or(AttentionError::QueueShutDown)?;
        tx.send(cmd).map_err(|_| AttentionError::QueueShutDown)
    }

    /// Submits a job; returns as soon as it is enqueued.
    pub fn enqueue(&self, label: &'static str, job: StageTask) -> Result<(), AttentionError> {
        trace!(stage = label, "device queue enqueue");
        self.send(Command::Run { label, job })
    }

    /// Blocks until all previously enqueued work has executed.
    pub fn finish(&self) -> Result<(), AttentionError> {
        let fence = Arc::new(Fence {
            done: Mutex::new(false),
            cvar: Condvar::new(),
        });
        self.send(Command::Fence(Arc::clone(&fence)))?;
        let mut done = fence.done.lock().map_err(|_| AttentionError::QueueShutDown)?;
        while !*done {
            done = fence.cvar.wait(done).map_err(|_| AttentionError::QueueShutDown)?;
        }
        let error = self
            .inner
            .state
            .error
            .lock()
            .map_err(|_| AttentionError::QueueShutDown)?
            .clone();
        match error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            // A job holding the last queue handle would otherwise join its
            // own thread.
            if thread::current().id() != self.worker_id {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod command_queue_test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::CommandQueue;
    use crate::error::AttentionError;

    #[test]
    fn executes_in_submission_order() -> Result<(), AttentionError> {
        let queue = CommandQueue::new()?;
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..16usize {
            let log = Arc::clone(&log);
            queue.enqueue(
                "order_probe",
                Box::new(move || {
                    log.lock().expect("log lock").push(i);
                    Ok(())
                }),
            )?;
        }
        queue.finish()?;
        let observed = log.lock().expect("log lock").clone();
        assert_eq!(observed, (0..16).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn finish_surfaces_job_errors_and_poisons_queue() -> Result<(), AttentionError> {
        let queue = CommandQueue::new()?;
        let ran_after_failure = Arc::new(AtomicUsize::new(0));
        queue.enqueue(
            "failing_job",
            Box::new(|| Err(AttentionError::InvalidOperation("boom".into()))),
        )?;
        let counter = Arc::clone(&ran_after_failure);
        queue.enqueue(
            "skipped_job",
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )?;
        assert!(queue.finish().is_err());
        assert_eq!(ran_after_failure.load(Ordering::SeqCst), 0);
        Ok(())
    }
}
