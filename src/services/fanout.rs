use crate::error::AppError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

/// Bounded pool for background fan-out work (presence announcements, queue
/// drains, per-recipient pushes).
///
/// Every task is fire-and-forget from the caller's point of view; failures are
/// logged and never reach the caller. [`shutdown`](Self::shutdown) stops new
/// work and waits for in-flight tasks.
#[derive(Clone)]
pub struct TaskGroup {
    inner: Arc<TaskGroupInner>,
}

struct TaskGroupInner {
    permits: Arc<Semaphore>,
    in_flight: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
}

impl TaskGroup {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            inner: Arc::new(TaskGroupInner {
                permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Run `fut` in the background. Returns false if the group is shut down.
    pub fn spawn<F>(&self, name: &'static str, fut: F) -> bool
    where
        F: Future<Output = Result<(), AppError>> + Send + 'static,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            tracing::debug!(task = name, "task group closed, dropping task");
            return false;
        }

        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        let in_flight = InFlight(self.inner.clone());
        tokio::spawn(async move {
            match in_flight.0.permits.clone().acquire_owned().await {
                Ok(_permit) => {
                    if let Err(e) = fut.await {
                        tracing::warn!(task = name, error = %e, "background task failed");
                    }
                }
                Err(e) => {
                    tracing::error!(task = name, error = %e, "failed to acquire task permit");
                }
            }
        });
        true
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Wait until no task is running. Tasks spawned while waiting are waited
    /// for too.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Refuse new tasks and wait up to `grace` for in-flight ones.
    ///
    /// Returns true if everything finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.closed.store(true, Ordering::Release);
        match tokio::time::timeout(grace, self.wait_idle()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    in_flight = self.in_flight(),
                    "background tasks still running after shutdown grace period"
                );
                false
            }
        }
    }
}

/// Counts a task as in flight until it completes or its runtime drops it.
struct InFlight(Arc<TaskGroupInner>);

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}
