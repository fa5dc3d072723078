//! Part upload worker pool
//!
//! Runs part uploads as tokio tasks with at most `concurrency` in flight.
//! A submission waits for a free slot before its task is spawned, so a
//! saturated pool slows the writer down instead of rejecting work.
//!
//! Every task resolves to a [`TaskOutcome`], which keeps a crashed task
//! apart from one cancelled by [`PartUploadPool::shutdown`].
//!
//! # Example
//!
//! ```no_run
//! use s3_upload_stream::upload::pool::{PartUploadPool, TaskOutcome};
//!
//! # async fn example() {
//! let pool = PartUploadPool::new(4);
//! let handle = pool.submit(1, async { 42 }).await;
//!
//! match handle.resolve().await {
//!     TaskOutcome::Completed(value) => assert_eq!(value, 42),
//!     other => panic!("unexpected outcome: {:?}", other),
//! }
//! # }
//! ```

use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};

/// Terminal state of a pool task
#[derive(Debug)]
pub enum TaskOutcome<T> {
    /// The task ran to completion; carries its output
    Completed(T),
    /// The task panicked; carries the panic message
    Failed(String),
    /// The task was aborted by `shutdown`, or never started because of it
    CancelledForShutdown,
}

/// Handle to one submitted part upload
#[derive(Debug)]
pub struct PendingUpload<T> {
    part_number: u32,
    task: Option<JoinHandle<T>>,
}

impl<T> PendingUpload<T> {
    pub fn part_number(&self) -> u32 {
        self.part_number
    }

    /// Whether `resolve` would return without waiting
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    /// Wait for the task to finish
    pub async fn resolve(self) -> TaskOutcome<T> {
        let Some(task) = self.task else {
            return TaskOutcome::CancelledForShutdown;
        };

        match task.await {
            Ok(value) => TaskOutcome::Completed(value),
            Err(e) if e.is_cancelled() => {
                tracing::warn!(
                    part_number = self.part_number,
                    "Part upload task cancelled for shutdown"
                );
                TaskOutcome::CancelledForShutdown
            }
            Err(e) => {
                let message = panic_message(e.into_panic());
                tracing::error!(
                    part_number = self.part_number,
                    error = %message,
                    "Part upload task crashed"
                );
                TaskOutcome::Failed(message)
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Bounded-concurrency executor for part uploads
///
/// May be shared between streams through an `Arc`; the bound then applies
/// to all of them together.
pub struct PartUploadPool {
    permits: Arc<Semaphore>,
    concurrency: usize,
    running: Mutex<Vec<AbortHandle>>,
}

impl PartUploadPool {
    /// Create a pool allowing `concurrency` tasks at once (minimum 1)
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            running: Mutex::new(Vec::new()),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Slots free right now
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn is_shutdown(&self) -> bool {
        self.permits.is_closed()
    }

    /// Submit a task, waiting for a free slot
    ///
    /// After shutdown the returned handle resolves to
    /// [`TaskOutcome::CancelledForShutdown`] without running the task.
    pub async fn submit<F, T>(&self, part_number: u32, task: F) -> PendingUpload<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(part_number, "Pool is shut down, part not submitted");
                return PendingUpload {
                    part_number,
                    task: None,
                };
            }
        };

        let handle = tokio::spawn(async move {
            let _permit = permit;
            task.await
        });

        let mut running = self.running.lock();
        running.retain(|h| !h.is_finished());
        running.push(handle.abort_handle());

        PendingUpload {
            part_number,
            task: Some(handle),
        }
    }

    /// Refuse new work and cancel running tasks
    pub fn shutdown(&self) {
        self.permits.close();
        let running: Vec<AbortHandle> = self.running.lock().drain(..).collect();
        tracing::info!(cancelled = running.len(), "Shutting down part upload pool");
        for handle in running {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_completed_outcome() {
        let pool = PartUploadPool::new(2);
        let handle = pool.submit(7, async { "etag" }).await;
        assert_eq!(handle.part_number(), 7);
        assert!(matches!(handle.resolve().await, TaskOutcome::Completed("etag")));
    }

    #[tokio::test]
    async fn test_is_finished_tracks_task() {
        let pool = PartUploadPool::new(1);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = pool
            .submit(1, async move {
                let _ = rx.await;
            })
            .await;
        assert!(!handle.is_finished());

        tx.send(()).unwrap();
        for _ in 0..100 {
            if handle.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(handle.is_finished());
        assert!(matches!(handle.resolve().await, TaskOutcome::Completed(())));
    }

    #[tokio::test]
    async fn test_panic_becomes_failed_outcome() {
        let pool = PartUploadPool::new(1);
        let handle = pool
            .submit(1, async {
                panic!("boom");
            })
            .await;

        match handle.resolve().await {
            TaskOutcome::<()>::Failed(message) => assert_eq!(message, "boom"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = PartUploadPool::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for part_number in 1..=6 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(
                pool.submit(part_number, async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .await,
            );
        }

        for handle in handles {
            assert!(matches!(handle.resolve().await, TaskOutcome::Completed(())));
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_and_refuses_new() {
        let pool = PartUploadPool::new(1);
        let running = pool
            .submit(1, async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .await;

        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(matches!(
            running.resolve().await,
            TaskOutcome::CancelledForShutdown
        ));

        let refused = pool.submit(2, async {}).await;
        assert!(matches!(
            refused.resolve().await,
            TaskOutcome::CancelledForShutdown
        ));
    }

    #[test]
    fn test_zero_concurrency_is_raised_to_one() {
        assert_eq!(PartUploadPool::new(0).concurrency(), 1);
    }
}
