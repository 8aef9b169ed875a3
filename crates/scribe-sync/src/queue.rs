//! Concurrency-bounded FIFO queue for remote store calls.
//!
//! Deep recursive syncs can fan out into many listing and content fetches at
//! once; remote backends rate-limit that. The queue caps in-flight calls and
//! inserts a fixed delay after each completed task before draining further.
//!
//! Guarantees: at most `limit` tasks run concurrently; submission order is
//! start order (completion order is not); a failing task fails only its own
//! submitter and never wedges the queue.

use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queued task was dropped before completing")]
    TaskDropped,
}

pub type Result<T> = std::result::Result<T, QueueError>;

type Job = BoxFuture<'static, ()>;

struct State {
    pending: VecDeque<Job>,
    active: usize,
}

struct Inner {
    limit: usize,
    delay: Duration,
    state: Mutex<State>,
}

impl Inner {
    /// Start pending jobs while slots are free. Each finished job holds its
    /// slot through the inter-task delay, then releases it and drains again.
    fn drain(inner: Arc<Inner>) {
        loop {
            let job = {
                let mut state = inner.state.lock().unwrap();
                if state.active >= inner.limit {
                    return;
                }
                match state.pending.pop_front() {
                    Some(job) => {
                        state.active += 1;
                        job
                    }
                    None => return,
                }
            };

            let slot = Arc::clone(&inner);
            tokio::spawn(async move {
                job.await;
                tokio::time::sleep(slot.delay).await;
                slot.state.lock().unwrap().active -= 1;
                Inner::drain(slot);
            });
        }
    }
}

/// Bounded request queue. Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<Inner>,
}

impl RequestQueue {
    pub fn new(limit: usize, delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                limit: limit.max(1),
                delay,
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    active: 0,
                }),
            }),
        }
    }

    /// Enqueue a task. The returned future resolves with the task's output
    /// once a slot was free and the task ran.
    pub fn submit<T, F>(&self, task: F) -> impl Future<Output = Result<T>> + Send
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let output = task.await;
            // Submitter may have gone away; that is its problem, not ours.
            let _ = tx.send(output);
        });

        self.inner.state.lock().unwrap().pending.push_back(job);
        Inner::drain(Arc::clone(&self.inner));

        async move { rx.await.map_err(|_| QueueError::TaskDropped) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_tasks_complete_with_results() {
        let queue = RequestQueue::new(3, Duration::from_millis(1));
        let fut_a = queue.submit(async { 1 + 1 });
        let fut_b = queue.submit(async { "ok" });
        assert_eq!(fut_a.await.unwrap(), 2);
        assert_eq!(fut_b.await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let limit = 3;
        let queue = RequestQueue::new(limit, Duration::from_millis(1));
        let current = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let current = Arc::clone(&current);
            let high_water = Arc::clone(&high_water);
            handles.push(queue.submit(async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                high_water.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(high_water.load(Ordering::SeqCst) <= limit);
        assert!(high_water.load(Ordering::SeqCst) >= 2, "should actually overlap");
    }

    #[tokio::test]
    async fn test_start_order_is_submission_order() {
        let queue = RequestQueue::new(1, Duration::from_millis(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let order = Arc::clone(&order);
            handles.push(queue.submit(async move {
                order.lock().unwrap().push(i);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failing_task_does_not_block_the_queue() {
        let queue = RequestQueue::new(1, Duration::from_millis(1));

        let failing = queue.submit(async { Err::<(), String>("boom".into()) });
        let following = queue.submit(async { Ok::<i32, String>(7) });

        assert_eq!(failing.await.unwrap(), Err("boom".into()));
        assert_eq!(following.await.unwrap(), Ok(7));
    }

    #[tokio::test]
    async fn test_dropped_submitter_does_not_wedge_draining() {
        let queue = RequestQueue::new(1, Duration::from_millis(1));

        let abandoned = queue.submit(async { 42 });
        drop(abandoned);

        let next = queue.submit(async { 7 });
        assert_eq!(next.await.unwrap(), 7);
    }
}
