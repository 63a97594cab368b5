//! Bounded concurrent execution of jobs.
//!
//! All jobs of a request share one counting semaphore sized to the
//! concurrency ceiling. Jobs beyond the ceiling wait for a permit. Results
//! come back in submission order no matter which job finishes first.
//!
//! Jobs are polled from the caller's task rather than spawned, so dropping
//! the future returned by [`BoundedExecutor::run_all`] drops every in-flight
//! job with it. The request cancellation path relies on this.

use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Runs jobs under a global concurrency ceiling.
#[derive(Debug)]
pub struct BoundedExecutor {
    ceiling: usize,
    semaphore: Arc<Semaphore>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl BoundedExecutor {
    /// A ceiling of 0 is treated as 1.
    pub fn new(ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            ceiling,
            semaphore: Arc::new(Semaphore::new(ceiling)),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Highest number of jobs that held a permit at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    /// Run `f` over every job and return the outputs in submission order.
    pub async fn run_all<J, F, Fut, R>(&self, jobs: Vec<J>, f: F) -> Vec<R>
    where
        F: Fn(J) -> Fut,
        Fut: Future<Output = R>,
    {
        tracing::info!(
            "Scheduling {} jobs ({} concurrent)",
            jobs.len(),
            self.ceiling
        );

        let tasks = jobs.into_iter().map(|job| {
            let semaphore = self.semaphore.clone();
            let work = f(job);
            async move {
                // The semaphore is never closed, so acquire cannot fail.
                let _permit = semaphore.acquire_owned().await.ok();
                let running = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
                self.peak_in_flight.fetch_max(running, Ordering::Relaxed);

                let output = work.await;

                self.in_flight.fetch_sub(1, Ordering::Relaxed);
                output
            }
        });

        join_all(tasks).await
    }
}
