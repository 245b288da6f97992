//! Bounded-concurrency spawning: a process whose work units are admitted by
//! a fixed pool of permits.

use std::future::Future;
use std::sync::Arc;

use proctree::Process;
use tokio::sync::Semaphore;

/// Wraps a child process and admits `go` work units only while a permit is
/// free, bounding how many run at once.
pub struct RateLimiter {
    proc: Process,
    permits: Arc<Semaphore>,
}

impl RateLimiter {
    /// A limiter parented to `parent`, admitting at most `limit` concurrent
    /// work units.
    pub fn new(parent: &Process, limit: usize) -> Self {
        RateLimiter {
            proc: Process::with_parent(parent),
            permits: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Spawn `work` once a permit is free, holding the permit until the
    /// work returns. Blocks while `limit` units are already running.
    pub async fn limited_go<F, Fut>(&self, work: F) -> Process
    where
        F: FnOnce(Process) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("limiter semaphore is never closed");
        self.proc.go(move |proc| async move {
            let _permit = permit;
            work(proc).await;
        })
    }

    /// The limiter's own process; close it to close every admitted unit.
    pub fn process(&self) -> &Process {
        &self.proc
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrency_stays_under_the_limit() {
        let root = Process::with_parent(&Process::background());
        let limiter = RateLimiter::new(&root, 2);

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut units = Vec::new();
        for _ in 0..4 {
            let running = running.clone();
            let peak = peak.clone();
            let unit = limiter
                .limited_go(move |_proc| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            units.push(unit);
        }

        for unit in &units {
            timeout(Duration::from_secs(2), unit.closed())
                .await
                .expect("work unit never finished");
        }
        assert!(peak.load(Ordering::SeqCst) <= 2, "limit exceeded");
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn closing_the_limiter_closes_admitted_units() {
        let root = Process::with_parent(&Process::background());
        let limiter = RateLimiter::new(&root, 1);

        let unit = limiter
            .limited_go(|proc| async move {
                proc.closing().await;
            })
            .await;

        limiter.process().close().await.unwrap();
        assert!(unit.is_closed());
    }
}
