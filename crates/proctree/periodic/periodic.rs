//! Periodic child processes: run a unit of work on a schedule until the
//! process is told to close.
//!
//! Both helpers spawn through [`Process::go`], so the returned handles
//! behave like any other child: counted by the parent, cascaded on close
//! and awaited before the parent can finish closing.

use std::future::Future;
use std::time::Duration;

use proctree::Process;
use tokio::time::{MissedTickBehavior, interval, sleep};

/// Spawn a child of `parent` that waits `period`, runs `work`, and repeats.
///
/// The period is measured between completions, so a slow `work` stretches
/// the schedule. Stops as soon as the child starts closing; a `work` call
/// already in flight is allowed to finish and should watch its handle's
/// `closing` edge if it wants to bail out sooner.
pub fn every<F, Fut>(parent: &Process, period: Duration, mut work: F) -> Process
where
    F: FnMut(Process) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    parent.go(move |proc| async move {
        loop {
            tokio::select! {
                _ = proc.closing() => break,
                _ = sleep(period) => {}
            }
            work(proc.clone()).await;
        }
    })
}

/// Spawn a child of `parent` that runs `work` on a fixed `period` cadence.
///
/// Unlike [`every`], the schedule does not drift with the work's duration.
/// Ticks that fire while `work` is still running are delayed, not stacked.
pub fn tick<F, Fut>(parent: &Process, period: Duration, mut work: F) -> Process
where
    F: FnMut(Process) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    parent.go(move |proc| async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval resolves immediately; consume
        // it so the first run happens a full period after spawn.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = proc.closing() => break,
                _ = ticker.tick() => {}
            }
            work(proc.clone()).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::timeout;

    use super::*;

    async fn wait_for_count(counter: &Arc<AtomicUsize>, at_least: usize) {
        timeout(Duration::from_secs(2), async {
            while counter.load(Ordering::SeqCst) < at_least {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("periodic work never reached the expected count");
    }

    #[tokio::test]
    async fn every_repeats_until_closed() {
        let parent = Process::with_parent(&Process::background());
        let runs = Arc::new(AtomicUsize::new(0));

        let counted = runs.clone();
        let ticker = every(&parent, Duration::from_millis(10), move |_proc| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
            }
        });

        wait_for_count(&runs, 3).await;
        ticker.close().await.unwrap();

        let settled = runs.load(Ordering::SeqCst);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), settled, "work ran after close");
    }

    #[tokio::test]
    async fn tick_repeats_until_parent_closes() {
        let parent = Process::with_parent(&Process::background());
        let runs = Arc::new(AtomicUsize::new(0));

        let counted = runs.clone();
        tick(&parent, Duration::from_millis(10), move |_proc| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
            }
        });

        wait_for_count(&runs, 3).await;
        parent.close().await.unwrap();

        let settled = runs.load(Ordering::SeqCst);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), settled, "work ran after close");
    }
}
