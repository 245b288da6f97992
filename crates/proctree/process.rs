use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{ProcessError, TeardownError};

/// Boxed teardown action. Runs at most once, between the closing and closed
/// edges; its result is cached for the process's lifetime.
type TeardownFn =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<(), TeardownError>> + Send + 'static>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

static BACKGROUND: LazyLock<Process> = LazyLock::new(|| Process {
    inner: Arc::new(Inner::new(true, None)),
});

/// Spawn `work` under the background process: a detached unit of work whose
/// returned handle closes once the work (and anything it spawned) finishes.
pub fn spawn<F, Fut>(work: F) -> Process
where
    F: FnOnce(Process) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Process::background().go(work)
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum Phase {
    Running,
    Closing,
    /// Children drained, teardown executing. Externally still "closing":
    /// once this is reached, new registrations are no longer awaited.
    Teardown,
    Closed,
}

struct ChildEntry {
    proc: Process,
    /// Whether closing the parent also closes this child. `wait_for`
    /// registrations are awaited but not cascaded.
    cascade: bool,
}

struct State {
    phase: Phase,
    children: HashMap<u64, ChildEntry>,
    teardown: Option<TeardownFn>,
    result: Option<Result<(), ProcessError>>,
    parent: Option<Weak<Inner>>,
}

struct Inner {
    id: u64,
    background: bool,
    closing: CancellationToken,
    closed: CancellationToken,
    /// Wakes the shutdown task when the child registry empties. Single
    /// waiter, so `notify_one`'s stored permit cannot be lost.
    children_drained: Notify,
    state: Mutex<State>,
}

impl Inner {
    fn new(background: bool, teardown: Option<TeardownFn>) -> Self {
        Inner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            background,
            closing: CancellationToken::new(),
            closed: CancellationToken::new(),
            children_drained: Notify::new(),
            state: Mutex::new(State {
                phase: Phase::Running,
                children: HashMap::new(),
                teardown,
                result: None,
                parent: None,
            }),
        }
    }

    /// Short critical sections only; the guard is never held across an
    /// await point, and state mutations cannot panic mid-update.
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deregister(&self, child_id: u64) {
        let mut st = self.state();
        st.children.remove(&child_id);
        if st.children.is_empty() {
            self.children_drained.notify_one();
        }
    }
}

/// A node in a process tree: a concurrent unit of work with two observable
/// lifecycle edges and deterministic two-phase shutdown.
///
/// Closing a process fires its closing edge, cascades close to its children,
/// waits for every child to close, runs the teardown action exactly once,
/// then fires the closed edge. Handles are cheap to clone and every
/// operation may be invoked concurrently from any number of tasks.
///
/// Operations that spawn work or start shutdown require an ambient tokio
/// runtime.
#[derive(Clone)]
pub struct Process {
    inner: Arc<Inner>,
}

impl Process {
    /// The shared root process. It never closes: its edges never fire and
    /// `close` on it is a no-op. Children attached to it are unregistered,
    /// so it retains no references to them.
    pub fn background() -> Process {
        BACKGROUND.clone()
    }

    /// New process attached to `parent`. If the parent is already shutting
    /// down the child is created closing and winds down immediately.
    pub fn with_parent(parent: &Process) -> Process {
        let child = Process::new_unregistered(None);
        Process::register_under(parent, &child);
        child
    }

    /// New process under the background root with a teardown action.
    pub fn with_teardown<F, Fut>(teardown: F) -> Process
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TeardownError>> + Send + 'static,
    {
        Process::new_unregistered(Some(box_teardown(teardown)))
    }

    /// New process attached to `parent` with a teardown action.
    pub fn with_parent_and_teardown<F, Fut>(parent: &Process, teardown: F) -> Process
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TeardownError>> + Send + 'static,
    {
        let child = Process::new_unregistered(Some(box_teardown(teardown)));
        Process::register_under(parent, &child);
        child
    }

    fn new_unregistered(teardown: Option<TeardownFn>) -> Process {
        Process {
            inner: Arc::new(Inner::new(false, teardown)),
        }
    }

    /// Insert `child` into `parent`'s registry, serialized with the
    /// parent's shutdown check. A registration that lands before the drain
    /// commits is awaited by the parent; afterwards the child is closed
    /// immediately instead.
    fn register_under(parent: &Process, child: &Process) {
        if parent.inner.background {
            return;
        }
        child.inner.state().parent = Some(Arc::downgrade(&parent.inner));
        let close_now = {
            let mut st = parent.inner.state();
            match st.phase {
                Phase::Running => {
                    st.children.insert(
                        child.inner.id,
                        ChildEntry {
                            proc: child.clone(),
                            cascade: true,
                        },
                    );
                    false
                }
                Phase::Closing => {
                    st.children.insert(
                        child.inner.id,
                        ChildEntry {
                            proc: child.clone(),
                            cascade: true,
                        },
                    );
                    true
                }
                Phase::Teardown | Phase::Closed => true,
            }
        };
        if close_now {
            child.trigger_close();
        }
    }

    /// Wait for the closing edge: resolves once shutdown has started.
    /// Resolves immediately if it already has.
    pub async fn closing(&self) {
        self.inner.closing.cancelled().await;
    }

    /// Wait for the closed edge: resolves once shutdown has finished,
    /// teardown included.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.is_cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Token tied to the closing edge, for `select!` composition with
    /// non-process work. Cancelling the returned token does not close the
    /// process.
    pub fn closing_token(&self) -> CancellationToken {
        self.inner.closing.child_token()
    }

    /// Request shutdown and wait until it has finished. Idempotent: every
    /// concurrent caller shares the single shutdown execution and receives
    /// the same cached teardown result.
    pub async fn close(&self) -> Result<(), ProcessError> {
        if self.inner.background {
            return Ok(());
        }
        self.trigger_close();
        self.inner.closed.cancelled().await;
        self.teardown_result()
    }

    /// Wait until every currently registered child has closed, then close.
    /// Children that arrive while waiting are yielded to, but their closure
    /// is not awaited here; `close` itself still waits for them.
    pub async fn close_after_children(&self) -> Result<(), ProcessError> {
        if self.inner.background {
            return Ok(());
        }
        loop {
            let next = {
                let st = self.inner.state();
                st.children
                    .values()
                    .map(|entry| entry.proc.clone())
                    .find(|child| !child.is_closed())
            };
            match next {
                Some(child) => child.closed().await,
                None => break,
            }
        }
        self.close().await
    }

    /// Spawn `work` as a child of this process.
    ///
    /// The child is registered before the work starts, so a concurrent
    /// close waits for it. The returned handle closes once the work has
    /// returned and the work's own children have closed. The work receives
    /// its own handle and is expected to watch `closing` to wind down
    /// cooperatively; a panicking work unit counts as completed so the tree
    /// cannot wedge.
    pub fn go<F, Fut>(&self, work: F) -> Process
    where
        F: FnOnce(Process) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let child = Process::new_unregistered(None);
        // Pins the child open until the work returns, even if the child is
        // told to close first.
        let work_guard = Process::new_unregistered(None);
        child.wait_for(&work_guard);
        Process::register_under(self, &child);

        let handle = child.clone();
        tokio::spawn(async move {
            let proc = child.clone();
            if AssertUnwindSafe(async move { work(proc).await })
                .catch_unwind()
                .await
                .is_err()
            {
                debug!("process {} work unit panicked", child.inner.id);
            }
            let _ = work_guard.close().await;
            let _ = child.close_after_children().await;
        });
        handle
    }

    /// Make `other` a child of this process for shutdown purposes: closing
    /// this process closes `other`, and this process cannot close before
    /// `other` has.
    pub fn add_child(&self, other: &Process) {
        self.register_external(other, true);
    }

    /// Hold this process open until `other` has closed, without propagating
    /// close to it.
    pub fn wait_for(&self, other: &Process) {
        self.register_external(other, false);
    }

    fn register_external(&self, other: &Process, cascade: bool) {
        if self.inner.background || other.inner.background {
            // Background never closes; waiting on it would wedge the caller
            // forever and registering under it would leak the entry.
            return;
        }
        if Arc::ptr_eq(&self.inner, &other.inner) {
            // A process waiting on itself could never close.
            return;
        }
        let child_id = other.inner.id;
        let (inserted, close_now) = {
            let mut st = self.inner.state();
            match st.phase {
                Phase::Running => {
                    st.children.insert(
                        child_id,
                        ChildEntry {
                            proc: other.clone(),
                            cascade,
                        },
                    );
                    (true, false)
                }
                Phase::Closing => {
                    st.children.insert(
                        child_id,
                        ChildEntry {
                            proc: other.clone(),
                            cascade,
                        },
                    );
                    (true, cascade)
                }
                Phase::Teardown | Phase::Closed => (false, cascade),
            }
        };
        if inserted {
            // `other` knows nothing about this registration, so a watcher
            // deregisters it here once it closes.
            let registry = Arc::downgrade(&self.inner);
            let watched = other.clone();
            tokio::spawn(async move {
                watched.closed().await;
                if let Some(registry) = registry.upgrade() {
                    registry.deregister(child_id);
                }
            });
        }
        if close_now {
            other.trigger_close();
        }
    }

    /// Install the teardown action after construction.
    ///
    /// Panics if a teardown is already pending. If shutdown has already
    /// passed the teardown step, the action still runs (after the closed
    /// edge) and its result replaces the cached one.
    pub fn set_teardown<F, Fut>(&self, teardown: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TeardownError>> + Send + 'static,
    {
        if self.inner.background {
            return;
        }
        let mut tf = Some(box_teardown(teardown));
        let run_late = {
            let mut st = self.inner.state();
            assert!(st.teardown.is_none(), "teardown already set");
            if st.phase >= Phase::Teardown {
                tf.take()
            } else {
                st.teardown = tf.take();
                None
            }
        };
        if let Some(tf) = run_late {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                inner.closed.cancelled().await;
                let result = tf().await.map_err(ProcessError::teardown);
                if let Err(err) = &result {
                    debug!("process {} late teardown failed: {err}", inner.id);
                }
                inner.state().result = Some(result);
            });
        }
    }

    /// Non-blocking close request: the first call wins the Running →
    /// Closing transition, fires the closing edge and spawns the shutdown
    /// task. Later calls are no-ops.
    fn trigger_close(&self) {
        if self.inner.background {
            return;
        }
        {
            let mut st = self.inner.state();
            if st.phase != Phase::Running {
                return;
            }
            st.phase = Phase::Closing;
            // Cancelled under the lock so the phase and the edge are
            // observably atomic. Waking waiters only schedules their tasks;
            // nothing re-enters this state.
            self.inner.closing.cancel();
        }
        trace!("process {} closing", self.inner.id);
        tokio::spawn(run_shutdown(self.inner.clone()));
    }

    fn teardown_result(&self) -> Result<(), ProcessError> {
        self.inner.state().result.clone().unwrap_or(Ok(()))
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.inner.id)
            .field("phase", &self.inner.state().phase)
            .finish()
    }
}

/// Drives a process from Closing to Closed: cascade close to registered
/// children, wait for the registry to drain, run the teardown, fire the
/// closed edge, then detach from the parent.
async fn run_shutdown(inner: Arc<Inner>) {
    let cascade: Vec<Process> = {
        let st = inner.state();
        st.children
            .values()
            .filter(|entry| entry.cascade)
            .map(|entry| entry.proc.clone())
            .collect()
    };
    for child in cascade {
        child.trigger_close();
    }

    // Children registered after the snapshot were closed at registration
    // time; they still landed in the registry, so the drain observes them.
    loop {
        {
            let mut st = inner.state();
            if st.children.is_empty() {
                st.phase = Phase::Teardown;
                break;
            }
        }
        inner.children_drained.notified().await;
    }

    let teardown = inner.state().teardown.take();
    let result = match teardown {
        Some(tf) => tf().await.map_err(ProcessError::teardown),
        None => Ok(()),
    };
    if let Err(err) = &result {
        debug!("process {} teardown failed: {err}", inner.id);
    }

    {
        let mut st = inner.state();
        st.result = Some(result);
        st.phase = Phase::Closed;
        inner.closed.cancel();
    }
    trace!("process {} closed", inner.id);

    let parent = inner.state().parent.take();
    if let Some(parent) = parent.and_then(|weak| weak.upgrade()) {
        parent.deregister(inner.id);
    }
}

fn box_teardown<F, Fut>(teardown: F) -> TeardownFn
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), TeardownError>> + Send + 'static,
{
    Box::new(move || teardown().boxed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handles_share_state() {
        let p = Process::with_parent(&Process::background());
        let q = p.clone();
        assert!(!q.is_closing());
        p.close().await.expect("close failed");
        assert!(q.is_closed());
    }

    #[tokio::test]
    async fn background_is_a_singleton() {
        assert_eq!(
            Process::background().inner.id,
            Process::background().inner.id
        );
    }
}
