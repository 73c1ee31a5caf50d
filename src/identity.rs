//! "Who is the current caller" abstraction, plus the per-caller storage the pool
//! pins requests into.
//!
//! Grounded on `pymongo/pool.py`'s `_ident` (a `thread_util.Ident` wrapping either
//! `threading.current_thread` or the active greenlet) and its `on_thread_died`
//! weakref-callback pattern: the callback must run on caller death even if the
//! caller never called `end_request`, and it must not keep the pool alive.

use std::{
    cell::RefCell,
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::socket::SocketHandle;

/// An opaque, comparable identity for "the current caller" (thread or task).
pub(crate) type Identity = u64;

/// A callback run when a caller terminates while still holding pinned state.
/// Receives whatever [`PinState`] the caller's slot held at the moment of
/// death, so the pool can return or discard a bound socket without racing the
/// slot's own teardown.
pub(crate) type DeathCallback = Box<dyn FnOnce(PinState) + Send>;

/// The state pinned to one caller inside one pool: its reentrant request depth
/// and, once a socket has been chosen, the socket itself.
#[derive(Debug, Default)]
pub(crate) enum PinState {
    /// Not in a request.
    #[default]
    Outside,
    /// In a request, no socket chosen yet.
    Pending,
    /// A request with a socket pinned to it.
    Bound(SocketHandle),
}

struct CallerSlot {
    depth: u32,
    pin: PinState,
    callback: Option<DeathCallback>,
}

impl CallerSlot {
    fn new() -> Self {
        Self {
            depth: 0,
            pin: PinState::Outside,
            callback: None,
        }
    }
}

/// Invokes any still-registered death callback when the owning thread or task
/// local storage is torn down — this is what makes caller death (without a
/// matching `end_request`) observable without polling.
impl Drop for CallerSlot {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(std::mem::take(&mut self.pin));
        }
    }
}

/// Reports identity for the current caller and arranges for a callback to run when
/// that caller terminates, per pool.
///
/// Every entry point is keyed internally by a `provider_id` unique to the
/// `IdentityProvider` instance, so two distinct pools (each owning their own
/// provider) never share caller-local state even though the underlying storage
/// (a thread-local or task-local map) is process-wide.
pub(crate) trait IdentityProvider: Send + Sync + fmt::Debug {
    /// An opaque identity for the current caller.
    fn current(&self) -> Identity;

    /// Registers `callback` to run when the current caller terminates. A second
    /// call while already watching is a no-op.
    fn watch(&self, callback: DeathCallback);

    /// Whether the current caller already has a registered death callback.
    fn is_watching(&self) -> bool;

    /// Cancels any registered death callback for the current caller, without
    /// running it.
    fn unwatch(&self);

    /// Increments the current caller's request-nesting depth and returns the new
    /// value.
    fn inc_request(&self) -> u32;

    /// Decrements the current caller's request-nesting depth (floored at 0) and
    /// returns the new value.
    fn dec_request(&self) -> u32;

    /// The current caller's request-nesting depth.
    fn request_depth(&self) -> u32;

    /// Removes and returns the current caller's pin state, leaving `Outside`
    /// behind.
    fn take_pin(&self) -> PinState;

    /// Installs a new pin state for the current caller.
    fn put_pin(&self, state: PinState);
}

static NEXT_PROVIDER_ID: AtomicU64 = AtomicU64::new(1);

fn next_provider_id() -> u64 {
    NEXT_PROVIDER_ID.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Thread-based identity.
// ---------------------------------------------------------------------------

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_IDENTITY: Identity = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    static THREAD_SLOTS: RefCell<HashMap<u64, CallerSlot>> = RefCell::new(HashMap::new());
}

/// Identifies callers by OS thread, pinning requests via `thread_local!` storage.
///
/// Termination is detected by the `THREAD_SLOTS` destructor, which tokio and the
/// standard library both guarantee runs on thread exit, including after a panic
/// unwinds past the thread's entry point.
#[derive(Debug)]
pub(crate) struct ThreadIdentityProvider {
    provider_id: u64,
}

impl ThreadIdentityProvider {
    pub(crate) fn new() -> Self {
        Self {
            provider_id: next_provider_id(),
        }
    }

    fn with_slot<R>(&self, f: impl FnOnce(&mut CallerSlot) -> R) -> R {
        THREAD_SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            let slot = slots
                .entry(self.provider_id)
                .or_insert_with(CallerSlot::new);
            f(slot)
        })
    }
}

impl IdentityProvider for ThreadIdentityProvider {
    fn current(&self) -> Identity {
        THREAD_IDENTITY.with(|id| *id)
    }

    fn watch(&self, callback: DeathCallback) {
        self.with_slot(|slot| {
            if slot.callback.is_none() {
                slot.callback = Some(callback);
            }
        });
    }

    fn is_watching(&self) -> bool {
        self.with_slot(|slot| slot.callback.is_some())
    }

    fn unwatch(&self) {
        self.with_slot(|slot| {
            slot.callback = None;
        });
    }

    fn inc_request(&self) -> u32 {
        self.with_slot(|slot| {
            slot.depth += 1;
            slot.depth
        })
    }

    fn dec_request(&self) -> u32 {
        self.with_slot(|slot| {
            slot.depth = slot.depth.saturating_sub(1);
            slot.depth
        })
    }

    fn request_depth(&self) -> u32 {
        self.with_slot(|slot| slot.depth)
    }

    fn take_pin(&self) -> PinState {
        self.with_slot(|slot| std::mem::take(&mut slot.pin))
    }

    fn put_pin(&self, state: PinState) {
        self.with_slot(|slot| slot.pin = state);
    }
}

// ---------------------------------------------------------------------------
// Task-based identity.
// ---------------------------------------------------------------------------

#[cfg(feature = "task-identity")]
mod task {
    use std::future::Future;

    use super::*;

    static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

    tokio::task_local! {
        static TASK_IDENTITY: Identity;
        static TASK_SLOTS: RefCell<HashMap<u64, CallerSlot>>;
    }

    /// Identifies callers by `tokio` task, pinning requests via `tokio::task_local!`
    /// storage.
    ///
    /// Callers must run inside [`TaskIdentityProvider::scope`]; `current`,
    /// `watch`, and the pin operations fall back to a single shared identity
    /// outside of a scope rather than panicking, since a forgotten `scope` call
    /// is easy to make and should degrade to thread-granularity pinning instead
    /// of aborting the caller's task.
    #[derive(Debug)]
    pub(crate) struct TaskIdentityProvider {
        provider_id: u64,
    }

    impl TaskIdentityProvider {
        pub(crate) fn new() -> Self {
            Self {
                provider_id: next_provider_id(),
            }
        }

        /// Runs `fut` with a fresh task identity installed, so that
        /// `IdentityProvider` calls made from within it are scoped to this task.
        pub(crate) async fn scope<F: Future>(fut: F) -> F::Output {
            let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
            TASK_IDENTITY
                .scope(id, TASK_SLOTS.scope(RefCell::new(HashMap::new()), fut))
                .await
        }

        fn with_slot<R>(&self, f: impl FnOnce(&mut CallerSlot) -> R) -> R {
            let outcome = TASK_SLOTS.try_with(|slots| -> () {
                let _ = slots;
            });

            if outcome.is_ok() {
                TASK_SLOTS
                    .try_with(|slots| {
                        let mut slots = slots.borrow_mut();
                        let slot = slots
                            .entry(self.provider_id)
                            .or_insert_with(CallerSlot::new);
                        f(slot)
                    })
                    .expect("checked above")
            } else {
                // Outside of `scope`: thread-granularity fallback.
                THREAD_SLOTS.with(|slots| {
                    let mut slots = slots.borrow_mut();
                    let slot = slots
                        .entry(self.provider_id)
                        .or_insert_with(CallerSlot::new);
                    f(slot)
                })
            }
        }
    }

    impl IdentityProvider for TaskIdentityProvider {
        fn current(&self) -> Identity {
            TASK_IDENTITY
                .try_with(|id| *id)
                .unwrap_or_else(|_| THREAD_IDENTITY.with(|id| *id))
        }

        fn watch(&self, callback: DeathCallback) {
            self.with_slot(|slot| {
                if slot.callback.is_none() {
                    slot.callback = Some(callback);
                }
            });
        }

        fn is_watching(&self) -> bool {
            self.with_slot(|slot| slot.callback.is_some())
        }

        fn unwatch(&self) {
            self.with_slot(|slot| {
                slot.callback = None;
            });
        }

        fn inc_request(&self) -> u32 {
            self.with_slot(|slot| {
                slot.depth += 1;
                slot.depth
            })
        }

        fn dec_request(&self) -> u32 {
            self.with_slot(|slot| {
                slot.depth = slot.depth.saturating_sub(1);
                slot.depth
            })
        }

        fn request_depth(&self) -> u32 {
            self.with_slot(|slot| slot.depth)
        }

        fn take_pin(&self) -> PinState {
            self.with_slot(|slot| std::mem::take(&mut slot.pin))
        }

        fn put_pin(&self, state: PinState) {
            self.with_slot(|slot| slot.pin = state);
        }
    }
}

#[cfg(feature = "task-identity")]
pub(crate) use task::TaskIdentityProvider;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn watch_is_idempotent_per_caller() {
        let provider = ThreadIdentityProvider::new();
        assert!(!provider.is_watching());

        let fired = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let f1 = fired.clone();
        provider.watch(Box::new(move |_state| {
            f1.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(provider.is_watching());

        // A second watch while already watching is a no-op: install a callback
        // that would be distinguishable if it ran instead.
        let f2 = fired.clone();
        provider.watch(Box::new(move |_state| {
            f2.fetch_add(100, Ordering::SeqCst);
        }));

        provider.unwatch();
        assert!(!provider.is_watching());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn request_depth_nests_and_floors_at_zero() {
        let provider = ThreadIdentityProvider::new();
        assert_eq!(provider.request_depth(), 0);
        assert_eq!(provider.inc_request(), 1);
        assert_eq!(provider.inc_request(), 2);
        assert_eq!(provider.dec_request(), 1);
        assert_eq!(provider.dec_request(), 0);
        assert_eq!(provider.dec_request(), 0);
    }

    #[test]
    fn distinct_providers_do_not_share_slots() {
        let a = ThreadIdentityProvider::new();
        let b = ThreadIdentityProvider::new();
        a.inc_request();
        assert_eq!(a.request_depth(), 1);
        assert_eq!(b.request_depth(), 0);
    }

    #[test]
    fn death_callback_runs_on_thread_exit_if_still_watching() {
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let f = fired.clone();
        std::thread::spawn(move || {
            let provider = ThreadIdentityProvider::new();
            provider.watch(Box::new(move |_state| {
                f.store(true, Ordering::SeqCst);
            }));
            // No `unwatch()` — simulates a caller that dies mid-request.
        })
        .join()
        .unwrap();

        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn current_is_stable_within_a_thread_and_distinct_across_threads() {
        let provider = ThreadIdentityProvider::new();
        let id_a = provider.current();
        let id_b = provider.current();
        assert_eq!(id_a, id_b);

        let other_provider = ThreadIdentityProvider::new();
        let other_thread_id = std::thread::spawn(move || other_provider.current())
            .join()
            .unwrap();
        assert_ne!(id_a, other_thread_id);
    }

    #[test]
    fn death_callback_does_not_run_if_unwatched_before_exit() {
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let f = fired.clone();
        std::thread::spawn(move || {
            let provider = ThreadIdentityProvider::new();
            provider.watch(Box::new(move |_state| {
                f.store(true, Ordering::SeqCst);
            }));
            provider.unwatch();
        })
        .join()
        .unwrap();

        assert!(!fired.load(Ordering::SeqCst));
    }

    #[cfg(feature = "task-identity")]
    #[tokio::test]
    async fn task_scope_gives_each_task_an_independent_identity_and_slot() {
        let provider = std::sync::Arc::new(TaskIdentityProvider::new());

        let a = {
            let provider = provider.clone();
            tokio::spawn(TaskIdentityProvider::scope(async move {
                provider.inc_request();
                (provider.current(), provider.request_depth())
            }))
            .await
            .unwrap()
        };

        let b = {
            let provider = provider.clone();
            tokio::spawn(TaskIdentityProvider::scope(async move {
                (provider.current(), provider.request_depth())
            }))
            .await
            .unwrap()
        };

        assert_ne!(a.0, b.0);
        assert_eq!(a.1, 1);
        assert_eq!(b.1, 0);
    }

    #[cfg(feature = "task-identity")]
    #[test]
    fn task_provider_falls_back_to_thread_granularity_outside_a_scope() {
        let provider = TaskIdentityProvider::new();
        assert_eq!(provider.request_depth(), 0);
        assert_eq!(provider.inc_request(), 1);
        assert_eq!(provider.request_depth(), 1);
    }
}
