//! A calm presentation of a `RecordStore`.
//!
//! `StableView` does not keep its own copy of the collection. It follows the
//! store and re-presents only when the fingerprint or the error changes, so
//! loading flips and no-op refreshes never reach its consumers. Invalidation
//! signals are throttled with a trailing edge before a forced refresh is
//! requested from the store.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::bus::Subscription;
use super::invalidation::{Invalidation, InvalidationBus};
use super::store::{RecordStore, StoreView, SyncPhase};
use super::{CollectionHandle, Tracked};

#[derive(Default)]
struct Throttle {
    last_applied: Option<Instant>,
    trailing: Option<JoinHandle<()>>,
}

struct Shared<T> {
    store: RecordStore<T>,
    window: Duration,
    throttle: Mutex<Throttle>,
    tx: watch::Sender<StoreView<T>>,
}

/// The store's view as a stable consumer sees it.
fn presented<T>(view: &StoreView<T>) -> StoreView<T> {
    StoreView {
        records: Arc::clone(&view.records),
        fingerprint: view.fingerprint.clone(),
        loading: false,
        error: view.error.clone(),
        phase: SyncPhase::Idle,
        fetched_at: view.fetched_at,
    }
}

impl<T: Tracked> Shared<T> {
    fn throttle(&self) -> MutexGuard<'_, Throttle> {
        self.throttle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn present(&self, next: &StoreView<T>) -> bool {
        self.tx.send_if_modified(|current| {
            if current.fingerprint == next.fingerprint && current.error == next.error {
                false
            } else {
                *current = presented(next);
                true
            }
        })
    }

    fn on_signal(shared: &Arc<Self>, event: &Invalidation) {
        let mut throttle = shared.throttle();
        let now = Instant::now();
        let last_applied = throttle.last_applied;

        let last = match last_applied {
            Some(last) if now.duration_since(last) < shared.window => last,
            _ => {
                throttle.last_applied = Some(now);
                drop(throttle);
                debug!(store = %shared.store.name(), origin = %event.origin, "Applying invalidation");
                shared.store.request_refresh(true);
                return;
            }
        };

        if throttle.trailing.is_some() {
            return;
        }
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(store = %shared.store.name(), "No async runtime, invalidation dropped");
                return;
            }
        };
        let deadline = last + shared.window;
        let weak: Weak<Self> = Arc::downgrade(shared);
        throttle.trailing = Some(runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(shared) = weak.upgrade() {
                shared.apply_trailing();
            }
        }));
        debug!(store = %shared.store.name(), "Invalidation deferred to end of throttle window");
    }

    fn apply_trailing(&self) {
        {
            let mut throttle = self.throttle();
            throttle.trailing = None;
            throttle.last_applied = Some(Instant::now());
        }
        self.store.request_refresh(true);
    }
}

/// Throttled, loading-free presentation of a store.
///
/// Each `StableView` keeps its own throttle state; several may share one
/// store.
pub struct StableView<T> {
    shared: Arc<Shared<T>>,
    follower: JoinHandle<()>,
    _subscription: Subscription,
}

impl<T: Tracked> StableView<T> {
    /// Start following `store`, listen to `bus` for the view's lifetime and
    /// request an initial (unforced) refresh.
    ///
    /// The view must be the only listener that refreshes `store` on `bus`.
    /// A store that is also `attach`ed to the same bus refreshes on every
    /// signal, and the view presents each of those refreshes unthrottled.
    pub fn mount(store: RecordStore<T>, bus: &InvalidationBus, throttle: Duration) -> Result<Self> {
        let runtime = Handle::try_current().context("StableView must be mounted inside a Tokio runtime")?;

        let (tx, _rx) = watch::channel(presented(&store.view()));
        let shared = Arc::new(Shared {
            store,
            window: throttle,
            throttle: Mutex::new(Throttle::default()),
            tx,
        });

        let mut updates = shared.store.subscribe();
        let follower_shared = Arc::downgrade(&shared);
        let follower = runtime.spawn(async move {
            loop {
                let next = updates.borrow_and_update().clone();
                match follower_shared.upgrade() {
                    Some(shared) => {
                        shared.present(&next);
                    }
                    None => break,
                }
                if updates.changed().await.is_err() {
                    break;
                }
            }
        });

        let signal_shared = Arc::downgrade(&shared);
        let subscription = bus.subscribe(move |event: &Invalidation| {
            if let Some(shared) = signal_shared.upgrade() {
                Shared::on_signal(&shared, event);
            }
        });

        shared.store.request_refresh(false);

        Ok(Self {
            shared,
            follower,
            _subscription: subscription,
        })
    }

    pub fn store(&self) -> &RecordStore<T> {
        &self.shared.store
    }
}

impl<T: Tracked> CollectionHandle<T> for StableView<T> {
    fn view(&self) -> StoreView<T> {
        self.shared.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<StoreView<T>> {
        self.shared.tx.subscribe()
    }

    fn request_refresh(&self, force: bool) {
        self.shared.store.request_refresh(force);
    }

    /// Delegates to the store and presents the result right away.
    fn merge_record(&self, record: T) -> bool {
        if !self.shared.store.merge_record(record) {
            return false;
        }
        self.shared.present(&self.shared.store.view());
        true
    }
}

impl<T> Drop for StableView<T> {
    fn drop(&mut self) {
        self.follower.abort();
        let mut throttle = self.shared.throttle.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(trailing) = throttle.trailing.take() {
            trailing.abort();
        }
    }
}
