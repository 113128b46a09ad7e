//! The fetch coordinator.
//!
//! A `RecordStore` owns the canonical snapshot of one collection and decides
//! when to hit the network. Refresh requests are debounced, unforced ones are
//! throttled, at most one fetch runs at a time, and a fetch made stale by a
//! local merge or bulk replace is thrown away when it completes.
//!
//! Store state sits behind a `std::sync::Mutex` that is never held across an
//! `.await`. Debounce timers and fetches are separate tasks, so cancelling a
//! timer never cancels a dispatched call.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncTimings;

use super::bus::Subscription;
use super::fingerprint::{fingerprint, Fingerprint};
use super::invalidation::{Invalidation, InvalidationBus};
use super::snapshot::Snapshot;
use super::{CollectionHandle, Tracked};

/// Where a store gets the full collection from.
pub trait RecordSource<T>: Send + Sync {
    fn fetch_all(&self) -> BoxFuture<'_, Result<Vec<T>>>;
}

/// Position in the refresh state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    /// A debounce timer is armed (or a request is queued behind a fetch).
    Debouncing,
    Fetching,
}

/// What consumers of a collection observe.
#[derive(Debug, Clone)]
pub struct StoreView<T> {
    pub records: Arc<Vec<T>>,
    pub fingerprint: Fingerprint,
    pub loading: bool,
    pub error: Option<String>,
    pub phase: SyncPhase,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl<T> StoreView<T> {
    fn empty() -> Self {
        Self {
            records: Arc::new(Vec::new()),
            fingerprint: Fingerprint::default(),
            loading: false,
            error: None,
            phase: SyncPhase::Idle,
            fetched_at: None,
        }
    }

    /// Same records allocation and same status fields.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.records, &other.records)
            && self.fingerprint == other.fingerprint
            && self.loading == other.loading
            && self.error == other.error
            && self.phase == other.phase
            && self.fetched_at == other.fetched_at
    }
}

struct PendingRefresh {
    token: u64,
    force: bool,
    timer: JoinHandle<()>,
}

struct State<T> {
    snapshot: Snapshot<T>,
    error: Option<String>,
    pending: Option<PendingRefresh>,
    in_flight: bool,
    /// Request that arrived while a fetch was running; the value is `force`.
    queued: Option<bool>,
    generation: u64,
    next_token: u64,
}

impl<T> State<T> {
    fn phase(&self) -> SyncPhase {
        if self.in_flight {
            SyncPhase::Fetching
        } else if self.pending.is_some() || self.queued.is_some() {
            SyncPhase::Debouncing
        } else {
            SyncPhase::Idle
        }
    }
}

struct Inner<T> {
    name: String,
    source: Arc<dyn RecordSource<T>>,
    timings: SyncTimings,
    state: Mutex<State<T>>,
    tx: watch::Sender<StoreView<T>>,
}

impl<T: Tracked> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push the current state to subscribers if it differs from what they saw.
    fn publish(&self, state: &State<T>) {
        let view = StoreView {
            records: Arc::clone(state.snapshot.records()),
            fingerprint: state.snapshot.fingerprint().clone(),
            loading: state.in_flight,
            error: state.error.clone(),
            phase: state.phase(),
            fetched_at: state.snapshot.fetched_at_utc(),
        };
        self.tx.send_if_modified(move |current| {
            if current.same_as(&view) {
                false
            } else {
                *current = view;
                true
            }
        });
    }

    /// Arm the debounce timer, cancelling any previous one. A pending forced
    /// request keeps the coalesced refresh forced.
    fn arm(inner: &Arc<Self>, state: &mut State<T>, force: bool, runtime: &Handle) {
        let mut force = force;
        if let Some(previous) = state.pending.take() {
            previous.timer.abort();
            force |= previous.force;
        }

        state.next_token += 1;
        let token = state.next_token;
        let delay = inner.timings.debounce();
        let weak = Arc::downgrade(inner);
        let timer = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                Inner::fire(&inner, token);
            }
        });

        state.pending = Some(PendingRefresh { token, force, timer });
    }

    fn fire(inner: &Arc<Self>, token: u64) {
        let mut state = inner.lock();
        let force = match state.pending.take() {
            Some(pending) if pending.token == token => pending.force,
            other => {
                // Superseded by a newer timer
                state.pending = other;
                return;
            }
        };

        if state.in_flight {
            debug!(store = %inner.name, force, "Fetch in flight, queueing refresh");
            state.queued = Some(state.queued.unwrap_or(false) || force);
            inner.publish(&state);
            return;
        }

        if !force {
            if let Some(fetched_at) = state.snapshot.fetched_at() {
                let min_interval = inner.timings.min_refresh_interval();
                if fetched_at.elapsed() < min_interval {
                    debug!(store = %inner.name, "Skipping refresh inside throttle window");
                    inner.publish(&state);
                    return;
                }
            }
        }

        state.generation += 1;
        let generation = state.generation;
        state.in_flight = true;
        inner.publish(&state);
        drop(state);

        debug!(store = %inner.name, generation, force, "Dispatching fetch");
        let inner = Arc::clone(inner);
        tokio::spawn(async move { inner.run_fetch(generation).await });
    }

    async fn run_fetch(self: Arc<Self>, generation: u64) {
        let result = match AssertUnwindSafe(self.source.fetch_all()).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("Record source panicked")),
        };

        let mut state = self.lock();
        state.in_flight = false;

        if state.generation != generation {
            debug!(store = %self.name, generation, current = state.generation, "Discarding stale fetch result");
        } else {
            match result {
                Ok(records) => {
                    let next = fingerprint(&records);
                    if next == *state.snapshot.fingerprint() {
                        debug!(store = %self.name, "Refresh returned identical data");
                        state.snapshot.touch();
                    } else {
                        info!(store = %self.name, count = records.len(), "Collection changed");
                        state.snapshot = Snapshot::new(records);
                    }
                    state.error = None;
                }
                Err(e) => {
                    warn!(store = %self.name, error = %format!("{:#}", e), "Refresh failed");
                    state.error = Some(format!("{:#}", e));
                }
            }
        }

        if let Some(force) = state.queued.take() {
            match Handle::try_current() {
                Ok(runtime) => Inner::arm(&self, &mut state, force, &runtime),
                Err(_) => warn!(store = %self.name, "No runtime to re-arm queued refresh"),
            }
        }
        self.publish(&state);
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = state.pending.take() {
            pending.timer.abort();
        }
    }
}

/// Canonical cache of one collection. Clones share the same state.
pub struct RecordStore<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RecordStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Tracked> RecordStore<T> {
    pub fn new(name: impl Into<String>, source: Arc<dyn RecordSource<T>>, timings: SyncTimings) -> Self {
        let (tx, _rx) = watch::channel(StoreView::empty());
        let state = State {
            snapshot: Snapshot::empty(),
            error: None,
            pending: None,
            in_flight: false,
            queued: None,
            generation: 0,
            next_token: 0,
        };
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                source,
                timings,
                state: Mutex::new(state),
                tx,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Ask for a refresh. Requests inside the debounce window coalesce into
    /// one; unforced ones are skipped inside the throttle window.
    pub fn request_refresh(&self, force: bool) {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(store = %self.inner.name, "No async runtime, refresh request dropped");
                return;
            }
        };
        let mut state = self.inner.lock();
        Inner::arm(&self.inner, &mut state, force, &runtime);
        self.inner.publish(&state);
    }

    /// Apply a known-good record locally, without a network call.
    ///
    /// The record replaces the one with the same key, or is appended. Returns
    /// false, leaving the snapshot untouched, for a record without a key.
    pub fn merge_record(&self, record: T) -> bool {
        let Some(key) = record.record_key() else {
            warn!(store = %self.inner.name, "Rejecting merge of a record without an id");
            return false;
        };

        let mut state = self.inner.lock();
        let mut records: Vec<T> = state.snapshot.records().as_ref().clone();
        match records
            .iter()
            .position(|r| r.record_key().as_deref() == Some(key.as_str()))
        {
            Some(index) => records[index] = record,
            None => records.push(record),
        }
        state.snapshot = Snapshot::new(records);
        state.generation += 1;
        debug!(store = %self.inner.name, key = %key, "Merged record");
        self.inner.publish(&state);
        true
    }

    /// Replace the whole collection, bypassing debounce and throttle.
    pub fn replace_all(&self, records: Vec<T>) {
        let mut state = self.inner.lock();
        state.snapshot = Snapshot::new(records);
        state.generation += 1;
        state.error = None;
        self.inner.publish(&state);
    }

    pub fn view(&self) -> StoreView<T> {
        self.inner.tx.borrow().clone()
    }

    pub fn snapshot(&self) -> Snapshot<T> {
        self.inner.lock().snapshot.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreView<T>> {
        self.inner.tx.subscribe()
    }

    /// Number of fetches dispatched plus local writes so far.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Wait until no timer is armed and no fetch is running.
    pub async fn settled(&self) -> StoreView<T> {
        let mut rx = self.subscribe();
        let settled = match rx.wait_for(|view| view.phase == SyncPhase::Idle).await {
            Ok(view) => Some(view.clone()),
            Err(_) => None,
        };
        settled.unwrap_or_else(|| self.view())
    }

    /// Refresh (forced, debounced) on every invalidation published on `bus`.
    pub fn attach(&self, bus: &InvalidationBus) -> Subscription {
        let weak = Arc::downgrade(&self.inner);
        bus.subscribe(move |event: &Invalidation| {
            if let Some(inner) = weak.upgrade() {
                debug!(store = %inner.name, origin = %event.origin, "Invalidation received");
                RecordStore { inner }.request_refresh(true);
            }
        })
    }
}

impl<T: Tracked> CollectionHandle<T> for RecordStore<T> {
    fn view(&self) -> StoreView<T> {
        RecordStore::view(self)
    }

    fn subscribe(&self) -> watch::Receiver<StoreView<T>> {
        RecordStore::subscribe(self)
    }

    fn request_refresh(&self, force: bool) {
        RecordStore::request_refresh(self, force)
    }

    fn merge_record(&self, record: T) -> bool {
        RecordStore::merge_record(self, record)
    }
}
