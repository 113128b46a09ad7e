//! Typed in-process publish/subscribe.
//!
//! `publish` calls the handlers registered at the moment it starts, in
//! subscription order, synchronously on the caller's thread. The registry
//! lock is not held while handlers run, so handlers may publish, subscribe
//! or unsubscribe freely.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

type Handler<E> = Box<dyn Fn(&E) + Send + Sync>;

struct Slot<E> {
    id: u64,
    active: AtomicBool,
    handler: Handler<E>,
}

struct Registry<E> {
    next_id: u64,
    slots: Vec<Arc<Slot<E>>>,
}

fn lock<E>(registry: &Mutex<Registry<E>>) -> MutexGuard<'_, Registry<E>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Event emitter shared by reference (clones share subscribers).
pub struct EventBus<E> {
    id: u64,
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<E: 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            id: NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed),
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                slots: Vec::new(),
            })),
        }
    }

    /// Process-unique identity, shared by clones.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Register a handler. It stays registered until the returned
    /// `Subscription` is dropped or `unsubscribe`d.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let slot = {
            let mut registry = lock(&self.registry);
            registry.next_id += 1;
            let slot = Arc::new(Slot {
                id: registry.next_id,
                active: AtomicBool::new(true),
                handler: Box::new(handler),
            });
            registry.slots.push(Arc::clone(&slot));
            slot
        };

        let registry: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                slot.active.store(false, Ordering::SeqCst);
                if let Some(registry) = registry.upgrade() {
                    lock(&registry).slots.retain(|s| s.id != slot.id);
                }
            })),
        }
    }

    /// Notify every current subscriber once. Returns how many were called.
    pub fn publish(&self, event: &E) -> usize {
        let slots: Vec<Arc<Slot<E>>> = lock(&self.registry).slots.clone();
        let mut notified = 0;
        for slot in slots {
            if slot.active.load(Ordering::SeqCst) {
                (slot.handler)(event);
                notified += 1;
            }
        }
        notified
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).slots.len()
    }
}

/// Handle to a registered handler; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
