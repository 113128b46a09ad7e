//! Client-side sync cache.
//!
//! One `RecordStore` per collection holds the canonical snapshot and
//! coordinates fetches. Mutating calls made through an intercepted
//! `ApiClient` publish `Invalidation`s on an `EventBus`; stores attached to
//! the bus refresh in response. `StableView` is a throttled presentation of
//! a store for consumers that must not flicker.

mod bus;
mod fingerprint;
mod invalidation;
mod snapshot;
mod stable;
mod store;

#[cfg(test)]
pub(crate) mod test_support;

use tokio::sync::watch;

pub use bus::{EventBus, Subscription};
pub use fingerprint::{fingerprint, record_token, Fingerprint, MISSING_TOKEN};
pub use invalidation::{Invalidation, InvalidationBus, InvalidationOrigin, MutationInterceptor};
pub use snapshot::Snapshot;
pub use stable::StableView;
pub use store::{RecordSource, RecordStore, StoreView, SyncPhase};

/// A record the cache can track: something with an identity, a status and a
/// last-modified timestamp.
pub trait Tracked: Clone + Send + Sync + 'static {
    /// Stable identity, rendered as a string. `None` for records the server
    /// has not assigned an id to.
    fn record_key(&self) -> Option<String>;

    fn status_token(&self) -> Option<&str>;

    fn updated_at(&self) -> Option<&str>;
}

/// What a consumer needs from a collection, whether it talks to the store
/// directly or through a `StableView`.
pub trait CollectionHandle<T>: Send + Sync {
    fn view(&self) -> StoreView<T>;

    fn subscribe(&self) -> watch::Receiver<StoreView<T>>;

    fn request_refresh(&self, force: bool);

    /// Returns false when the record was rejected.
    fn merge_record(&self, record: T) -> bool;
}
