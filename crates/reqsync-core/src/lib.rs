//! reqsync core library.
//!
//! Shared client-side cache for the requisitions collection of the
//! management console, plus the HTTP plumbing it sits on.
//!
//! - `api`: `ApiClient` with an interceptor chain, the requisitions endpoints
//! - `cache`: fingerprinting, the `RecordStore` fetch coordinator, the
//!   invalidation bus, the mutation interceptor and the `StableView` adapter
//! - `models`: the `Requisition` record
//! - `config`: configuration file and environment overrides

pub mod api;
pub mod cache;
pub mod config;
pub mod models;

pub use api::{ApiClient, ApiError, RequisitionsApi};
pub use cache::{
    fingerprint, CollectionHandle, EventBus, Fingerprint, Invalidation, InvalidationBus,
    InvalidationOrigin, MutationInterceptor, RecordSource, RecordStore, Snapshot, StableView,
    StoreView, Subscription, SyncPhase, Tracked,
};
pub use config::{Config, SyncTimings};
pub use models::{RecordId, Requisition, RequisitionStatus};
