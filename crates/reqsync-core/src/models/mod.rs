//! Data models for console resources.
//!
//! Only `Requisition` is modelled. The cache inspects its id, status and
//! last-modified timestamp; every other field is carried as opaque JSON.

pub mod requisition;

pub use requisition::{RecordId, Requisition, RequisitionStatus};
