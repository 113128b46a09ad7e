//! REST API client module for the console backend.
//!
//! This module provides the `ApiClient` used for every HTTP call the
//! console makes, and the typed `RequisitionsApi` on top of it.
//!
//! All calls go through one `ApiClient::execute` entry point. Observers such
//! as the mutation interceptor are registered on the client instance, never
//! patched in globally.

pub mod client;
pub mod error;
pub mod intercept;
pub mod requisitions;

pub use client::{ApiClient, ApiRequest, ApiResponse, ReqwestTransport, Transport};
pub use error::ApiError;
pub use intercept::{CallOutcome, InterceptError, Interceptor, InterceptorChain};
pub use requisitions::RequisitionsApi;
