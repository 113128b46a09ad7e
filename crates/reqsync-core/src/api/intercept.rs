//! Side observers for calls executed through an `ApiClient`.
//!
//! An interceptor sees every request together with its outcome after the
//! call has finished. It cannot change the request, the response or the
//! error, and a failing interceptor never affects the caller.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

use super::client::ApiRequest;

#[derive(Error, Debug)]
pub enum InterceptError {
    #[error("No async runtime available to schedule work")]
    NoRuntime,

    #[error("{0}")]
    Other(String),
}

/// How an observed call ended.
#[derive(Debug, Clone, Copy)]
pub enum CallOutcome<'a> {
    /// The server answered, with any status code.
    Completed(StatusCode),
    /// The request never produced a response.
    Failed(&'a anyhow::Error),
}

impl CallOutcome<'_> {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Completed(status) if status.is_success())
    }
}

pub trait Interceptor: Send + Sync {
    /// Registration key. A client holds at most one interceptor per name.
    fn name(&self) -> &str;

    fn after_call(&self, request: &ApiRequest, outcome: &CallOutcome<'_>) -> Result<(), InterceptError>;
}

/// Ordered set of interceptors shared by all clones of one `ApiClient`.
#[derive(Default)]
pub struct InterceptorChain {
    entries: RwLock<Vec<Arc<dyn Interceptor>>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an interceptor. Returns false, leaving the chain untouched, when
    /// one with the same name is already installed.
    pub fn install(&self, interceptor: Arc<dyn Interceptor>) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.iter().any(|e| e.name() == interceptor.name()) {
            debug!(name = interceptor.name(), "Interceptor already installed");
            return false;
        }
        entries.push(interceptor);
        true
    }

    /// Remove an interceptor by name. Returns whether one was removed.
    pub fn remove(&self, name: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|e| e.name() != name);
        entries.len() != before
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    /// Run every interceptor. Errors and panics are logged and swallowed.
    pub fn notify(&self, request: &ApiRequest, outcome: &CallOutcome<'_>) {
        let entries: Vec<Arc<dyn Interceptor>> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for interceptor in entries {
            let result = panic::catch_unwind(AssertUnwindSafe(|| interceptor.after_call(request, outcome)));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(interceptor = interceptor.name(), error = %e, path = %request.path, "Interceptor failed");
                }
                Err(_) => {
                    warn!(interceptor = interceptor.name(), path = %request.path, "Interceptor panicked");
                }
            }
        }
    }
}
