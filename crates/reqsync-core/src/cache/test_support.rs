use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;

use crate::config::SyncTimings;
use crate::models::Requisition;

use super::{RecordSource, RecordStore};

/// Replays queued fetch results, optionally after a delay. An exhausted
/// queue answers with an empty collection.
pub(crate) struct FakeSource {
    calls: AtomicUsize,
    responses: Mutex<VecDeque<Result<Vec<Requisition>>>>,
    delay: Duration,
}

impl FakeSource {
    pub(crate) fn new(responses: Vec<Result<Vec<Requisition>>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            responses: Mutex::new(responses.into()),
            delay,
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn store(self: &Arc<Self>) -> RecordStore<Requisition> {
        let source: Arc<dyn RecordSource<Requisition>> = self.clone();
        RecordStore::new("requisitions", source, SyncTimings::default())
    }
}

impl RecordSource<Requisition> for FakeSource {
    fn fetch_all(&self) -> BoxFuture<'_, Result<Vec<Requisition>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()));
        let delay = self.delay;
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            next
        })
    }
}
