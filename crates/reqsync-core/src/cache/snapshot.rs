use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::fingerprint::{fingerprint, Fingerprint};
use super::Tracked;

/// The last known state of a collection.
///
/// Records and fingerprint are only ever written together, so
/// `fingerprint() == fingerprint(records())` always holds.
#[derive(Debug)]
pub struct Snapshot<T> {
    records: Arc<Vec<T>>,
    fingerprint: Fingerprint,
    fetched_at: Option<Instant>,
    fetched_at_utc: Option<DateTime<Utc>>,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
            fingerprint: self.fingerprint.clone(),
            fetched_at: self.fetched_at,
            fetched_at_utc: self.fetched_at_utc,
        }
    }
}

impl<T: Tracked> Snapshot<T> {
    /// Nothing fetched yet.
    pub fn empty() -> Self {
        Self {
            records: Arc::new(Vec::new()),
            fingerprint: Fingerprint::default(),
            fetched_at: None,
            fetched_at_utc: None,
        }
    }

    /// A snapshot of `records`, fetched now.
    pub fn new(records: Vec<T>) -> Self {
        let fingerprint = fingerprint(&records);
        Self {
            records: Arc::new(records),
            fingerprint,
            fetched_at: Some(Instant::now()),
            fetched_at_utc: Some(Utc::now()),
        }
    }

    /// Advance the fetch time, keeping the records.
    pub(crate) fn touch(&mut self) {
        self.fetched_at = Some(Instant::now());
        self.fetched_at_utc = Some(Utc::now());
    }

    pub fn records(&self) -> &Arc<Vec<T>> {
        &self.records
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn fetched_at(&self) -> Option<Instant> {
        self.fetched_at
    }

    pub fn fetched_at_utc(&self) -> Option<DateTime<Utc>> {
        self.fetched_at_utc
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Time since the last fetch by the wall clock. A clock that moved
    /// backwards reads as zero.
    pub fn age(&self) -> Option<chrono::Duration> {
        self.fetched_at_utc
            .map(|at| (Utc::now() - at).max(chrono::Duration::zero()))
    }

    /// Short age for status lines: "just now", "4m ago", "2h05m ago",
    /// "3d07h ago", or "never" before the first fetch.
    pub fn age_display(&self) -> String {
        let Some(age) = self.age() else {
            return "never".to_string();
        };
        let minutes = age.num_minutes();
        match minutes {
            0 => "just now".to_string(),
            1..=59 => format!("{}m ago", minutes),
            60..=1439 => format!("{}h{:02}m ago", minutes / 60, minutes % 60),
            _ => format!("{}d{:02}h ago", minutes / 1440, (minutes % 1440) / 60),
        }
    }
}
