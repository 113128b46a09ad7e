use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::Tracked;

/// Record identifier as sent by the API: usually an integer primary key,
/// occasionally a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Str(String),
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordId::Int(id) => write!(f, "{}", id),
            RecordId::Str(id) => write!(f, "{}", id),
        }
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        RecordId::Int(id)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        RecordId::Str(id.to_string())
    }
}

/// Requisition workflow status.
///
/// Unknown values are kept verbatim in `Other` so they stay distinct from
/// each other and survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RequisitionStatus {
    ToAccept,
    Accepted,
    Rejected,
    InProgress,
    Completed,
    Other(String),
}

impl RequisitionStatus {
    /// All statuses the console knows about, in workflow order.
    pub const KNOWN: [RequisitionStatus; 5] = [
        RequisitionStatus::ToAccept,
        RequisitionStatus::Accepted,
        RequisitionStatus::Rejected,
        RequisitionStatus::InProgress,
        RequisitionStatus::Completed,
    ];

    /// Wire value used by the API.
    pub fn as_str(&self) -> &str {
        match self {
            RequisitionStatus::ToAccept => "to_accept",
            RequisitionStatus::Accepted => "accepted",
            RequisitionStatus::Rejected => "rejected",
            RequisitionStatus::InProgress => "in_progress",
            RequisitionStatus::Completed => "completed",
            RequisitionStatus::Other(s) => s,
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            RequisitionStatus::ToAccept => "To accept",
            RequisitionStatus::Accepted => "Accepted",
            RequisitionStatus::Rejected => "Rejected",
            RequisitionStatus::InProgress => "In progress",
            RequisitionStatus::Completed => "Completed",
            RequisitionStatus::Other(s) => s,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, RequisitionStatus::Other(_))
    }
}

impl From<String> for RequisitionStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "to_accept" => RequisitionStatus::ToAccept,
            "accepted" => RequisitionStatus::Accepted,
            "rejected" => RequisitionStatus::Rejected,
            "in_progress" => RequisitionStatus::InProgress,
            "completed" => RequisitionStatus::Completed,
            _ => RequisitionStatus::Other(s),
        }
    }
}

impl From<&str> for RequisitionStatus {
    fn from(s: &str) -> Self {
        RequisitionStatus::from(s.to_string())
    }
}

impl From<RequisitionStatus> for String {
    fn from(status: RequisitionStatus) -> Self {
        match status {
            RequisitionStatus::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for RequisitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// A material or HR requisition as returned by `/api/requisitions/`.
///
/// Fields other than `id`, `status` and `updated_at` are not interpreted and
/// are written back exactly as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requisition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RequisitionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Requisition {
    pub fn new(id: impl Into<RecordId>, status: impl Into<RequisitionStatus>, updated_at: &str) -> Self {
        Self {
            id: Some(id.into()),
            status: Some(status.into()),
            updated_at: Some(updated_at.to_string()),
            extra: Map::new(),
        }
    }

    fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    /// Human-facing requisition number, e.g. "ZAP/2024/017"
    pub fn number(&self) -> Option<&str> {
        self.extra_str("number")
    }

    /// "material" or "hr"
    pub fn requisition_type(&self) -> Option<&str> {
        self.extra_str("requisition_type")
    }

    pub fn project_name(&self) -> Option<&str> {
        self.extra_str("project_name")
    }

    /// Requested delivery date, as sent ("2024-06-01")
    pub fn deadline(&self) -> Option<&str> {
        self.extra_str("deadline")
    }

    pub fn status_display(&self) -> &str {
        self.status
            .as_ref()
            .map(RequisitionStatus::display_name)
            .unwrap_or("-")
    }

    pub fn formatted_updated_at(&self) -> String {
        match &self.updated_at {
            Some(ts) => {
                if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
                    dt.format("%Y-%m-%d %H:%M").to_string()
                } else {
                    ts.chars().take(16).collect()
                }
            }
            None => "-".to_string(),
        }
    }
}

impl Tracked for Requisition {
    fn record_key(&self) -> Option<String> {
        self.id.as_ref().map(RecordId::to_string)
    }

    fn status_token(&self) -> Option<&str> {
        self.status.as_ref().map(RequisitionStatus::as_str)
    }

    fn updated_at(&self) -> Option<&str> {
        self.updated_at.as_deref()
    }
}
