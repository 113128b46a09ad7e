use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - session may be expired")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    /// 400 or 422: the backend refused the payload, usually with per-field
    /// messages.
    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// The readable part of an error body.
    ///
    /// `{"detail": "..."}` yields the detail. An object of field errors such
    /// as `{"status": ["not a valid choice"]}` yields `status: not a valid
    /// choice`, fields in key order. Anything else is the raw body, truncated.
    fn server_message(body: &str) -> String {
        let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(body) else {
            return Self::truncate_body(body);
        };
        if let Some(Value::String(detail)) = fields.get("detail") {
            return Self::truncate_body(detail);
        }

        let mut parts = Vec::with_capacity(fields.len());
        for (field, messages) in &fields {
            let text = match messages {
                Value::String(message) => message.clone(),
                Value::Array(items) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("; "),
                _ => return Self::truncate_body(body),
            };
            parts.push(format!("{}: {}", field, text));
        }
        if parts.is_empty() {
            return Self::truncate_body(body);
        }
        Self::truncate_body(&parts.join(", "))
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(Self::server_message(body)),
            404 => ApiError::NotFound(Self::server_message(body)),
            400 | 422 => ApiError::Rejected(Self::server_message(body)),
            409 => ApiError::Conflict(Self::server_message(body)),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(Self::truncate_body(body)),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, Self::truncate_body(body))),
        }
    }
}
