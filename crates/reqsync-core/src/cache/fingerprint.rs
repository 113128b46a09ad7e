//! Collection fingerprints.
//!
//! A fingerprint reduces a collection to the sorted `id:status:updated_at`
//! tokens of its records. Two collections with the same fingerprint are
//! treated as identical even if untracked fields or ordering differ.
//!
//! Present values are escaped so that no value can pass for a missing one or
//! spill into a neighbouring field: `\`, `:` and `|` get a backslash, and a
//! value that is exactly `-` becomes `\-`.

use std::borrow::Cow;

use super::Tracked;

/// Token used for a missing id, status or timestamp.
pub const MISSING_TOKEN: &str = "-";

const SEPARATOR: &str = "|";

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn escape(value: &str) -> Cow<'_, str> {
    if value == MISSING_TOKEN {
        return Cow::Owned(format!("\\{}", MISSING_TOKEN));
    }
    if !value.contains(['\\', ':', '|']) {
        return Cow::Borrowed(value);
    }
    let mut escaped = String::with_capacity(value.len() + 4);
    for ch in value.chars() {
        if matches!(ch, '\\' | ':' | '|') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    Cow::Owned(escaped)
}

fn field(value: Option<&str>) -> Cow<'_, str> {
    value.map_or(Cow::Borrowed(MISSING_TOKEN), escape)
}

/// `id:status:updated_at` for one record.
pub fn record_token<T: Tracked>(record: &T) -> String {
    let key = record.record_key();
    format!(
        "{}:{}:{}",
        field(key.as_deref()),
        field(record.status_token()),
        field(record.updated_at()),
    )
}

pub fn fingerprint<T: Tracked>(records: &[T]) -> Fingerprint {
    let mut tokens: Vec<String> = records.iter().map(record_token).collect();
    tokens.sort_unstable();
    Fingerprint(tokens.join(SEPARATOR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Requisition;

    fn req(id: i64, status: &str, updated_at: &str) -> Requisition {
        Requisition::new(id, status, updated_at)
    }

    #[test]
    fn test_empty_collection() {
        let records: Vec<Requisition> = Vec::new();
        assert!(fingerprint(&records).is_empty());
    }

    #[test]
    fn test_single_record_token() {
        let records = vec![req(1, "to_accept", "t1")];
        assert_eq!(fingerprint(&records).as_str(), "1:to_accept:t1");
    }

    #[test]
    fn test_permutations_share_fingerprint() {
        let a = vec![req(1, "to_accept", "t1"), req(2, "accepted", "t5"), req(3, "completed", "t9")];
        let b = vec![a[2].clone(), a[0].clone(), a[1].clone()];
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).as_str(), "1:to_accept:t1|2:accepted:t5|3:completed:t9");
    }

    #[test]
    fn test_untracked_fields_are_ignored() {
        let plain = req(1, "accepted", "t2");
        let mut annotated = plain.clone();
        annotated
            .extra
            .insert("comment".to_string(), serde_json::json!("changed"));
        assert_eq!(fingerprint(&[plain]), fingerprint(&[annotated]));
    }

    #[test]
    fn test_status_change_is_detected() {
        let before = vec![req(1, "to_accept", "t1"), req(2, "accepted", "t1")];
        let after = vec![req(1, "rejected", "t1"), req(2, "accepted", "t1")];
        assert_ne!(fingerprint(&before), fingerprint(&after));
    }

    #[test]
    fn test_timestamp_change_is_detected() {
        let before = vec![req(1, "accepted", "t1")];
        let after = vec![req(1, "accepted", "t2")];
        assert_ne!(fingerprint(&before), fingerprint(&after));
    }

    #[test]
    fn test_duplicates_count() {
        let once = vec![req(1, "accepted", "t1")];
        let twice = vec![req(1, "accepted", "t1"), req(1, "accepted", "t1")];
        assert_ne!(fingerprint(&once), fingerprint(&twice));
    }

    #[test]
    fn test_missing_fields_are_distinct_tokens() {
        let mut no_status = req(4, "accepted", "t1");
        no_status.status = None;
        let mut no_timestamp = req(4, "accepted", "t1");
        no_timestamp.updated_at = None;

        assert_eq!(fingerprint(&[no_status.clone()]).as_str(), "4:-:t1");
        assert_eq!(fingerprint(&[no_timestamp.clone()]).as_str(), "4:accepted:-");
        assert_ne!(fingerprint(&[no_status]), fingerprint(&[no_timestamp]));
    }

    #[test]
    fn test_literal_dash_is_not_a_missing_field() {
        let mut missing = req(4, "accepted", "t1");
        missing.updated_at = None;
        let dashed = req(4, "accepted", "-");

        assert_eq!(fingerprint(&[dashed.clone()]).as_str(), "4:accepted:\\-");
        assert_ne!(fingerprint(&[missing]), fingerprint(&[dashed]));

        let mut no_status = req(4, "accepted", "t1");
        no_status.status = None;
        assert_ne!(fingerprint(&[no_status]), fingerprint(&[req(4, "-", "t1")]));
    }

    #[test]
    fn test_separators_inside_values_are_escaped() {
        let colon_in_status = Requisition::new("a", "b:c", "t1");
        let colon_in_id = Requisition::new("a:b", "c", "t1");
        assert_eq!(record_token(&colon_in_status), "a:b\\:c:t1");
        assert_eq!(record_token(&colon_in_id), "a\\:b:c:t1");
        assert_ne!(fingerprint(&[colon_in_status]), fingerprint(&[colon_in_id]));

        let one = Requisition::new(1_i64, "accepted", "t1|2:accepted:t1");
        let two = vec![req(1, "accepted", "t1"), req(2, "accepted", "t1")];
        assert_ne!(fingerprint(&[one]), fingerprint(&two));

        assert_eq!(
            record_token(&Requisition::new(1_i64, "a\\", "t1")),
            "1:a\\\\:t1"
        );
    }

    #[test]
    fn test_string_and_integer_ids_render_alike() {
        let int_id = Requisition::new(7_i64, "accepted", "t1");
        let str_id = Requisition::new("7", "accepted", "t1");
        assert_eq!(fingerprint(&[int_id]), fingerprint(&[str_id]));
    }
}
