use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Get a nullable column value.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    get(row, idx, table, column)
}

/// Decode a JSON text column into `T`.
pub fn parse_json<T: DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Parse an RFC 3339 timestamp column.
pub fn parse_timestamp(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table,
            column,
            detail: format!("invalid timestamp {raw:?}: {e}"),
        })
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionStatus;
    use folio_core::document::Document;

    #[test]
    fn parse_enum_success_and_failure() {
        let ok: Result<SessionStatus, _> = parse_enum("quarantined", "sessions", "status");
        assert_eq!(ok.unwrap(), SessionStatus::Quarantined);

        let bad: Result<SessionStatus, _> = parse_enum("INVALID", "sessions", "status");
        assert!(matches!(bad, Err(StoreError::CorruptRow { table: "sessions", column: "status", .. })));
    }

    #[test]
    fn parse_json_typed() {
        let doc: Document = parse_json(r#"{"units":[]}"#, "sessions", "document").unwrap();
        assert!(doc.is_empty());

        let bad: Result<Document, _> = parse_json(r#"{"units": 7}"#, "sessions", "document");
        assert!(matches!(bad, Err(StoreError::CorruptRow { column: "document", .. })));
    }

    #[test]
    fn parse_timestamp_rejects_garbage() {
        assert!(parse_timestamp("2026-02-14T12:00:00Z", "sessions", "created_at").is_ok());
        let err = parse_timestamp("yesterday", "sessions", "created_at").unwrap_err();
        assert!(err.is_corruption());
    }
}
