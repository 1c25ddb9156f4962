use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use folio_core::document::{ContextFile, Document, StyleTemplate};
use folio_core::edits::{AppliedEdit, Operation};
use folio_core::ids::{ContinuationHandle, EditId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Quarantined,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Quarantined => write!(f, "quarantined"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "quarantined" => Ok(Self::Quarantined),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Everything persisted for one session.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub document: Document,
    pub history: Vec<AppliedEdit>,
    pub continuation_handle: Option<ContinuationHandle>,
    pub context_files: Vec<ContextFile>,
    pub style_template: Option<StyleTemplate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            document: Document::default(),
            history: Vec::new(),
            continuation_handle: None,
            context_files: Vec::new(),
            style_template: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone)]
pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Load a session. `Ok(None)` when no row exists.
    ///
    /// Fails with `Quarantined` for sessions previously marked unreadable and
    /// with `CorruptRow` when a column cannot be decoded.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn load(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let header = {
                let mut stmt = conn.prepare(
                    "SELECT document, continuation_handle, context_files, status, quarantine_reason,
                            created_at, updated_at, style_template
                     FROM sessions WHERE id = ?1",
                )?;
                let mut rows = stmt.query([id.as_str()])?;
                match rows.next()? {
                    Some(row) => row_to_header(row)?,
                    None => return Ok(None),
                }
            };

            if header.status == SessionStatus::Quarantined {
                return Err(StoreError::Quarantined {
                    session_id: id.to_string(),
                    reason: header.quarantine_reason.unwrap_or_default(),
                });
            }

            let history = load_history(conn, id)?;
            Ok(Some(SessionRecord {
                id: id.clone(),
                document: row_helpers::parse_json(&header.document, "sessions", "document")?,
                history,
                continuation_handle: header.continuation_handle.map(ContinuationHandle::new),
                context_files: row_helpers::parse_json(
                    &header.context_files,
                    "sessions",
                    "context_files",
                )?,
                style_template: header
                    .style_template
                    .as_deref()
                    .map(|raw| row_helpers::parse_json(raw, "sessions", "style_template"))
                    .transpose()?,
                created_at: row_helpers::parse_timestamp(&header.created_at, "sessions", "created_at")?,
                updated_at: row_helpers::parse_timestamp(&header.updated_at, "sessions", "updated_at")?,
            }))
        })
    }

    /// Upsert the session row and append history entries not yet stored.
    /// Runs in one transaction; stored history is never rewritten.
    #[instrument(skip(self, record), fields(session_id = %record.id, revision = record.document.revision))]
    pub fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let document = serde_json::to_string(&record.document)?;
        let context_files = serde_json::to_string(&record.context_files)?;
        let style_template = record
            .style_template
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO sessions (id, document, continuation_handle, context_files, style_template, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    document = excluded.document,
                    continuation_handle = excluded.continuation_handle,
                    context_files = excluded.context_files,
                    style_template = excluded.style_template,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    record.id.as_str(),
                    document,
                    record.continuation_handle.as_ref().map(|h| h.as_str()),
                    context_files,
                    style_template,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )?;

            let stored: usize = tx.query_row(
                "SELECT COUNT(*) FROM applied_edits WHERE session_id = ?1",
                [record.id.as_str()],
                |row| row.get(0),
            )?;
            if record.history.len() < stored {
                return Err(StoreError::Conflict(format!(
                    "history for {} would shrink from {stored} to {}",
                    record.id,
                    record.history.len()
                )));
            }

            for (seq, edit) in record.history.iter().enumerate().skip(stored) {
                tx.execute(
                    "INSERT INTO applied_edits
                        (edit_id, session_id, seq, operation, unit_index, params, preview, created_at, applied_at, revision)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    rusqlite::params![
                        edit.edit_id.as_str(),
                        record.id.as_str(),
                        seq as i64,
                        edit.operation.as_str(),
                        edit.unit_index.map(|i| i as i64),
                        serde_json::to_string(&edit.params)?,
                        edit.preview,
                        edit.created_at.to_rfc3339(),
                        edit.applied_at.to_rfc3339(),
                        edit.revision as i64,
                    ],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
    }

    /// Mark a session unreadable. Later loads fail fast with `Quarantined`.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn quarantine(&self, id: &SessionId, reason: &str) -> Result<(), StoreError> {
        warn!(reason, "quarantining session");
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET status = 'quarantined', quarantine_reason = ?1, updated_at = ?2
                 WHERE id = ?3",
                rusqlite::params![reason, Utc::now().to_rfc3339(), id.as_str()],
            )?;
            Ok(())
        })
    }
}

struct SessionHeader {
    document: String,
    continuation_handle: Option<String>,
    context_files: String,
    status: SessionStatus,
    quarantine_reason: Option<String>,
    created_at: String,
    updated_at: String,
    style_template: Option<String>,
}

fn row_to_header(row: &rusqlite::Row<'_>) -> Result<SessionHeader, StoreError> {
    let status: String = row_helpers::get(row, 3, "sessions", "status")?;
    Ok(SessionHeader {
        document: row_helpers::get(row, 0, "sessions", "document")?,
        continuation_handle: row_helpers::get_opt(row, 1, "sessions", "continuation_handle")?,
        context_files: row_helpers::get(row, 2, "sessions", "context_files")?,
        status: row_helpers::parse_enum(&status, "sessions", "status")?,
        quarantine_reason: row_helpers::get_opt(row, 4, "sessions", "quarantine_reason")?,
        created_at: row_helpers::get(row, 5, "sessions", "created_at")?,
        updated_at: row_helpers::get(row, 6, "sessions", "updated_at")?,
        style_template: row_helpers::get_opt(row, 7, "sessions", "style_template")?,
    })
}

fn load_history(
    conn: &rusqlite::Connection,
    id: &SessionId,
) -> Result<Vec<AppliedEdit>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT edit_id, operation, unit_index, params, preview, created_at, applied_at, revision
         FROM applied_edits WHERE session_id = ?1 ORDER BY seq",
    )?;
    let mut rows = stmt.query([id.as_str()])?;
    let mut history = Vec::new();
    while let Some(row) = rows.next()? {
        history.push(row_to_applied_edit(row)?);
    }
    Ok(history)
}

fn row_to_applied_edit(row: &rusqlite::Row<'_>) -> Result<AppliedEdit, StoreError> {
    const T: &str = "applied_edits";
    let params: String = row_helpers::get(row, 3, T, "params")?;
    let created_at: String = row_helpers::get(row, 5, T, "created_at")?;
    let applied_at: String = row_helpers::get(row, 6, T, "applied_at")?;
    Ok(AppliedEdit {
        edit_id: EditId::from_raw(row_helpers::get::<String>(row, 0, T, "edit_id")?),
        operation: Operation::new(row_helpers::get::<String>(row, 1, T, "operation")?),
        unit_index: row_helpers::get_opt::<i64>(row, 2, T, "unit_index")?.map(|i| i as usize),
        params: row_helpers::parse_json(&params, T, "params")?,
        preview: row_helpers::get(row, 4, T, "preview")?,
        created_at: row_helpers::parse_timestamp(&created_at, T, "created_at")?,
        applied_at: row_helpers::parse_timestamp(&applied_at, T, "applied_at")?,
        revision: row_helpers::get::<i64>(row, 7, T, "revision")? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::document::Unit;
    use serde_json::json;

    fn applied(op: &str, index: Option<usize>, revision: u64) -> AppliedEdit {
        AppliedEdit {
            edit_id: EditId::new(),
            unit_index: index,
            operation: Operation::new(op),
            params: json!({"content": "x"}),
            preview: format!("{op} preview"),
            created_at: Utc::now(),
            applied_at: Utc::now(),
            revision,
        }
    }

    fn record_with_units(contents: &[&str]) -> SessionRecord {
        let mut record = SessionRecord::new(SessionId::new());
        record.document.units = contents.iter().map(|c| Unit::new(*c)).collect();
        record.document.renumber();
        record
    }

    #[test]
    fn load_unknown_is_none() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        assert!(repo.load(&SessionId::new()).unwrap().is_none());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        let mut record = record_with_units(&["Title", "Body"]);
        record.document.revision = 1;
        record.document.theme = Some(json!({"primary": "#1a73e8"}));
        record.history.push(applied("ADD", Some(0), 1));
        record.history.push(applied("ADD", Some(1), 1));
        record.continuation_handle = Some(ContinuationHandle::new("conv_1"));
        record.context_files.push(ContextFile {
            filename: "brief.md".into(),
            text: "Quarterly numbers".into(),
        });
        record.style_template = Some(StyleTemplate {
            filename: "brand.pptx".into(),
            text: "Navy headings, two-column body".into(),
        });

        repo.save(&record).unwrap();
        let loaded = repo.load(&record.id).unwrap().unwrap();
        assert_eq!(loaded.document, record.document);
        assert_eq!(loaded.history.len(), 2);
        assert_eq!(loaded.history[0].edit_id, record.history[0].edit_id);
        assert_eq!(loaded.continuation_handle, record.continuation_handle);
        assert_eq!(loaded.context_files, record.context_files);
        assert_eq!(loaded.style_template, record.style_template);
    }

    #[test]
    fn missing_style_template_loads_as_none() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        let record = record_with_units(&["a"]);
        repo.save(&record).unwrap();
        assert_eq!(repo.load(&record.id).unwrap().unwrap().style_template, None);
    }

    #[test]
    fn history_is_appended_across_saves() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        let mut record = record_with_units(&["a"]);
        record.history.push(applied("ADD", Some(0), 1));
        repo.save(&record).unwrap();

        record.history.push(applied("UPDATE", Some(0), 2));
        record.document.revision = 2;
        repo.save(&record).unwrap();

        let loaded = repo.load(&record.id).unwrap().unwrap();
        assert_eq!(loaded.history.len(), 2);
        assert_eq!(loaded.history[1].revision, 2);
        assert_eq!(loaded.document.revision, 2);
    }

    #[test]
    fn shrinking_history_is_rejected() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        let mut record = record_with_units(&[]);
        record.history.push(applied("SET_THEME", None, 1));
        repo.save(&record).unwrap();

        record.history.clear();
        assert!(matches!(repo.save(&record), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn corrupt_document_surfaces_corrupt_row() {
        let db = Database::in_memory().unwrap();
        let repo = SessionRepo::new(db.clone());
        let record = record_with_units(&["a"]);
        repo.save(&record).unwrap();

        db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET document = '{not json' WHERE id = ?1",
                [record.id.as_str()],
            )?;
            Ok(())
        })
        .unwrap();

        let err = repo.load(&record.id).unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { column: "document", .. }));
    }

    #[test]
    fn quarantined_sessions_fail_fast() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        let record = record_with_units(&["a"]);
        repo.save(&record).unwrap();
        repo.quarantine(&record.id, "bad document").unwrap();

        match repo.load(&record.id) {
            Err(StoreError::Quarantined { reason, .. }) => assert_eq!(reason, "bad document"),
            other => panic!("expected quarantine, got {other:?}"),
        }
    }
}
