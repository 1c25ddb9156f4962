use chrono::{DateTime, Utc};
use tracing::instrument;

use folio_core::ids::{ContinuationHandle, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A resume token as stored. Only the token's digest is kept.
#[derive(Clone, Debug, PartialEq)]
pub struct ContinuationRow {
    pub token_hash: String,
    pub session_id: SessionId,
    pub handle: ContinuationHandle,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ContinuationRepo {
    db: Database,
}

impl ContinuationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, row), fields(session_id = %row.session_id))]
    pub fn insert(&self, row: &ContinuationRow) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO continuations (token_hash, session_id, handle, revision, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    row.token_hash,
                    row.session_id.as_str(),
                    row.handle.as_str(),
                    row.revision as i64,
                    row.created_at.to_rfc3339(),
                    row.expires_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, token_hash: &str) -> Result<Option<ContinuationRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT token_hash, session_id, handle, revision, created_at, expires_at
                 FROM continuations WHERE token_hash = ?1",
            )?;
            let mut rows = stmt.query([token_hash])?;
            match rows.next()? {
                Some(row) => row_to_continuation(row).map(Some),
                None => Ok(None),
            }
        })
    }

    /// Delete tokens that expired before `now`. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM continuations WHERE expires_at < ?1",
                [now.to_rfc3339()],
            )?;
            Ok(removed)
        })
    }
}

fn row_to_continuation(row: &rusqlite::Row<'_>) -> Result<ContinuationRow, StoreError> {
    const T: &str = "continuations";
    let created_at: String = row_helpers::get(row, 4, T, "created_at")?;
    let expires_at: String = row_helpers::get(row, 5, T, "expires_at")?;
    Ok(ContinuationRow {
        token_hash: row_helpers::get(row, 0, T, "token_hash")?,
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, T, "session_id")?),
        handle: ContinuationHandle::new(row_helpers::get::<String>(row, 2, T, "handle")?),
        revision: row_helpers::get::<i64>(row, 3, T, "revision")? as u64,
        created_at: row_helpers::parse_timestamp(&created_at, T, "created_at")?,
        expires_at: row_helpers::parse_timestamp(&expires_at, T, "expires_at")?,
    })
}
