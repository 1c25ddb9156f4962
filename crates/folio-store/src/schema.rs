/// SQL DDL for the folio session database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 2;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    document TEXT NOT NULL,
    continuation_handle TEXT,
    context_files TEXT NOT NULL DEFAULT '[]',
    style_template TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    quarantine_reason TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS applied_edits (
    edit_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    seq INTEGER NOT NULL,
    operation TEXT NOT NULL,
    unit_index INTEGER,
    params TEXT NOT NULL,
    preview TEXT NOT NULL,
    created_at TEXT NOT NULL,
    applied_at TEXT NOT NULL,
    revision INTEGER NOT NULL,
    UNIQUE (session_id, seq)
);

CREATE TABLE IF NOT EXISTS continuations (
    token_hash TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    handle TEXT NOT NULL,
    revision INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_applied_session_seq ON applied_edits(session_id, seq);
CREATE INDEX IF NOT EXISTS idx_continuations_expiry ON continuations(expires_at);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

/// v2 added the per-session style template.
pub const MIGRATE_V1_TO_V2: &str = r#"
ALTER TABLE sessions ADD COLUMN style_template TEXT;
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
