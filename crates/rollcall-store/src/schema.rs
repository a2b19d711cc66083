use rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS identities (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    enrollment_no TEXT UNIQUE,
    role          TEXT NOT NULL CHECK (role IN ('student', 'faculty', 'admin'))
);

CREATE TABLE IF NOT EXISTS embeddings (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
    vector      TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_embeddings_identity ON embeddings(identity_id);

CREATE TABLE IF NOT EXISTS subjects (
    id   TEXT PRIMARY KEY,
    code TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id         TEXT PRIMARY KEY,
    subject_id TEXT NOT NULL REFERENCES subjects(id) ON DELETE CASCADE,
    is_active  INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS enrollments (
    identity_id TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
    subject_id  TEXT NOT NULL REFERENCES subjects(id) ON DELETE CASCADE,
    PRIMARY KEY (identity_id, subject_id)
);

CREATE TABLE IF NOT EXISTS attendance_records (
    id          TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    identity_id TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
    status      TEXT NOT NULL,
    similarity  REAL NOT NULL,
    method      TEXT NOT NULL,
    probe_path  TEXT,
    marked_at   TEXT NOT NULL,
    UNIQUE (session_id, identity_id)
);
"#;

pub(crate) fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}
