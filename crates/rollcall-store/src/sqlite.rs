use crate::error::DbError;
use crate::schema;
use chrono::{DateTime, Utc};
use rollcall_core::{
    AttendanceRecord, AttendanceStatus, AttendanceStore, CaptureMethod, CreateError, Embedding,
    Identity, IdentityId, NewRecord, Population, RecordId, Session, SessionId, StoreError,
    SubjectId,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity role. Only students are ever matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Faculty,
    Admin,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Faculty => "faculty",
            Self::Admin => "admin",
        }
    }
}

/// SQLite-backed store. One connection per instance; open several instances
/// on the same file for independent writers.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    dim: usize,
}

impl SqliteStore {
    /// Open or create the database at `path`. `dim` is the embedding
    /// dimension stored vectors are validated against.
    pub fn open(path: impl AsRef<Path>, dim: usize) -> Result<Self, DbError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "database opened");
        Self::init(conn, dim)
    }

    pub fn open_in_memory(dim: usize) -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?, dim)
    }

    fn init(conn: Connection, dim: usize) -> Result<Self, DbError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            dim,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn add_identity(
        &self,
        name: &str,
        enrollment_no: Option<&str>,
        role: Role,
    ) -> Result<IdentityId, DbError> {
        let id = IdentityId::new();
        self.conn()?.execute(
            "INSERT INTO identities (id, name, enrollment_no, role) VALUES (?1, ?2, ?3, ?4)",
            params![id.to_string(), name, enrollment_no, role.as_str()],
        )?;
        Ok(id)
    }

    /// Append a training vector. Returns the identity's vector count after
    /// the insert.
    pub fn add_embedding(
        &self,
        identity: IdentityId,
        embedding: &Embedding,
    ) -> Result<usize, DbError> {
        if embedding.dim() != self.dim {
            return Err(DbError::InvalidValue(format!(
                "expected {}-dim embedding, got {}",
                self.dim,
                embedding.dim()
            )));
        }
        let conn = self.conn()?;
        let key = identity.to_string();
        let exists: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM identities WHERE id = ?1)",
            [&key],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(DbError::UnknownIdentity(key));
        }
        conn.execute(
            "INSERT INTO embeddings (identity_id, vector, created_at) VALUES (?1, ?2, ?3)",
            params![key, embedding.to_json(), Utc::now().to_rfc3339()],
        )?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM embeddings WHERE identity_id = ?1",
            [&key],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn add_subject(&self, code: &str, name: &str) -> Result<SubjectId, DbError> {
        let id = SubjectId::new();
        self.conn()?.execute(
            "INSERT INTO subjects (id, code, name) VALUES (?1, ?2, ?3)",
            params![id.to_string(), code, name],
        )?;
        Ok(id)
    }

    pub fn enroll(&self, identity: IdentityId, subject: SubjectId) -> Result<(), DbError> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO enrollments (identity_id, subject_id) VALUES (?1, ?2)",
            params![identity.to_string(), subject.to_string()],
        )?;
        Ok(())
    }

    pub fn open_session(&self, subject: SubjectId) -> Result<Session, DbError> {
        let conn = self.conn()?;
        let key = subject.to_string();
        let exists: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM subjects WHERE id = ?1)",
            [&key],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(DbError::UnknownSubject(key));
        }
        let session = Session {
            id: SessionId::new(),
            subject_id: subject,
            is_active: true,
        };
        conn.execute(
            "INSERT INTO sessions (id, subject_id, is_active, created_at) VALUES (?1, ?2, 1, ?3)",
            params![session.id.to_string(), key, Utc::now().to_rfc3339()],
        )?;
        Ok(session)
    }

    pub fn close_session(&self, session: SessionId) -> Result<(), DbError> {
        let changed = self.conn()?.execute(
            "UPDATE sessions SET is_active = 0 WHERE id = ?1",
            [session.to_string()],
        )?;
        if changed == 0 {
            return Err(DbError::UnknownSession(session.to_string()));
        }
        Ok(())
    }

    pub fn session(&self, id: SessionId) -> Result<Option<Session>, DbError> {
        let row = self
            .conn()?
            .query_row(
                "SELECT subject_id, is_active FROM sessions WHERE id = ?1",
                [id.to_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)),
            )
            .optional()?;
        row.map(|(subject, is_active)| {
            Ok::<_, DbError>(Session {
                id,
                subject_id: parse(&subject)?,
                is_active,
            })
        })
        .transpose()
    }

    /// Load every student with their stored vectors.
    ///
    /// Vectors that fail validation are skipped with a warning; they never
    /// abort the load.
    pub fn load_population(&self) -> Result<Population, DbError> {
        let conn = self.conn()?;

        let mut identities: BTreeMap<IdentityId, Identity> = BTreeMap::new();
        let mut stmt = conn.prepare(
            "SELECT id, name, enrollment_no FROM identities WHERE role = 'student'",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;
        for row in rows {
            let (id, name, enrollment_no) = row?;
            let id: IdentityId = parse(&id)?;
            identities.insert(
                id,
                Identity {
                    id,
                    name,
                    enrollment_no,
                    embeddings: Vec::new(),
                },
            );
        }

        let mut stmt = conn.prepare(
            "SELECT e.id, e.identity_id, e.vector FROM embeddings e
             JOIN identities i ON i.id = e.identity_id
             WHERE i.role = 'student'
             ORDER BY e.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut rejected = 0usize;
        for row in rows {
            let (row_id, identity, vector) = row?;
            let identity: IdentityId = parse(&identity)?;
            match Embedding::from_json(&vector, self.dim) {
                Ok(e) => {
                    if let Some(entry) = identities.get_mut(&identity) {
                        entry.embeddings.push(e);
                    }
                }
                Err(e) => {
                    rejected += 1;
                    tracing::warn!(
                        embedding = row_id,
                        %identity,
                        error = %e,
                        "stored embedding rejected"
                    );
                }
            }
        }

        let population = Population::new(identities.into_values().collect());
        tracing::debug!(
            identities = population.len(),
            embeddings = population.embedding_count(),
            rejected,
            "population loaded"
        );
        Ok(population)
    }

    pub fn records_for_session(
        &self,
        session: SessionId,
    ) -> Result<Vec<AttendanceRecord>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, identity_id, status, similarity, method, probe_path, marked_at
             FROM attendance_records WHERE session_id = ?1 ORDER BY marked_at, id",
        )?;
        let rows = stmt.query_map([session.to_string()], RecordRow::read)?;
        let records = rows
            .map(|row| row?.into_record())
            .collect::<Result<Vec<_>, DbError>>()?;
        Ok(records)
    }
}

struct RecordRow {
    id: String,
    session_id: String,
    identity_id: String,
    status: String,
    similarity: f64,
    method: String,
    probe_path: Option<String>,
    marked_at: String,
}

impl RecordRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            identity_id: row.get(2)?,
            status: row.get(3)?,
            similarity: row.get(4)?,
            method: row.get(5)?,
            probe_path: row.get(6)?,
            marked_at: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<AttendanceRecord, DbError> {
        let status = match self.status.as_str() {
            "PRESENT" => AttendanceStatus::Present,
            other => return Err(DbError::InvalidValue(format!("unknown status: {other}"))),
        };
        let method = CaptureMethod::parse(&self.method)
            .ok_or_else(|| DbError::InvalidValue(format!("unknown method: {}", self.method)))?;
        let marked_at = DateTime::parse_from_rfc3339(&self.marked_at)
            .map_err(|e| DbError::InvalidValue(format!("marked_at {}: {e}", self.marked_at)))?
            .with_timezone(&Utc);
        Ok(AttendanceRecord {
            id: RecordId(parse(&self.id)?),
            session_id: parse(&self.session_id)?,
            identity_id: parse(&self.identity_id)?,
            status,
            similarity: self.similarity as f32,
            method,
            probe_path: self.probe_path,
            marked_at,
        })
    }
}

fn parse<T: FromStr>(value: &str) -> Result<T, DbError> {
    value
        .parse()
        .map_err(|_| DbError::InvalidValue(format!("bad id: {value}")))
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::ConstraintViolation
                && (err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
    )
}

impl AttendanceStore for SqliteStore {
    fn is_enrolled(&self, identity: IdentityId, session: &Session) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let enrolled = conn
            .query_row(
                "SELECT EXISTS (SELECT 1 FROM enrollments
                 WHERE identity_id = ?1 AND subject_id = ?2)",
                params![identity.to_string(), session.subject_id.to_string()],
                |row| row.get(0),
            )
            .map_err(DbError::from)?;
        Ok(enrolled)
    }

    fn find_record(
        &self,
        session: SessionId,
        identity: IdentityId,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, session_id, identity_id, status, similarity, method,
                        probe_path, marked_at
                 FROM attendance_records WHERE session_id = ?1 AND identity_id = ?2",
                params![session.to_string(), identity.to_string()],
                RecordRow::read,
            )
            .optional()
            .map_err(DbError::from)?;
        Ok(row.map(RecordRow::into_record).transpose()?)
    }

    fn create_record(&self, record: NewRecord) -> Result<AttendanceRecord, CreateError> {
        let conn = self.conn().map_err(StoreError::from)?;
        let created = AttendanceRecord::from_new(RecordId::new(), record);
        let inserted = conn.execute(
            "INSERT INTO attendance_records
                (id, session_id, identity_id, status, similarity, method, probe_path, marked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                created.id.to_string(),
                created.session_id.to_string(),
                created.identity_id.to_string(),
                created.status.as_str(),
                created.similarity as f64,
                created.method.as_str(),
                created.probe_path,
                created.marked_at.to_rfc3339(),
            ],
        );
        match inserted {
            Ok(_) => Ok(created),
            Err(e) if is_unique_violation(&e) => Err(CreateError::AlreadyExists {
                session: created.session_id,
                identity: created.identity_id,
            }),
            Err(e) => Err(CreateError::Store(DbError::from(e).into())),
        }
    }
}
