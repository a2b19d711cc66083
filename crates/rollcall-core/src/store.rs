//! Persistence contract consumed by the decision engine, plus an in-memory
//! implementation.

use crate::types::{
    AttendanceRecord, IdentityId, NewRecord, RecordId, Session, SessionId, SubjectId,
};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend: {0}")]
    Backend(String),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
    #[error("store lock poisoned")]
    Poisoned,
}

#[derive(Error, Debug)]
pub enum CreateError {
    /// A record for this (session, identity) pair already exists. Distinct
    /// from any other failure so the caller can resolve a lost race.
    #[error("attendance already recorded for session {session} / identity {identity}")]
    AlreadyExists {
        session: SessionId,
        identity: IdentityId,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Roster and attendance-record access needed to reach a decision.
pub trait AttendanceStore {
    /// Whether `identity` is on the roster of `session`.
    fn is_enrolled(&self, identity: IdentityId, session: &Session) -> Result<bool, StoreError>;

    fn find_record(
        &self,
        session: SessionId,
        identity: IdentityId,
    ) -> Result<Option<AttendanceRecord>, StoreError>;

    /// Atomically create the record for `(record.session_id, record.identity_id)`.
    ///
    /// Must fail with [`CreateError::AlreadyExists`] if the pair already has a
    /// record, including one written concurrently since `find_record`.
    fn create_record(&self, record: NewRecord) -> Result<AttendanceRecord, CreateError>;
}

impl<S: AttendanceStore + ?Sized> AttendanceStore for &S {
    fn is_enrolled(&self, identity: IdentityId, session: &Session) -> Result<bool, StoreError> {
        (**self).is_enrolled(identity, session)
    }

    fn find_record(
        &self,
        session: SessionId,
        identity: IdentityId,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        (**self).find_record(session, identity)
    }

    fn create_record(&self, record: NewRecord) -> Result<AttendanceRecord, CreateError> {
        (**self).create_record(record)
    }
}

#[derive(Default)]
struct MemoryInner {
    enrollments: HashSet<(IdentityId, SubjectId)>,
    records: HashMap<(SessionId, IdentityId), AttendanceRecord>,
}

/// In-memory store. Check-and-insert happens under a single lock.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enroll(&self, identity: IdentityId, subject: SubjectId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        inner.enrollments.insert((identity, subject));
        Ok(())
    }

    pub fn record_count(&self) -> Result<usize, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(inner.records.len())
    }
}

impl AttendanceStore for MemoryStore {
    fn is_enrolled(&self, identity: IdentityId, session: &Session) -> Result<bool, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(inner.enrollments.contains(&(identity, session.subject_id)))
    }

    fn find_record(
        &self,
        session: SessionId,
        identity: IdentityId,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(inner.records.get(&(session, identity)).cloned())
    }

    fn create_record(&self, record: NewRecord) -> Result<AttendanceRecord, CreateError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        let key = (record.session_id, record.identity_id);
        if inner.records.contains_key(&key) {
            return Err(CreateError::AlreadyExists {
                session: key.0,
                identity: key.1,
            });
        }
        let created = AttendanceRecord::from_new(RecordId::new(), record);
        inner.records.insert(key, created.clone());
        Ok(created)
    }
}
