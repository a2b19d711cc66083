use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// An enrolled person. Ordering is the deterministic tie-break key.
    IdentityId
);
uuid_id!(SessionId);
uuid_id!(SubjectId);
uuid_id!(RecordId);

#[derive(Error, Debug, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding is empty")]
    Empty,
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("non-finite value at index {0}")]
    NonFinite(usize),
    #[error("malformed embedding: {0}")]
    Malformed(String),
}

/// Face embedding vector (512-dimensional for ArcFace), unit-normalized by
/// the extractor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Validate and wrap a raw vector of the expected dimension.
    pub fn new(values: Vec<f32>, dim: usize) -> Result<Self, EmbeddingError> {
        if values.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        if values.len() != dim {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dim,
                got: values.len(),
            });
        }
        if let Some(i) = values.iter().position(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite(i));
        }
        Ok(Self { values })
    }

    /// Parse a stored vector. The only accepted shape is a flat JSON array of
    /// numbers; anything else is rejected before validation.
    pub fn from_json(text: &str, dim: usize) -> Result<Self, EmbeddingError> {
        let values: Vec<f32> =
            serde_json::from_str(text).map_err(|e| EmbeddingError::Malformed(e.to_string()))?;
        Self::new(values, dim)
    }

    pub fn to_json(&self) -> String {
        // A Vec<f32> of finite values always serializes.
        serde_json::to_string(&self.values).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }
}

/// An enrolled person together with their stored training vectors.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: IdentityId,
    pub name: String,
    pub enrollment_no: Option<String>,
    pub embeddings: Vec<Embedding>,
}

impl Identity {
    pub fn to_ref(&self) -> IdentityRef {
        IdentityRef {
            id: self.id,
            name: self.name.clone(),
            enrollment_no: self.enrollment_no.clone(),
        }
    }
}

/// Display handle for an identity, carried on outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRef {
    pub id: IdentityId,
    pub name: String,
    pub enrollment_no: Option<String>,
}

/// Read-only snapshot of the matchable population, sorted by identity id.
#[derive(Debug, Clone, Default)]
pub struct Population {
    identities: Vec<Identity>,
}

impl Population {
    pub fn new(mut identities: Vec<Identity>) -> Self {
        identities.sort_by_key(|i| i.id);
        Self { identities }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.identities.iter()
    }

    pub fn get(&self, id: IdentityId) -> Option<&Identity> {
        self.identities
            .binary_search_by_key(&id, |i| i.id)
            .ok()
            .map(|idx| &self.identities[idx])
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Total number of stored vectors across all identities.
    pub fn embedding_count(&self) -> usize {
        self.identities.iter().map(|i| i.embeddings.len()).sum()
    }
}

/// An attendance-taking window tied to one subject's roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub subject_id: SubjectId,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceStatus {
    Present,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "PRESENT",
        }
    }
}

/// How the probe frames reached the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMethod {
    Kiosk,
    KioskMultiCam,
}

impl CaptureMethod {
    pub fn for_frame_count(frames: usize) -> Self {
        if frames > 1 {
            Self::KioskMultiCam
        } else {
            Self::Kiosk
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kiosk => "kiosk",
            Self::KioskMultiCam => "kiosk_multi_cam",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "kiosk" => Some(Self::Kiosk),
            "kiosk_multi_cam" => Some(Self::KioskMultiCam),
            _ => None,
        }
    }
}

/// Payload for a record about to be written.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub session_id: SessionId,
    pub identity_id: IdentityId,
    pub similarity: f32,
    pub method: CaptureMethod,
    pub probe_path: Option<String>,
    pub marked_at: DateTime<Utc>,
}

/// A persisted attendance mark. At most one exists per (session, identity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: RecordId,
    pub session_id: SessionId,
    pub identity_id: IdentityId,
    pub status: AttendanceStatus,
    pub similarity: f32,
    pub method: CaptureMethod,
    pub probe_path: Option<String>,
    pub marked_at: DateTime<Utc>,
}

impl AttendanceRecord {
    pub fn from_new(id: RecordId, new: NewRecord) -> Self {
        Self {
            id,
            session_id: new.session_id,
            identity_id: new.identity_id,
            status: AttendanceStatus::Present,
            similarity: new.similarity,
            method: new.method,
            probe_path: new.probe_path,
            marked_at: new.marked_at,
        }
    }
}
