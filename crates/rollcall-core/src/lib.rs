//! rollcall-core — Identity matching and attendance decisions.
//!
//! Reduces each enrolled identity to a unit centroid, scores probe
//! embeddings against it by cosine similarity, picks the global best across
//! frames, and resolves one attendance outcome per request.

pub mod aggregate;
pub mod archive;
pub mod centroid;
pub mod decision;
pub mod extractor;
pub mod matcher;
pub mod snapshot;
pub mod store;
pub mod types;

pub use archive::{FrameArchive, NoArchive};
pub use decision::{Decision, DecisionEngine, DecideError, Outcome, OutcomeStatus};
pub use extractor::{ExtractError, Extractor};
pub use matcher::{CosineMatcher, Matcher};
pub use snapshot::PopulationSnapshot;
pub use store::{AttendanceStore, CreateError, MemoryStore, StoreError};
pub use types::{
    AttendanceRecord, AttendanceStatus, CaptureMethod, Embedding, EmbeddingError, Identity,
    IdentityId, IdentityRef, NewRecord, Population, RecordId, Session, SessionId, SubjectId,
};
