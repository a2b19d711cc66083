use crate::engine::{EngineError, EngineHandle};
use rollcall_core::{IdentityId, PopulationSnapshot, SessionId};
use rollcall_store::SqliteStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use zbus::fdo;
use zbus::interface;

/// D-Bus interface for the attendance kiosk daemon.
///
/// Bus name: org.rollcall.Kiosk1
/// Object path: /org/rollcall/Kiosk1
pub struct KioskService {
    pub engine: EngineHandle,
    pub store: Arc<SqliteStore>,
    pub snapshot: Arc<PopulationSnapshot>,
    pub timeout: Duration,
    pub threshold: f32,
}

#[interface(name = "org.rollcall.Kiosk1")]
impl KioskService {
    /// Match the faces in `frames` and mark attendance for `session_id`.
    /// Returns the outcome as JSON.
    async fn mark_attendance(&self, session_id: &str, frames: Vec<Vec<u8>>) -> fdo::Result<String> {
        let session: SessionId = parse_id(session_id, "session_id")?;
        tracing::info!(%session, frames = frames.len(), "mark_attendance requested");

        let outcome = self.bounded(self.engine.decide(session, frames)).await?;
        serde_json::to_string(&outcome).map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    /// Add one training sample for `identity_id` from an image.
    async fn enroll_face(&self, identity_id: &str, frame: Vec<u8>) -> fdo::Result<String> {
        let identity: IdentityId = parse_id(identity_id, "identity_id")?;
        tracing::info!(%identity, bytes = frame.len(), "enroll_face requested");

        let result = self.bounded(self.engine.enroll(identity, frame)).await?;
        serde_json::to_string(&result).map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    /// Attendance records for a session as a JSON array.
    async fn list_records(&self, session_id: &str) -> fdo::Result<String> {
        let session: SessionId = parse_id(session_id, "session_id")?;
        let store = Arc::clone(&self.store);
        let records = tokio::task::spawn_blocking(move || store.records_for_session(session))
            .await
            .map_err(|e| fdo::Error::Failed(e.to_string()))?
            .map_err(|e| fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&records).map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let population = self.snapshot.current();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "identities": population.len(),
            "embeddings": population.embedding_count(),
            "embedding_dim": self.store.dim(),
            "similarity_threshold": self.threshold,
        })
        .to_string())
    }
}

impl KioskService {
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, EngineError>>,
    ) -> fdo::Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(to_fdo),
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "engine call timed out");
                Err(fdo::Error::TimedOut(format!(
                    "no decision within {}s",
                    self.timeout.as_secs()
                )))
            }
        }
    }
}

fn parse_id<T: std::str::FromStr>(raw: &str, field: &str) -> fdo::Result<T> {
    raw.parse()
        .map_err(|_| fdo::Error::InvalidArgs(format!("{field} is not a valid UUID: {raw:?}")))
}

fn to_fdo(err: EngineError) -> fdo::Error {
    if err.is_rejected_input() {
        tracing::info!(error = %err, "request rejected");
        fdo::Error::InvalidArgs(err.to_string())
    } else {
        tracing::error!(error = %err, "request failed");
        fdo::Error::Failed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_rejects_garbage() {
        let ok: fdo::Result<SessionId> =
            parse_id("67e55044-10b1-426f-9247-bb680e5fe0c8", "session_id");
        assert!(ok.is_ok());
        let bad: fdo::Result<SessionId> = parse_id("room-4", "session_id");
        assert!(matches!(bad, Err(fdo::Error::InvalidArgs(_))));
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(to_fdo(EngineError::NoFrames), fdo::Error::InvalidArgs(_)));
        assert!(matches!(to_fdo(EngineError::ChannelClosed), fdo::Error::Failed(_)));
        assert!(matches!(to_fdo(EngineError::MultipleFaces(3)), fdo::Error::InvalidArgs(_)));
    }
}
