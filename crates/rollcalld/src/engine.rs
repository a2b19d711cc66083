use crate::probes::{ProbeArchive, SessionFrames};
use rollcall_core::{
    DecideError, DecisionEngine, ExtractError, Extractor, IdentityId, Outcome, PopulationSnapshot,
    SessionId,
};
use rollcall_store::{DbError, SqliteStore};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
    #[error("no frames supplied")]
    NoFrames,
    #[error("too many frames: at most {max}, got {got}")]
    TooManyFrames { max: usize, got: usize },
    #[error("no face detected in frame")]
    NoFaceDetected,
    #[error("{0} faces detected; training images must contain exactly one")]
    MultipleFaces(usize),
    #[error(transparent)]
    Decide(#[from] DecideError),
    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractError),
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    /// Whether the caller supplied bad input, as opposed to a server fault.
    pub fn is_rejected_input(&self) -> bool {
        matches!(
            self,
            Self::UnknownSession(_)
                | Self::NoFrames
                | Self::TooManyFrames { .. }
                | Self::NoFaceDetected
                | Self::MultipleFaces(_)
                | Self::Extract(ExtractError::Decode(_))
                | Self::Decide(DecideError::InactiveSession(_))
                | Self::Decide(DecideError::Extraction {
                    source: ExtractError::Decode(_),
                    ..
                })
                | Self::Db(DbError::UnknownIdentity(_))
        )
    }
}

/// Result of adding one training sample.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollResult {
    pub identity: IdentityId,
    pub samples: usize,
    /// Whether the identity has reached the configured minimum sample count.
    pub ready: bool,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Decide {
        session: SessionId,
        frames: Vec<Vec<u8>>,
        reply: oneshot::Sender<Result<Outcome, EngineError>>,
    },
    Enroll {
        identity: IdentityId,
        frame: Vec<u8>,
        reply: oneshot::Sender<Result<EnrollResult, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Extract probes from `frames`, match them and resolve attendance.
    pub async fn decide(
        &self,
        session: SessionId,
        frames: Vec<Vec<u8>>,
    ) -> Result<Outcome, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Decide {
                session,
                frames,
                reply,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Extract one embedding from `frame` and store it as a training sample.
    pub async fn enroll(
        &self,
        identity: IdentityId,
        frame: Vec<u8>,
    ) -> Result<EnrollResult, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                identity,
                frame,
                reply,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Everything the engine thread owns.
pub struct Engine<E> {
    pub extractor: E,
    pub decider: DecisionEngine,
    pub store: Arc<SqliteStore>,
    pub snapshot: Arc<PopulationSnapshot>,
    pub archive: ProbeArchive,
    pub max_frames: usize,
    pub min_samples: usize,
}

/// Spawn the engine on a dedicated OS thread.
///
/// The extractor is used from this thread only; requests are served one at
/// a time in arrival order. A request whose caller has already gone away
/// (timed out) is skipped so no record is written that nobody will see.
pub fn spawn_engine<E>(mut engine: Engine<E>) -> Result<EngineHandle, EngineError>
where
    E: Extractor + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Decide { session, frames, reply } => {
                        if reply.is_closed() {
                            tracing::info!(%session, "decide: caller gone, request skipped");
                            continue;
                        }
                        let result = engine.run_decide(session, &frames);
                        if let Err(lost) = reply.send(result) {
                            match lost {
                                Ok(outcome) => tracing::warn!(
                                    %session,
                                    status = outcome.status.as_str(),
                                    record = ?outcome.record.map(|r| r.id),
                                    "decide: caller gone, outcome not delivered"
                                ),
                                Err(e) => tracing::warn!(
                                    %session,
                                    error = %e,
                                    "decide: caller gone, error not delivered"
                                ),
                            }
                        }
                    }
                    EngineRequest::Enroll { identity, frame, reply } => {
                        if reply.is_closed() {
                            tracing::info!(%identity, "enroll: caller gone, request skipped");
                            continue;
                        }
                        let result = engine.run_enroll(identity, &frame);
                        if let Err(lost) = reply.send(result) {
                            match lost {
                                Ok(enrolled) => tracing::warn!(
                                    %identity,
                                    samples = enrolled.samples,
                                    "enroll: caller gone, result not delivered"
                                ),
                                Err(e) => tracing::warn!(
                                    %identity,
                                    error = %e,
                                    "enroll: caller gone, error not delivered"
                                ),
                            }
                        }
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

impl<E: Extractor> Engine<E> {
    fn run_decide(
        &mut self,
        session_id: SessionId,
        frames: &[Vec<u8>],
    ) -> Result<Outcome, EngineError> {
        if frames.is_empty() {
            return Err(EngineError::NoFrames);
        }
        if frames.len() > self.max_frames {
            return Err(EngineError::TooManyFrames {
                max: self.max_frames,
                got: frames.len(),
            });
        }
        let session = self
            .store
            .session(session_id)?
            .ok_or(EngineError::UnknownSession(session_id))?;
        let population = self.snapshot.current();
        tracing::debug!(
            session = %session_id,
            frames = frames.len(),
            identities = population.len(),
            "decide: start"
        );

        let archive = SessionFrames {
            archive: &self.archive,
            session: session_id,
            frames,
        };
        let decision = self.decider.decide(
            &mut self.extractor,
            frames,
            &session,
            &population,
            self.store.as_ref(),
            &archive,
        )?;
        Ok(decision.outcome)
    }

    fn run_enroll(
        &mut self,
        identity: IdentityId,
        frame: &[u8],
    ) -> Result<EnrollResult, EngineError> {
        let embedding = match self.extractor.extract_enrollment(frame) {
            Ok(Some(embedding)) => embedding,
            Ok(None) => return Err(EngineError::NoFaceDetected),
            Err(ExtractError::MultipleFaces(n)) => return Err(EngineError::MultipleFaces(n)),
            Err(e) => return Err(e.into()),
        };
        let samples = self.store.add_embedding(identity, &embedding)?;
        tracing::info!(%identity, samples, "enroll: sample stored");

        self.snapshot.replace(self.store.load_population()?);
        Ok(EnrollResult {
            identity,
            samples,
            ready: samples >= self.min_samples,
        })
    }
}
