//! Attendance decision engine.
//!
//! Turns the global best candidate into exactly one outcome. Rules are
//! evaluated in this fixed order, first match wins:
//!
//! 1. no probe survived extraction → `no_face`
//! 2. no centroid to compare against → `no_embeddings`
//! 3. a record already exists for (session, identity) → `already_marked`
//! 4. score below threshold → `unresolved`
//! 5. identity not on the session roster → `not_enrolled`
//! 6. otherwise create the record → `matched`
//!
//! A duplicate-key failure while creating the record in step 6 resolves to
//! `already_marked`.

use crate::aggregate::{aggregate_frames, FrameMatch, FrameVerdict};
use crate::archive::{FrameArchive, Remapped};
use crate::centroid::compute_centroids;
use crate::extractor::{ExtractError, Extractor};
use crate::matcher::{CosineMatcher, Matcher};
use crate::store::{AttendanceStore, CreateError, StoreError};
use crate::types::{
    AttendanceRecord, CaptureMethod, Embedding, IdentityRef, NewRecord, Population, Session,
    SessionId,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecideError {
    #[error("session {0} is not active")]
    InactiveSession(SessionId),
    #[error("frame {frame} rejected: {source}")]
    Extraction {
        frame: usize,
        #[source]
        source: ExtractError,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug, PartialEq)]
#[error("similarity threshold must be within [-1, 1], got {0}")]
pub struct InvalidThreshold(pub f32);

/// Wire vocabulary for outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    NoFace,
    NoEmbeddings,
    AlreadyMarked,
    Unresolved,
    NotEnrolled,
    Matched,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoFace => "no_face",
            Self::NoEmbeddings => "no_embeddings",
            Self::AlreadyMarked => "already_marked",
            Self::Unresolved => "unresolved",
            Self::NotEnrolled => "not_enrolled",
            Self::Matched => "matched",
        }
    }
}

/// Terminal result of one decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<AttendanceRecord>,
}

impl Outcome {
    fn bare(status: OutcomeStatus) -> Self {
        Self {
            status,
            identity: None,
            score: None,
            record: None,
        }
    }

    fn scored(status: OutcomeStatus, identity: IdentityRef, score: f32) -> Self {
        Self {
            status,
            identity: Some(identity),
            score: Some(score),
            record: None,
        }
    }
}

/// An outcome plus the index of the frame that produced the winning probe.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub outcome: Outcome,
    pub frame: Option<usize>,
}

pub struct DecisionEngine<M = CosineMatcher> {
    threshold: f32,
    matcher: M,
}

impl DecisionEngine<CosineMatcher> {
    pub fn new(threshold: f32) -> Result<Self, InvalidThreshold> {
        Self::with_matcher(threshold, CosineMatcher)
    }
}

impl<M: Matcher> DecisionEngine<M> {
    pub fn with_matcher(threshold: f32, matcher: M) -> Result<Self, InvalidThreshold> {
        if !(-1.0..=1.0).contains(&threshold) {
            return Err(InvalidThreshold(threshold));
        }
        Ok(Self { threshold, matcher })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Extract probes from raw frames, then decide.
    ///
    /// Frames without a face are dropped. A frame that cannot be decoded
    /// rejects the whole request. `archive` is asked to save the winning
    /// frame right before a record is written, and to discard it again if
    /// the write does not happen.
    pub fn decide<E, S, A, B>(
        &self,
        extractor: &mut E,
        frames: &[B],
        session: &Session,
        population: &Population,
        store: &S,
        archive: &A,
    ) -> Result<Decision, DecideError>
    where
        E: Extractor + ?Sized,
        S: AttendanceStore + ?Sized,
        A: FrameArchive + ?Sized,
        B: AsRef<[u8]>,
    {
        if !session.is_active {
            return Err(DecideError::InactiveSession(session.id));
        }

        let mut probes = Vec::with_capacity(frames.len());
        let mut origin = Vec::with_capacity(frames.len());
        for (i, frame) in frames.iter().enumerate() {
            match extractor.extract(frame.as_ref()) {
                Ok(Some(probe)) => {
                    probes.push(probe);
                    origin.push(i);
                }
                Ok(None) => tracing::debug!(frame = i, "no face in frame"),
                Err(source) => return Err(DecideError::Extraction { frame: i, source }),
            }
        }
        tracing::debug!(frames = frames.len(), probes = probes.len(), "probes extracted");

        let method = CaptureMethod::for_frame_count(frames.len());
        let remapped = Remapped {
            inner: archive,
            origin: &origin,
        };
        let decision =
            self.decide_probes(&probes, session, population, store, method, &remapped)?;
        Ok(Decision {
            frame: decision.frame.map(|p| origin[p]),
            ..decision
        })
    }

    /// Decide from already-extracted probes. `Decision::frame` and the
    /// `archive` argument index into `probes`.
    pub fn decide_probes<S, A>(
        &self,
        probes: &[Embedding],
        session: &Session,
        population: &Population,
        store: &S,
        method: CaptureMethod,
        archive: &A,
    ) -> Result<Decision, DecideError>
    where
        S: AttendanceStore + ?Sized,
        A: FrameArchive + ?Sized,
    {
        if !session.is_active {
            return Err(DecideError::InactiveSession(session.id));
        }

        let centroids = compute_centroids(population);
        let best = match aggregate_frames(probes, &centroids, &self.matcher) {
            FrameVerdict::NoFace => {
                return Ok(self.finish(session, Outcome::bare(OutcomeStatus::NoFace), None));
            }
            FrameVerdict::NoCandidates => {
                let outcome = Outcome::bare(OutcomeStatus::NoEmbeddings);
                return Ok(self.finish(session, outcome, None));
            }
            FrameVerdict::Best(m) => m,
        };

        let outcome = self.resolve(&best, session, population, store, method, archive)?;
        Ok(self.finish(session, outcome, Some(best.frame)))
    }

    fn resolve<S, A>(
        &self,
        best: &FrameMatch,
        session: &Session,
        population: &Population,
        store: &S,
        method: CaptureMethod,
        archive: &A,
    ) -> Result<Outcome, DecideError>
    where
        S: AttendanceStore + ?Sized,
        A: FrameArchive + ?Sized,
    {
        let identity = population
            .get(best.identity)
            .map(|i| i.to_ref())
            .unwrap_or_else(|| IdentityRef {
                id: best.identity,
                name: String::new(),
                enrollment_no: None,
            });

        if let Some(existing) = store.find_record(session.id, best.identity)? {
            return Ok(already_marked(identity, best.score, Some(existing)));
        }

        if best.score < self.threshold {
            return Ok(Outcome::scored(OutcomeStatus::Unresolved, identity, best.score));
        }

        if !store.is_enrolled(best.identity, session)? {
            return Ok(Outcome::scored(OutcomeStatus::NotEnrolled, identity, best.score));
        }

        let probe_path = archive.save(best.frame);
        let new = NewRecord {
            session_id: session.id,
            identity_id: best.identity,
            similarity: best.score,
            method,
            probe_path: probe_path.clone(),
            marked_at: Utc::now(),
        };
        let created = store.create_record(new);
        if created.is_err() {
            if let Some(path) = &probe_path {
                archive.discard(path);
            }
        }
        match created {
            Ok(record) => Ok(Outcome {
                status: OutcomeStatus::Matched,
                identity: Some(identity),
                score: Some(best.score),
                record: Some(record),
            }),
            Err(CreateError::AlreadyExists { .. }) => {
                tracing::info!(
                    session = %session.id,
                    identity = %best.identity,
                    "concurrent mark won the race"
                );
                let existing = store.find_record(session.id, best.identity)?;
                Ok(already_marked(identity, best.score, existing))
            }
            Err(CreateError::Store(e)) => Err(e.into()),
        }
    }

    fn finish(&self, session: &Session, outcome: Outcome, frame: Option<usize>) -> Decision {
        tracing::info!(
            session = %session.id,
            status = outcome.status.as_str(),
            identity = ?outcome.identity.as_ref().map(|i| i.id),
            score = ?outcome.score,
            threshold = self.threshold,
            "attendance decision"
        );
        Decision { outcome, frame }
    }
}

fn already_marked(identity: IdentityRef, score: f32, record: Option<AttendanceRecord>) -> Outcome {
    Outcome {
        status: OutcomeStatus::AlreadyMarked,
        identity: Some(identity),
        score: Some(score),
        record,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::NoArchive;
    use crate::store::MemoryStore;
    use crate::types::{Identity, IdentityId, SubjectId};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::{Arc, Barrier};

    const T: f32 = 0.65;

    fn unit(v: &[f32]) -> Embedding {
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        Embedding::new(v.iter().map(|x| x / norm).collect(), v.len()).unwrap()
    }

    /// Probe that scores exactly `score` against the x-axis centroid.
    fn probe_scoring(score: f32) -> Embedding {
        unit(&[score, (1.0 - score * score).sqrt()])
    }

    struct Fixture {
        session: Session,
        student: Identity,
        population: Population,
        store: MemoryStore,
    }

    fn fixture(enrolled: bool) -> Fixture {
        let student = Identity {
            id: IdentityId::new(),
            name: "Ada".into(),
            enrollment_no: Some("E-001".into()),
            embeddings: vec![unit(&[1.0, 0.0])],
        };
        let session = Session {
            id: SessionId::new(),
            subject_id: SubjectId::new(),
            is_active: true,
        };
        let store = MemoryStore::new();
        if enrolled {
            store.enroll(student.id, session.subject_id).unwrap();
        }
        Fixture {
            population: Population::new(vec![student.clone()]),
            session,
            student,
            store,
        }
    }

    fn decide_with<S, A>(f: &Fixture, store: &S, probes: &[Embedding], archive: &A) -> Decision
    where
        S: AttendanceStore,
        A: FrameArchive,
    {
        DecisionEngine::new(T)
            .unwrap()
            .decide_probes(
                probes,
                &f.session,
                &f.population,
                store,
                CaptureMethod::Kiosk,
                archive,
            )
            .unwrap()
    }

    fn run(f: &Fixture, probes: &[Embedding]) -> Decision {
        decide_with(f, &f.store, probes, &NoArchive)
    }

    /// Extractor keyed by the first byte of each frame.
    struct FakeExtractor(HashMap<u8, Option<Embedding>>);

    impl Extractor for FakeExtractor {
        fn extract(&mut self, frame: &[u8]) -> Result<Option<Embedding>, ExtractError> {
            let key = frame.first().copied().unwrap_or(0);
            self.0
                .get(&key)
                .cloned()
                .ok_or_else(|| ExtractError::Decode(format!("unknown frame {key}")))
        }
    }

    /// Writes each saved frame index to a file in `dir`.
    struct DirArchive {
        dir: PathBuf,
        discarded: RefCell<Vec<String>>,
    }

    impl DirArchive {
        fn new(dir: &std::path::Path) -> Self {
            Self {
                dir: dir.to_path_buf(),
                discarded: RefCell::new(Vec::new()),
            }
        }

        fn files(&self) -> usize {
            std::fs::read_dir(&self.dir).unwrap().count()
        }
    }

    impl FrameArchive for DirArchive {
        fn save(&self, index: usize) -> Option<String> {
            let path = self.dir.join(format!("probe-{index}-{}.jpg", self.files()));
            std::fs::write(&path, b"frame").unwrap();
            Some(path.to_string_lossy().into_owned())
        }

        fn discard(&self, path: &str) {
            std::fs::remove_file(path).unwrap();
            self.discarded.borrow_mut().push(path.to_string());
        }
    }

    #[test]
    fn test_matched_creates_one_record() {
        let f = fixture(true);
        let d = run(&f, &[probe_scoring(0.70)]);
        assert_eq!(d.outcome.status, OutcomeStatus::Matched);
        assert_eq!(d.outcome.identity.as_ref().map(|i| i.id), Some(f.student.id));
        assert!((d.outcome.score.unwrap() - 0.70).abs() < 1e-5);
        let record = d.outcome.record.unwrap();
        assert_eq!(record.identity_id, f.student.id);
        assert_eq!(record.session_id, f.session.id);
        assert_eq!(f.store.record_count().unwrap(), 1);
    }

    #[test]
    fn test_repeat_submission_is_already_marked() {
        let f = fixture(true);
        assert_eq!(run(&f, &[probe_scoring(0.70)]).outcome.status, OutcomeStatus::Matched);

        let again = run(&f, &[probe_scoring(0.70)]);
        assert_eq!(again.outcome.status, OutcomeStatus::AlreadyMarked);
        assert!(again.outcome.record.is_some());
        assert_eq!(f.store.record_count().unwrap(), 1);
    }

    #[test]
    fn test_already_marked_precedes_threshold() {
        let f = fixture(true);
        run(&f, &[probe_scoring(0.90)]);
        let low = run(&f, &[probe_scoring(0.30)]);
        assert_eq!(low.outcome.status, OutcomeStatus::AlreadyMarked);
        // The stored score is never rewritten.
        assert!((low.outcome.record.unwrap().similarity - 0.90).abs() < 1e-5);
    }

    #[test]
    fn test_not_enrolled_writes_nothing() {
        let f = fixture(false);
        let d = run(&f, &[probe_scoring(0.70)]);
        assert_eq!(d.outcome.status, OutcomeStatus::NotEnrolled);
        assert_eq!(f.store.record_count().unwrap(), 0);
    }

    #[test]
    fn test_below_threshold_is_unresolved_with_score() {
        let f = fixture(true);
        let d = run(&f, &[probe_scoring(0.50)]);
        assert_eq!(d.outcome.status, OutcomeStatus::Unresolved);
        assert!((d.outcome.score.unwrap() - 0.50).abs() < 1e-5);
        assert!(d.outcome.record.is_none());
        assert_eq!(f.store.record_count().unwrap(), 0);
    }

    #[test]
    fn test_below_threshold_and_not_enrolled_is_unresolved() {
        let f = fixture(false);
        let d = run(&f, &[probe_scoring(0.50)]);
        assert_eq!(d.outcome.status, OutcomeStatus::Unresolved);
    }

    #[test]
    fn test_score_equal_to_threshold_matches() {
        let f = fixture(true);
        let probe = Embedding::new(vec![T, (1.0 - T * T).sqrt()], 2).unwrap();
        let centroids = compute_centroids(&f.population);
        let centroid = centroids.get(f.student.id).unwrap();
        let score = crate::matcher::similarity(&probe, centroid).unwrap();

        let d = DecisionEngine::new(score)
            .unwrap()
            .decide_probes(
                &[probe],
                &f.session,
                &f.population,
                &f.store,
                CaptureMethod::Kiosk,
                &NoArchive,
            )
            .unwrap();
        assert_eq!(d.outcome.status, OutcomeStatus::Matched);
    }

    #[test]
    fn test_no_probes_is_no_face() {
        let f = fixture(true);
        let d = run(&f, &[]);
        assert_eq!(d.outcome, Outcome::bare(OutcomeStatus::NoFace));
        assert_eq!(d.frame, None);
        assert_eq!(f.store.record_count().unwrap(), 0);
    }

    #[test]
    fn test_empty_population_is_no_embeddings() {
        let mut f = fixture(true);
        f.population = Population::default();
        let d = run(&f, &[probe_scoring(0.99)]);
        assert_eq!(d.outcome.status, OutcomeStatus::NoEmbeddings);
        assert_eq!(f.store.record_count().unwrap(), 0);
    }

    #[test]
    fn test_inactive_session_rejected() {
        let mut f = fixture(true);
        f.session.is_active = false;
        let err = DecisionEngine::new(T)
            .unwrap()
            .decide_probes(
                &[probe_scoring(0.9)],
                &f.session,
                &f.population,
                &f.store,
                CaptureMethod::Kiosk,
                &NoArchive,
            )
            .unwrap_err();
        assert!(matches!(err, DecideError::InactiveSession(_)));
    }

    #[test]
    fn test_invalid_threshold() {
        assert_eq!(DecisionEngine::new(1.5).err(), Some(InvalidThreshold(1.5)));
        assert!(DecisionEngine::new(f32::NAN).is_err());
    }

    #[test]
    fn test_decide_all_frames_without_face() {
        let f = fixture(true);
        let mut extractor = FakeExtractor(HashMap::from([(0, None)]));
        let frames = vec![vec![0u8], vec![0u8]];
        let d = DecisionEngine::new(T)
            .unwrap()
            .decide(&mut extractor, &frames, &f.session, &f.population, &f.store, &NoArchive)
            .unwrap();
        assert_eq!(d.outcome.status, OutcomeStatus::NoFace);
        assert_eq!(f.store.record_count().unwrap(), 0);
    }

    #[test]
    fn test_decide_maps_winning_frame_and_archives_it() {
        let f = fixture(true);
        let mut extractor = FakeExtractor(HashMap::from([
            (0, None),
            (1, Some(probe_scoring(0.70))),
            (2, Some(probe_scoring(0.95))),
        ]));
        let frames = vec![vec![0u8], vec![1u8], vec![0u8], vec![2u8]];
        let archive = |i: usize| Some(format!("probe-{i}.jpg"));
        let d = DecisionEngine::new(T)
            .unwrap()
            .decide(&mut extractor, &frames, &f.session, &f.population, &f.store, &archive)
            .unwrap();
        assert_eq!(d.outcome.status, OutcomeStatus::Matched);
        assert_eq!(d.frame, Some(3));
        let record = d.outcome.record.unwrap();
        assert_eq!(record.probe_path.as_deref(), Some("probe-3.jpg"));
        assert_eq!(record.method, CaptureMethod::KioskMultiCam);
    }

    #[test]
    fn test_decide_rejects_corrupt_frame() {
        let f = fixture(true);
        let mut extractor = FakeExtractor(HashMap::from([(1, Some(probe_scoring(0.9)))]));
        let frames = vec![vec![1u8], vec![7u8]];
        let err = DecisionEngine::new(T)
            .unwrap()
            .decide(&mut extractor, &frames, &f.session, &f.population, &f.store, &NoArchive)
            .unwrap_err();
        assert!(matches!(err, DecideError::Extraction { frame: 1, .. }));
        assert_eq!(f.store.record_count().unwrap(), 0);
    }

    #[test]
    fn test_concurrent_decides_create_exactly_one_record() {
        let f = Arc::new(fixture(true));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let f = Arc::clone(&f);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    run(&f, &[probe_scoring(0.80)]).outcome.status
                })
            })
            .collect();
        let statuses: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let matched = statuses.iter().filter(|s| **s == OutcomeStatus::Matched).count();
        let already = statuses.iter().filter(|s| **s == OutcomeStatus::AlreadyMarked).count();
        assert_eq!(matched, 1);
        assert_eq!(already, 7);
        assert_eq!(f.store.record_count().unwrap(), 1);
    }

    /// Store whose `find_record` always misses, forcing the insert path to
    /// detect the duplicate.
    struct StaleReads<'a>(&'a MemoryStore);

    impl AttendanceStore for StaleReads<'_> {
        fn is_enrolled(&self, identity: IdentityId, session: &Session) -> Result<bool, StoreError> {
            self.0.is_enrolled(identity, session)
        }

        fn find_record(
            &self,
            _: SessionId,
            _: IdentityId,
        ) -> Result<Option<AttendanceRecord>, StoreError> {
            Ok(None)
        }

        fn create_record(&self, record: NewRecord) -> Result<AttendanceRecord, CreateError> {
            self.0.create_record(record)
        }
    }

    #[test]
    fn test_duplicate_insert_maps_to_already_marked() {
        let f = fixture(true);
        let store = StaleReads(&f.store);
        let first = decide_with(&f, &store, &[probe_scoring(0.8)], &NoArchive);
        assert_eq!(first.outcome.status, OutcomeStatus::Matched);
        let second = decide_with(&f, &store, &[probe_scoring(0.8)], &NoArchive);
        assert_eq!(second.outcome.status, OutcomeStatus::AlreadyMarked);
        assert_eq!(f.store.record_count().unwrap(), 1);
    }

    #[test]
    fn test_lost_race_discards_archived_frame() {
        let f = fixture(true);
        let store = StaleReads(&f.store);
        let dir = tempfile::tempdir().unwrap();
        let archive = DirArchive::new(dir.path());

        let first = decide_with(&f, &store, &[probe_scoring(0.8)], &archive);
        assert_eq!(first.outcome.status, OutcomeStatus::Matched);
        let kept = first.outcome.record.unwrap().probe_path.unwrap();
        assert!(std::path::Path::new(&kept).exists());

        let second = decide_with(&f, &store, &[probe_scoring(0.8)], &archive);
        assert_eq!(second.outcome.status, OutcomeStatus::AlreadyMarked);
        assert_eq!(second.outcome.record.unwrap().probe_path.as_deref(), Some(kept.as_str()));

        // Only the winner's frame remains on disk.
        assert_eq!(archive.files(), 1);
        assert_eq!(archive.discarded.borrow().len(), 1);
        assert_ne!(archive.discarded.borrow()[0], kept);
    }

    #[test]
    fn test_outcome_wire_format() {
        let json = serde_json::to_value(Outcome::bare(OutcomeStatus::NoFace)).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "no_face" }));
        for status in [
            OutcomeStatus::NoFace,
            OutcomeStatus::NoEmbeddings,
            OutcomeStatus::AlreadyMarked,
            OutcomeStatus::Unresolved,
            OutcomeStatus::NotEnrolled,
            OutcomeStatus::Matched,
        ] {
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::Value::String(status.as_str().to_string())
            );
        }
    }
}
