//! Similarity scoring and single-frame match selection.

use crate::centroid::{Centroid, CentroidTable};
use crate::types::{Embedding, IdentityId};
use serde::Serialize;

/// Cosine similarity between a unit probe and a unit centroid.
///
/// Both sides are expected to be normalized already, so this is the plain dot
/// product, in [-1, 1]. Returns `None` when the dimensions differ.
pub fn similarity(probe: &Embedding, centroid: &Centroid) -> Option<f32> {
    if probe.dim() != centroid.dim() {
        return None;
    }
    Some(
        probe
            .values()
            .iter()
            .zip(centroid.values())
            .map(|(a, b)| a * b)
            .sum(),
    )
}

/// Best-scoring identity for one probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Candidate {
    pub identity: IdentityId,
    pub score: f32,
}

impl Candidate {
    /// Total preference order: higher score, then lower identity id.
    pub fn beats(&self, other: &Candidate) -> bool {
        match self.score.partial_cmp(&other.score) {
            Some(std::cmp::Ordering::Greater) => true,
            Some(std::cmp::Ordering::Equal) => self.identity < other.identity,
            _ => false,
        }
    }
}

/// Strategy for picking the best identity for a probe.
pub trait Matcher {
    fn best(&self, probe: &Embedding, centroids: &CentroidTable) -> Option<Candidate>;
}

/// Cosine matcher over the whole centroid table.
///
/// Always scores every entry; there is no early exit on a strong match.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best(&self, probe: &Embedding, centroids: &CentroidTable) -> Option<Candidate> {
        let mut best: Option<Candidate> = None;

        for (identity, centroid) in centroids.iter() {
            let Some(score) = similarity(probe, centroid) else {
                tracing::debug!(
                    identity = %identity,
                    probe_dim = probe.dim(),
                    centroid_dim = centroid.dim(),
                    "dimension mismatch; centroid not comparable"
                );
                continue;
            };
            let candidate = Candidate { identity, score };
            if best.map_or(true, |b| candidate.beats(&b)) {
                best = Some(candidate);
            }
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn emb(v: &[f32]) -> Embedding {
        Embedding::new(v.to_vec(), v.len()).unwrap()
    }

    fn centroid(v: &[f32]) -> Centroid {
        Centroid::from_embeddings(&[emb(v)]).unwrap()
    }

    fn id(n: u128) -> IdentityId {
        IdentityId(Uuid::from_u128(n))
    }

    #[test]
    fn test_similarity_identical() {
        let s = similarity(&emb(&[0.6, 0.8]), &centroid(&[0.6, 0.8])).unwrap();
        assert!((s - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_orthogonal_and_opposite() {
        assert!(similarity(&emb(&[1.0, 0.0]), &centroid(&[0.0, 1.0])).unwrap().abs() < 1e-6);
        let opposite = similarity(&emb(&[1.0, 0.0]), &centroid(&[-1.0, 0.0])).unwrap();
        assert!((opposite + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_bounded_for_unit_vectors() {
        let vectors = [
            [1.0, 0.0, 0.0],
            [0.0, 0.6, 0.8],
            [0.577_350_3, 0.577_350_3, 0.577_350_3],
            [-0.8, 0.0, 0.6],
        ];
        for a in &vectors {
            for b in &vectors {
                let s = similarity(&emb(a), &centroid(b)).unwrap();
                assert!((-1.0 - 1e-6..=1.0 + 1e-6).contains(&s), "score {s} out of range");
            }
        }
    }

    #[test]
    fn test_similarity_dimension_mismatch() {
        assert!(similarity(&emb(&[1.0, 0.0]), &centroid(&[1.0, 0.0, 0.0])).is_none());
    }

    #[test]
    fn test_matcher_picks_highest_score() {
        // Probe P against A (scores 0.40) and B (scores 0.72).
        let probe = emb(&[1.0, 0.0]);
        let a = centroid(&[0.40, (1.0f32 - 0.16).sqrt()]);
        let b = centroid(&[0.72, (1.0f32 - 0.5184).sqrt()]);
        let table: CentroidTable = [(id(1), a), (id(2), b)].into_iter().collect();

        let best = CosineMatcher.best(&probe, &table).unwrap();
        assert_eq!(best.identity, id(2));
        assert!((best.score - 0.72).abs() < 1e-5);
    }

    #[test]
    fn test_matcher_scans_whole_table() {
        // Best match is the last entry.
        let probe = emb(&[1.0, 0.0, 0.0]);
        let table: CentroidTable = [
            (id(1), centroid(&[0.0, 1.0, 0.0])),
            (id(2), centroid(&[0.0, 0.0, 1.0])),
            (id(3), centroid(&[1.0, 0.0, 0.0])),
        ]
        .into_iter()
        .collect();

        let best = CosineMatcher.best(&probe, &table).unwrap();
        assert_eq!(best.identity, id(3));
    }

    #[test]
    fn test_matcher_tie_goes_to_lowest_id() {
        let probe = emb(&[1.0, 0.0]);
        let table: CentroidTable = [
            (id(9), centroid(&[1.0, 0.0])),
            (id(4), centroid(&[1.0, 0.0])),
        ]
        .into_iter()
        .collect();

        assert_eq!(CosineMatcher.best(&probe, &table).unwrap().identity, id(4));
    }

    #[test]
    fn test_matcher_empty_table() {
        assert!(CosineMatcher.best(&emb(&[1.0, 0.0]), &CentroidTable::default()).is_none());
    }

    #[test]
    fn test_candidate_ordering() {
        let low = Candidate {
            identity: id(1),
            score: 0.5,
        };
        let high = Candidate {
            identity: id(2),
            score: 0.9,
        };
        assert!(high.beats(&low));
        assert!(!low.beats(&high));
        let tie = Candidate {
            identity: id(3),
            score: 0.9,
        };
        assert!(high.beats(&tie));
        assert!(!tie.beats(&high));
        assert!(!high.beats(&high));
    }
}
