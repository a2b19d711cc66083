//! Centroid aggregation: one unit-length representative vector per identity.

use crate::types::{Embedding, IdentityId, Population};

/// Normalized mean of an identity's embeddings.
#[derive(Debug, Clone, PartialEq)]
pub struct Centroid {
    values: Vec<f32>,
}

impl Centroid {
    /// Mean of `embeddings`, re-normalized to unit length.
    ///
    /// Returns `None` for an empty set, mixed dimensions, or a mean whose
    /// norm is exactly zero.
    pub fn from_embeddings(embeddings: &[Embedding]) -> Option<Self> {
        let first = embeddings.first()?;
        let dim = first.dim();
        if embeddings.iter().any(|e| e.dim() != dim) {
            return None;
        }

        let mut mean = vec![0.0f32; dim];
        for emb in embeddings {
            for (m, v) in mean.iter_mut().zip(emb.values()) {
                *m += v;
            }
        }
        let n = embeddings.len() as f32;
        mean.iter_mut().for_each(|m| *m /= n);

        let norm = mean.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm == 0.0 || !norm.is_finite() {
            return None;
        }
        mean.iter_mut().for_each(|m| *m /= norm);
        Some(Self { values: mean })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

/// Identity → centroid mapping for one matching round, sorted by identity id.
#[derive(Debug, Clone, Default)]
pub struct CentroidTable {
    entries: Vec<(IdentityId, Centroid)>,
}

impl CentroidTable {
    pub fn iter(&self) -> impl Iterator<Item = (IdentityId, &Centroid)> {
        self.entries.iter().map(|(id, c)| (*id, c))
    }

    pub fn get(&self, id: IdentityId) -> Option<&Centroid> {
        self.entries
            .binary_search_by_key(&id, |(i, _)| *i)
            .ok()
            .map(|idx| &self.entries[idx].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(IdentityId, Centroid)> for CentroidTable {
    fn from_iter<T: IntoIterator<Item = (IdentityId, Centroid)>>(iter: T) -> Self {
        let mut entries: Vec<_> = iter.into_iter().collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.dedup_by_key(|(id, _)| *id);
        Self { entries }
    }
}

/// Compute a centroid for every identity that has a usable one.
///
/// Identities with no embeddings are skipped silently. Degenerate sets
/// (zero-norm mean, mixed dimensions) are skipped and logged.
pub fn compute_centroids(population: &Population) -> CentroidTable {
    let mut skipped = 0usize;
    let table: CentroidTable = population
        .iter()
        .filter(|identity| !identity.embeddings.is_empty())
        .filter_map(|identity| match Centroid::from_embeddings(&identity.embeddings) {
            Some(c) => Some((identity.id, c)),
            None => {
                skipped += 1;
                tracing::warn!(
                    identity = %identity.id,
                    embeddings = identity.embeddings.len(),
                    "degenerate embedding set; identity excluded from matching"
                );
                None
            }
        })
        .collect();

    tracing::debug!(
        identities = population.len(),
        centroids = table.len(),
        skipped,
        "centroids computed"
    );
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Identity;

    fn emb(v: &[f32]) -> Embedding {
        Embedding::new(v.to_vec(), v.len()).unwrap()
    }

    fn identity(embeddings: Vec<Embedding>) -> Identity {
        Identity {
            id: IdentityId::new(),
            name: "student".into(),
            enrollment_no: None,
            embeddings,
        }
    }

    #[test]
    fn test_centroid_is_unit_length() {
        let c = Centroid::from_embeddings(&[emb(&[1.0, 0.0]), emb(&[0.0, 1.0])]).unwrap();
        let norm: f32 = c.values().iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((c.values()[0] - c.values()[1]).abs() < 1e-6);
    }

    #[test]
    fn test_single_embedding_centroid_equals_embedding() {
        let c = Centroid::from_embeddings(&[emb(&[0.6, 0.8])]).unwrap();
        assert!((c.values()[0] - 0.6).abs() < 1e-6);
        assert!((c.values()[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_cancelling_embeddings_have_no_centroid() {
        assert!(Centroid::from_embeddings(&[emb(&[1.0, 0.0]), emb(&[-1.0, 0.0])]).is_none());
    }

    #[test]
    fn test_empty_set_has_no_centroid() {
        assert!(Centroid::from_embeddings(&[]).is_none());
    }

    #[test]
    fn test_mixed_dimensions_have_no_centroid() {
        assert!(Centroid::from_embeddings(&[emb(&[1.0, 0.0]), emb(&[1.0, 0.0, 0.0])]).is_none());
    }

    #[test]
    fn test_compute_centroids_skips_empty_and_degenerate() {
        let good = identity(vec![emb(&[1.0, 0.0])]);
        let empty = identity(vec![]);
        let degenerate = identity(vec![emb(&[0.0, 1.0]), emb(&[0.0, -1.0])]);
        let pop = Population::new(vec![good.clone(), empty.clone(), degenerate.clone()]);

        let table = compute_centroids(&pop);
        assert_eq!(table.len(), 1);
        assert!(table.get(good.id).is_some());
        assert!(table.get(empty.id).is_none());
        assert!(table.get(degenerate.id).is_none());
    }

    #[test]
    fn test_compute_centroids_empty_population() {
        assert!(compute_centroids(&Population::default()).is_empty());
    }
}
