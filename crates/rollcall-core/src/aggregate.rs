//! Multi-frame aggregation: reduce per-frame best matches to one global best.

use crate::centroid::CentroidTable;
use crate::matcher::{Candidate, Matcher};
use crate::types::{Embedding, IdentityId};

/// Global best across all frames, with the index of the frame it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMatch {
    pub identity: IdentityId,
    pub score: f32,
    pub frame: usize,
}

impl FrameMatch {
    fn candidate(&self) -> Candidate {
        Candidate {
            identity: self.identity,
            score: self.score,
        }
    }

    /// Candidate order, then lower frame index. Total, so the reduction does
    /// not depend on visiting order.
    fn beats(&self, other: &FrameMatch) -> bool {
        let (a, b) = (self.candidate(), other.candidate());
        a.beats(&b) || (!b.beats(&a) && self.frame < other.frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameVerdict {
    /// No probe survived extraction.
    NoFace,
    /// Probes exist but there was nothing to compare them against.
    NoCandidates,
    Best(FrameMatch),
}

/// Run the matcher on every probe and keep the strictly best result.
///
/// Probes are the frames in which a face was found; frames with no face are
/// dropped by the caller before this point.
pub fn aggregate_frames<M: Matcher + ?Sized>(
    probes: &[Embedding],
    centroids: &CentroidTable,
    matcher: &M,
) -> FrameVerdict {
    if probes.is_empty() {
        return FrameVerdict::NoFace;
    }

    let best = probes
        .iter()
        .enumerate()
        .filter_map(|(frame, probe)| {
            let c = matcher.best(probe, centroids)?;
            tracing::debug!(frame, identity = %c.identity, score = c.score, "frame best");
            Some(FrameMatch {
                identity: c.identity,
                score: c.score,
                frame,
            })
        })
        .reduce(|acc, m| if m.beats(&acc) { m } else { acc });

    match best {
        Some(m) => FrameVerdict::Best(m),
        None => FrameVerdict::NoCandidates,
    }
}
