//! Face-embedding extraction contract.

use crate::types::Embedding;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    /// The frame could not be decoded as an image.
    #[error("unsupported or corrupt image: {0}")]
    Decode(String),
    /// A training image must show exactly one face.
    #[error("{0} faces detected; training images must contain exactly one")]
    MultipleFaces(usize),
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Produces one unit-normalized embedding per frame.
///
/// `Ok(None)` means the frame decoded fine but contained no usable face.
pub trait Extractor {
    /// Probe extraction for matching. When several faces are present the
    /// largest one is used.
    fn extract(&mut self, frame: &[u8]) -> Result<Option<Embedding>, ExtractError>;

    /// Stricter extraction for training samples: more than one usable face
    /// is [`ExtractError::MultipleFaces`], and implementations may apply a
    /// larger minimum face size than matching does.
    fn extract_enrollment(&mut self, frame: &[u8]) -> Result<Option<Embedding>, ExtractError> {
        self.extract(frame)
    }
}
