//! rollcall-vision — Probe embedding extraction.
//!
//! Decodes a frame, detects faces with SCRFD, aligns the largest one and
//! embeds it with ArcFace. Training images must instead hold exactly one
//! face of at least 100×100 pixels. Both models run on ONNX Runtime (CPU).

pub mod alignment;
pub mod detector;
pub mod extractor;
pub mod recognizer;

pub use detector::{Detection, FaceDetector};
pub use extractor::{FaceExtractor, ENROLL_MIN_FACE_SIZE};
pub use recognizer::FaceRecognizer;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("model file not found: {0} (place the insightface ONNX models in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}
