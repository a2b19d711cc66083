use crate::alignment::align_face;
use crate::detector::{Detection, FaceDetector};
use crate::recognizer::{FaceRecognizer, EMBEDDING_DIM};
use crate::VisionError;
use image::RgbImage;
use rollcall_core::{Embedding, ExtractError, Extractor};
use std::path::Path;

/// Smallest face (pixels per side) accepted in a training image.
pub const ENROLL_MIN_FACE_SIZE: u32 = 100;

/// Detector + recognizer pair, loaded once and reused for every frame.
pub struct FaceExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    /// Faces narrower or shorter than this (pixels) are ignored.
    min_face_size: f32,
    enroll_min_face_size: f32,
}

impl FaceExtractor {
    /// Load both models. Fails fast if either file is missing.
    pub fn load(
        detector_path: &Path,
        recognizer_path: &Path,
        min_face_size: u32,
    ) -> Result<Self, VisionError> {
        Ok(Self {
            detector: FaceDetector::load(detector_path)?,
            recognizer: FaceRecognizer::load(recognizer_path)?,
            min_face_size: min_face_size as f32,
            enroll_min_face_size: ENROLL_MIN_FACE_SIZE.max(min_face_size) as f32,
        })
    }

    /// Override the minimum face size for training images. Never lower
    /// than the matching minimum.
    pub fn with_enroll_min_face_size(mut self, size: u32) -> Self {
        self.enroll_min_face_size = (size as f32).max(self.min_face_size);
        self
    }

    fn detect(&mut self, frame: &[u8]) -> Result<(RgbImage, Vec<Detection>), ExtractError> {
        let image = image::load_from_memory(frame)
            .map_err(|e| ExtractError::Decode(e.to_string()))?
            .to_rgb8();
        let faces = self
            .detector
            .detect(&image)
            .map_err(|e| ExtractError::Inference(e.to_string()))?;
        Ok((image, faces))
    }

    fn embed(&mut self, image: &RgbImage, face: &Detection) -> Result<Embedding, ExtractError> {
        tracing::debug!(
            score = face.score,
            width = face.width(),
            height = face.height(),
            "face selected"
        );
        let aligned = align_face(image, &face.landmarks);
        let values = self
            .recognizer
            .embed(&aligned)
            .map_err(|e| ExtractError::Inference(e.to_string()))?;
        Embedding::new(values, EMBEDDING_DIM).map_err(|e| ExtractError::Inference(e.to_string()))
    }

    pub fn embedding_dim(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Largest face by box area among those at least `min_size` on both sides.
pub fn largest_face(detections: &[Detection], min_size: f32) -> Option<&Detection> {
    detections
        .iter()
        .filter(|d| d.width() >= min_size && d.height() >= min_size)
        .max_by(|a, b| a.area().total_cmp(&b.area()))
}

/// The only face at least `min_size` on both sides. `Err` carries the count
/// when there is more than one.
pub fn single_face(detections: &[Detection], min_size: f32) -> Result<Option<&Detection>, usize> {
    let mut usable = detections
        .iter()
        .filter(|d| d.width() >= min_size && d.height() >= min_size);
    let first = usable.next();
    match usable.count() {
        0 => Ok(first),
        more => Err(more + 1),
    }
}

impl Extractor for FaceExtractor {
    fn extract(&mut self, frame: &[u8]) -> Result<Option<Embedding>, ExtractError> {
        let (image, faces) = self.detect(frame)?;
        let Some(face) = largest_face(&faces, self.min_face_size) else {
            tracing::debug!(detected = faces.len(), "no usable face in frame");
            return Ok(None);
        };
        self.embed(&image, face).map(Some)
    }

    fn extract_enrollment(&mut self, frame: &[u8]) -> Result<Option<Embedding>, ExtractError> {
        let (image, faces) = self.detect(frame)?;
        match single_face(&faces, self.enroll_min_face_size) {
            Ok(Some(face)) => self.embed(&image, face).map(Some),
            Ok(None) => {
                tracing::debug!(
                    detected = faces.len(),
                    min_size = self.enroll_min_face_size,
                    "no face large enough for training"
                );
                Ok(None)
            }
            Err(count) => Err(ExtractError::MultipleFaces(count)),
        }
    }
}
