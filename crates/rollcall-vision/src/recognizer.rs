//! ArcFace embedding model (w600k_r50).

use crate::alignment::ALIGNED_SIZE;
use crate::VisionError;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const MEAN: f32 = 127.5;
const STD: f32 = 127.5;
pub const EMBEDDING_DIM: usize = 512;

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, VisionError> {
        if !model_path.exists() {
            return Err(VisionError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "ArcFace recognizer loaded"
        );
        Ok(Self { session })
    }

    /// Embed an aligned 112×112 crop. The result is L2-normalized.
    pub fn embed(&mut self, aligned: &RgbImage) -> Result<Vec<f32>, VisionError> {
        let input = to_tensor(aligned);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| VisionError::InferenceFailed(format!("embedding output: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(VisionError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        normalize(raw.to_vec())
    }
}

fn to_tensor(aligned: &RgbImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in aligned.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        if x >= size || y >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, y, x]] = (pixel[c] as f32 - MEAN) / STD;
        }
    }
    tensor
}

fn normalize(mut values: Vec<f32>) -> Result<Vec<f32>, VisionError> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(VisionError::InferenceFailed("degenerate embedding output".into()));
    }
    values.iter_mut().for_each(|v| *v /= norm);
    Ok(values)
}
