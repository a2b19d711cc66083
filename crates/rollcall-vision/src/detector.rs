//! SCRFD face detector.
//!
//! Letterboxes the frame to 640×640, decodes the three anchor-free stride
//! heads (8, 16, 32; two anchors per cell) and suppresses overlaps.

use crate::VisionError;
use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: u32 = 640;
const MEAN: f32 = 127.5;
const STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// A detected face in original frame coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
    /// Left eye, right eye, nose, left mouth corner, right mouth corner.
    pub landmarks: [(f32, f32); 5],
}

impl Detection {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    fn iou(&self, other: &Detection) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Maps letterboxed coordinates back to the source frame.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((INPUT_SIZE as f32 - new_w) / 2.0).floor(),
            pad_y: ((INPUT_SIZE as f32 - new_h) / 2.0).floor(),
        }
    }

    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

pub struct FaceDetector {
    session: Session,
    /// (score, bbox, kps) output positions per stride.
    heads: [(usize, usize, usize); 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, VisionError> {
        if !model_path.exists() {
            return Err(VisionError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(VisionError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }
        let heads = output_heads(&names);
        tracing::info!(
            path = %model_path.display(),
            outputs = ?names,
            ?heads,
            "SCRFD detector loaded"
        );

        Ok(Self { session, heads })
    }

    /// Detect faces, highest score first.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, VisionError> {
        let letterbox = Letterbox::fit(frame.width(), frame.height());
        let input = letterbox_tensor(frame, &letterbox);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut found = Vec::new();
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in STRIDES.iter().zip(&self.heads) {
            let tensor = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        VisionError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };
            let scores = tensor(score_idx, "scores")?;
            let boxes = tensor(bbox_idx, "boxes")?;
            let kps = tensor(kps_idx, "landmarks")?;
            found.extend(decode_stride(scores, boxes, kps, stride, &letterbox));
        }

        Ok(suppress(found))
    }
}

/// Resolve head positions from names like `score_8`, falling back to the
/// usual export order (scores, boxes, landmarks; each by ascending stride).
fn output_heads(names: &[String]) -> [(usize, usize, usize); 3] {
    let find = |kind: &str, stride: usize| {
        names.iter().position(|n| *n == format!("{kind}_{stride}"))
    };
    let mut heads = [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
    for (slot, &stride) in STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride), find("kps", stride)) {
            (Some(s), Some(b), Some(k)) => heads[slot] = (s, b, k),
            _ => return [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
        }
    }
    heads
}

fn letterbox_tensor(frame: &RgbImage, letterbox: &Letterbox) -> Array4<f32> {
    let size = INPUT_SIZE as usize;
    let new_w = ((frame.width() as f32 * letterbox.scale).round() as u32).clamp(1, INPUT_SIZE);
    let new_h = ((frame.height() as f32 * letterbox.scale).round() as u32).clamp(1, INPUT_SIZE);
    let resized = imageops::resize(frame, new_w, new_h, imageops::FilterType::Triangle);

    // Padding normalizes to zero.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (ox + x as usize, oy + y as usize);
        if tx >= size || ty >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - MEAN) / STD;
        }
    }
    tensor
}

fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
) -> Vec<Detection> {
    let grid = INPUT_SIZE as usize / stride;
    let step = stride as f32;
    let anchors = grid * grid * ANCHORS_PER_CELL;

    (0..anchors.min(scores.len()))
        .filter(|&i| scores[i] > SCORE_THRESHOLD)
        .filter_map(|i| {
            let b = boxes.get(i * 4..i * 4 + 4)?;
            let k = kps.get(i * 10..i * 10 + 10)?;
            let cell = i / ANCHORS_PER_CELL;
            let ax = (cell % grid) as f32 * step;
            let ay = (cell / grid) as f32 * step;

            let (x1, y1) = letterbox.unmap(ax - b[0] * step, ay - b[1] * step);
            let (x2, y2) = letterbox.unmap(ax + b[2] * step, ay + b[3] * step);
            let mut landmarks = [(0.0, 0.0); 5];
            for (p, lm) in landmarks.iter_mut().enumerate() {
                *lm = letterbox.unmap(ax + k[p * 2] * step, ay + k[p * 2 + 1] * step);
            }
            Some(Detection {
                x1,
                y1,
                x2,
                y2,
                score: scores[i],
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression, highest score first.
fn suppress(mut detections: Vec<Detection>) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for d in detections {
        if kept.iter().all(|k| k.iou(&d) <= NMS_THRESHOLD) {
            kept.push(d);
        }
    }
    kept
}
