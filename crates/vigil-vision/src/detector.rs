//! SCRFD face detector (insightface `det_10g`) via ONNX Runtime.
//!
//! Three-stride anchor-free decoding with five-point landmarks and NMS.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
/// Outputs are grouped as [scores × 3, boxes × 3, landmarks × 3].
const SCRFD_OUTPUTS: usize = SCRFD_STRIDES.len() * 3;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A face found by the detector, in source image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
    /// [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: [(f32, f32); 5],
}

impl Detection {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

pub struct FaceDetector {
    session: Session,
    score_threshold: f32,
}

impl FaceDetector {
    /// Load the SCRFD model. Faces scoring at or below `score_threshold` are dropped.
    pub fn load(model_path: &Path, score_threshold: f32) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let outputs = session.outputs().len();
        tracing::info!(path = %model_path.display(), outputs, "loaded SCRFD model");

        if outputs < SCRFD_OUTPUTS {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model with landmarks needs {SCRFD_OUTPUTS} outputs, got {outputs}"
            )));
        }

        Ok(Self {
            session,
            score_threshold,
        })
    }

    /// Detect faces, most confident first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        let (input, det_scale) = preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (level, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };
            let scores = extract(level, "scores")?;
            let boxes = extract(level + SCRFD_STRIDES.len(), "boxes")?;
            let kps = extract(level + 2 * SCRFD_STRIDES.len(), "landmarks")?;

            candidates.extend(decode_level(
                scores,
                boxes,
                kps,
                stride,
                det_scale,
                self.score_threshold,
            ));
        }

        let faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), "SCRFD detection done");
        Ok(faces)
    }
}

/// Resize into the 640×640 input keeping aspect ratio, anchored top-left,
/// and normalize to NCHW RGB. Returns the tensor and the resize factor.
fn preprocess(image: &RgbImage) -> (Array4<f32>, f32) {
    let (w, h) = image.dimensions();
    let size = SCRFD_INPUT_SIZE;
    let (new_w, new_h) = if h > w {
        (((size as f32 * w as f32 / h as f32) as u32).max(1), size)
    } else {
        (size, ((size as f32 * h as f32 / w as f32) as u32).max(1))
    };
    let det_scale = new_h as f32 / h.max(1) as f32;

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let side = size as usize;
    // Unfilled area stays black.
    let mut tensor = Array4::<f32>::from_elem((1, 3, side, side), (0.0 - SCRFD_MEAN) / SCRFD_STD);
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, det_scale)
}

/// Decode one stride level back into source image coordinates.
fn decode_level(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    det_scale: f32,
    threshold: f32,
) -> Vec<Detection> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    (0..anchors.min(scores.len()))
        .filter(|&i| scores[i] > threshold)
        .filter(|&i| (i + 1) * 4 <= boxes.len() && (i + 1) * 10 <= kps.len())
        .map(|i| {
            let cell = i / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * s;
            let cy = (cell / grid) as f32 * s;

            let d = &boxes[i * 4..i * 4 + 4];
            let k = &kps[i * 10..i * 10 + 10];
            let landmarks = std::array::from_fn(|p| {
                (
                    (cx + k[p * 2] * s) / det_scale,
                    (cy + k[p * 2 + 1] * s) / det_scale,
                )
            });

            Detection {
                x1: (cx - d[0] * s) / det_scale,
                y1: (cy - d[1] * s) / det_scale,
                x2: (cx + d[2] * s) / det_scale,
                y2: (cy + d[3] * s) / det_scale,
                score: scores[i],
                landmarks,
            }
        })
        .collect()
}

/// Greedy non-maximum suppression, highest score first.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &Detection, b: &Detection) -> f32 {
    let iw = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let ih = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = iw * ih;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Detection {
        Detection {
            x1,
            y1,
            x2,
            y2,
            score,
            landmarks: [(0.0, 0.0); 5],
        }
    }

    #[test]
    fn test_iou() {
        let a = det(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = det(5.0, 0.0, 15.0, 10.0, 1.0);
        let c = det(20.0, 20.0, 30.0, 30.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(iou(&a, &c), 0.0);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let kept = nms(
            vec![
                det(5.0, 5.0, 105.0, 105.0, 0.8),
                det(200.0, 200.0, 250.0, 250.0, 0.7),
                det(0.0, 0.0, 100.0, 100.0, 0.9),
            ],
            0.4,
        );
        let scores: Vec<f32> = kept.iter().map(|d| d.score).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
    }

    #[test]
    fn test_preprocess_landscape() {
        let image = RgbImage::from_pixel(320, 160, image::Rgb([255, 128, 0]));
        let (tensor, scale) = preprocess(&image);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((scale - 2.0).abs() < 1e-6);

        // Inside the resized area: channel order is RGB.
        assert!((tensor[[0, 0, 10, 10]] - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-2);
        assert!((tensor[[0, 2, 10, 10]] - (0.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-2);
        // Below the resized area: black padding.
        assert!((tensor[[0, 0, 500, 10]] - (0.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-5);
    }

    #[test]
    fn test_preprocess_portrait_scale() {
        let image = RgbImage::new(100, 400);
        let (_, scale) = preprocess(&image);
        assert!((scale - 1.6).abs() < 1e-6);
    }

    #[test]
    fn test_decode_level_maps_back_to_source() {
        let stride = 32;
        let grid = 640 / stride;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut boxes = vec![0.0f32; anchors * 4];
        let kps = vec![0.0f32; anchors * 10];

        // Cell (x=2, y=1), second anchor.
        let idx = (grid + 2) * SCRFD_ANCHORS_PER_CELL + 1;
        scores[idx] = 0.95;
        boxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let dets = decode_level(&scores, &boxes, &kps, stride, 2.0, 0.5);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        // Anchor centre (64, 32) in input space, ±32 px, then halved.
        assert!((d.x1 - 16.0).abs() < 1e-5);
        assert!((d.y1 - 0.0).abs() < 1e-5);
        assert!((d.x2 - 48.0).abs() < 1e-5);
        assert!((d.y2 - 32.0).abs() < 1e-5);
        assert_eq!(d.landmarks[0], (32.0, 16.0));
    }

    #[test]
    fn test_decode_level_threshold_and_short_outputs() {
        let scores = vec![0.5, 0.9];
        // Box data only covers the first anchor.
        let boxes = vec![0.0; 4];
        let kps = vec![0.0; 10];
        assert!(decode_level(&scores, &boxes, &kps, 32, 1.0, 0.5).is_empty());
    }

    #[test]
    fn test_load_missing_model() {
        let err = FaceDetector::load(Path::new("/nonexistent/det_10g.onnx"), 0.5).err();
        assert!(matches!(err, Some(DetectorError::ModelNotFound(_))));
    }
}
