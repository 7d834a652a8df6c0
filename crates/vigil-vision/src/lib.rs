//! vigil-vision — Face detection and embedding via ONNX Runtime.
//!
//! SCRFD (`det_10g.onnx`) finds faces and landmarks, each face is aligned to
//! the ArcFace template, and ArcFace (`w600k_r50.onnx`) embeds it.

pub mod alignment;
pub mod detector;
pub mod recognizer;

pub use detector::{DetectorError, FaceDetector};
pub use recognizer::{FaceRecognizer, RecognizerError};

use image::RgbImage;
use std::path::Path;
use vigil_core::{BoundingBox, DetectedFace, EmbeddingProvider, ProviderError};

const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

impl From<DetectorError> for ProviderError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::ModelNotFound(path) => ProviderError::ModelNotFound(path),
            other => ProviderError::InferenceFailed(format!("detector: {other}")),
        }
    }
}

impl From<RecognizerError> for ProviderError {
    fn from(e: RecognizerError) -> Self {
        match e {
            RecognizerError::ModelNotFound(path) => ProviderError::ModelNotFound(path),
            other => ProviderError::InferenceFailed(format!("recognizer: {other}")),
        }
    }
}

/// Detector + aligner + recognizer behind the [`EmbeddingProvider`] contract.
pub struct OnnxProvider {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxProvider {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path, detection_threshold: f32) -> Result<Self, ProviderError> {
        let detector = FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE), detection_threshold)?;
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl EmbeddingProvider for OnnxProvider {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, ProviderError> {
        let detections = self.detector.detect(image)?;

        let mut faces = Vec::with_capacity(detections.len());
        for det in detections {
            let aligned = alignment::align_face(image, &det.landmarks);
            let embedding = self.recognizer.embed(&aligned)?;
            faces.push(DetectedFace {
                bbox: BoundingBox::from_f32(det.x1, det.y1, det.x2, det.y2),
                det_score: det.score,
                embedding,
            });
        }
        Ok(faces)
    }
}
