//! Enrollment and verification flows.
//!
//! Verification of one image/frame walks
//! `Idle → Detecting → PerFaceScoring → Recording → Rendering → Done`.
//! Rendering belongs to the caller, which receives a [`VerificationReport`].

use crate::alert::Notifier;
use crate::events::{EventLogError, EventRecord, EventSink, TIMESTAMP_FORMAT};
use crate::matcher::{CosineMatcher, MatchError, Matcher};
use crate::provider::{EmbeddingProvider, ProviderError};
use crate::registry::{self, RegistryError, RegistryStore};
use crate::types::{DetectedFace, IdentityTemplate, MatchVerdict};
use image::RgbImage;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("cannot read image {path}: {reason}")]
    ImageReadFailure { path: PathBuf, reason: String },
    #[error("no face detected in {0}")]
    NoFaceDetected(PathBuf),
    #[error("embedding provider failed: {0}")]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    EventLog(#[from] EventLogError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Detecting,
    PerFaceScoring,
    Recording,
    Rendering,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Detecting => "detecting",
            Stage::PerFaceScoring => "per_face_scoring",
            Stage::Recording => "recording",
            Stage::Rendering => "rendering",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Scoring outcome for one detected face.
#[derive(Debug, Clone)]
pub struct FaceReport {
    pub face_index: usize,
    pub face: DetectedFace,
    pub outcome: Result<MatchVerdict, MatchError>,
}

impl FaceReport {
    pub fn is_accepted(&self) -> bool {
        matches!(&self.outcome, Ok(v) if v.is_accepted)
    }

    /// Label text and confidence for display.
    pub fn caption(&self) -> String {
        match &self.outcome {
            Ok(v) => format!("{} ({:.2})", v.label, v.confidence),
            Err(_) => "Unscored".to_string(),
        }
    }
}

/// Everything the caller needs to render one verified image/frame.
#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub source: String,
    pub timestamp: String,
    pub faces: Vec<FaceReport>,
    pub any_unauthorised: bool,
}

/// Ties provider, registry, event sink and notifier together.
pub struct Session<P, S, N> {
    provider: P,
    store: RegistryStore,
    sink: S,
    notifier: N,
    threshold: f32,
    matcher: CosineMatcher,
}

impl<P, S, N> Session<P, S, N>
where
    P: EmbeddingProvider,
    S: EventSink,
    N: Notifier,
{
    pub fn new(provider: P, store: RegistryStore, sink: S, notifier: N, threshold: f32) -> Self {
        Self {
            provider,
            store,
            sink,
            notifier,
            threshold,
            matcher: CosineMatcher,
        }
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    /// Enroll `name` from the most confident face in the image at `path`.
    ///
    /// Nothing is written unless a face was found.
    pub fn enroll(&mut self, name: &str, path: &Path) -> Result<IdentityTemplate, SessionError> {
        registry::validate_name(name)?;
        let image = load_image(path)?;

        let faces = self.provider.detect(&image)?;
        tracing::info!(name, image = %path.display(), faces = faces.len(), "enroll: detection done");

        let best = faces
            .into_iter()
            .max_by(|a, b| {
                a.det_score
                    .partial_cmp(&b.det_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .ok_or_else(|| SessionError::NoFaceDetected(path.to_path_buf()))?;

        tracing::debug!(det_score = best.det_score, bbox = ?best.bbox, "enroll: face selected");
        Ok(self.store.enroll(name, &best.embedding)?)
    }

    /// Verify every face in the image at `path`.
    pub fn verify(&mut self, path: &Path) -> Result<VerificationReport, SessionError> {
        let source = path.display().to_string();
        let image = load_image(path)?;
        self.verify_frame(&source, &image)
    }

    /// Verify every face in an already decoded image/frame.
    ///
    /// The registry is reloaded from disk on every call.
    pub fn verify_frame(
        &mut self,
        source: &str,
        image: &RgbImage,
    ) -> Result<VerificationReport, SessionError> {
        let span = tracing::info_span!("verify", source);
        let _enter = span.enter();

        let mut stage = Stage::Idle;
        let registry = self.store.load_all()?;

        advance(&mut stage, Stage::Detecting);
        let faces = self.provider.detect(image)?;
        let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
        tracing::info!(faces = faces.len(), enrolled = registry.len(), "faces detected");

        advance(&mut stage, Stage::PerFaceScoring);
        let mut any_unauthorised = false;
        let mut reports = Vec::with_capacity(faces.len());
        for (face_index, face) in faces.into_iter().enumerate() {
            let outcome = self
                .matcher
                .compare(&face.embedding, &registry, self.threshold);
            match &outcome {
                Ok(verdict) => {
                    tracing::info!(
                        face_index,
                        label = %verdict.label,
                        confidence = verdict.confidence,
                        accepted = verdict.is_accepted,
                        "face scored"
                    );
                    any_unauthorised |= !verdict.is_accepted;
                }
                Err(e) => {
                    tracing::warn!(face_index, error = %e, "face could not be scored");
                    any_unauthorised = true;
                }
            }
            reports.push(FaceReport {
                face_index,
                face,
                outcome,
            });
        }

        advance(&mut stage, Stage::Recording);
        let recorded = self.record(source, &timestamp, &reports);

        if any_unauthorised {
            self.notifier.notify_unauthorised();
        }
        recorded?;

        advance(&mut stage, Stage::Rendering);
        advance(&mut stage, Stage::Done);

        Ok(VerificationReport {
            source: source.to_string(),
            timestamp,
            faces: reports,
            any_unauthorised,
        })
    }

    fn record(
        &self,
        source: &str,
        timestamp: &str,
        reports: &[FaceReport],
    ) -> Result<(), EventLogError> {
        for report in reports {
            let face = &report.face;
            let record = match &report.outcome {
                Ok(verdict) => EventRecord::scored(
                    timestamp,
                    source,
                    report.face_index,
                    face.bbox,
                    face.det_score,
                    verdict,
                ),
                Err(_) => EventRecord::unscored(
                    timestamp,
                    source,
                    report.face_index,
                    face.bbox,
                    face.det_score,
                ),
            };
            if let Err(e) = self.sink.append(&record) {
                tracing::error!(face_index = report.face_index, error = %e, "event not recorded");
                return Err(e);
            }
        }
        Ok(())
    }
}

fn advance(stage: &mut Stage, next: Stage) {
    tracing::debug!(from = %stage, to = %next, "stage");
    *stage = next;
}

/// Decode an image file into RGB.
pub fn load_image(path: &Path) -> Result<RgbImage, SessionError> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|e| SessionError::ImageReadFailure {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}
