//! Annotated output images.

use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::{Path, PathBuf};
use vigil_core::session::{FaceReport, VerificationReport};
use vigil_core::BoundingBox;

const ACCEPTED: Rgb<u8> = Rgb([0, 255, 0]);
const REJECTED: Rgb<u8> = Rgb([255, 0, 0]);
const CAPTION_TEXT: Rgb<u8> = Rgb([255, 255, 255]);
const LINE_WIDTH: i64 = 2;
const CAPTION_SCALE: f32 = 18.0;
/// Bar height used when no font could be loaded.
const CAPTION_FALLBACK_HEIGHT: i64 = 14;
const CAPTION_PADDING: i64 = 10;
const OUTPUT_STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Draws boxes and `label (confidence)` captions onto verified images.
pub struct Annotator {
    font: Option<FontVec>,
    scale: PxScale,
}

impl Annotator {
    /// Load the caption font. A missing or unreadable font only disables
    /// caption text; boxes and caption bars are still drawn.
    pub fn new(font_path: &Path) -> Self {
        let font = std::fs::read(font_path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| FontVec::try_from_vec(bytes).map_err(|e| e.to_string()));
        match font {
            Ok(font) => Self::with_font(Some(font)),
            Err(reason) => {
                tracing::warn!(font = %font_path.display(), %reason, "caption font unavailable; drawing boxes only");
                Self::with_font(None)
            }
        }
    }

    fn with_font(font: Option<FontVec>) -> Self {
        Self {
            font,
            scale: PxScale::from(CAPTION_SCALE),
        }
    }

    /// One box and caption per face: green when accepted, red otherwise.
    pub fn annotate(&self, image: &mut RgbImage, report: &VerificationReport) {
        for face in &report.faces {
            let colour = if face.is_accepted() { ACCEPTED } else { REJECTED };
            draw_box(image, &face.face.bbox, colour);
            self.draw_caption(image, face, colour);
        }
    }

    /// Filled bar in the box colour sitting on the box's top edge, with the
    /// caption in white on top of it.
    fn draw_caption(&self, image: &mut RgbImage, face: &FaceReport, colour: Rgb<u8>) {
        let Some((x1, y1, x2, _)) = clamp_box(image, &face.face.bbox) else {
            return;
        };
        let text = face.caption();
        let (text_w, text_h) = match &self.font {
            Some(font) => {
                let (w, h) = text_size(self.scale, font, &text);
                (i64::from(w), i64::from(h))
            }
            None => (x2 - x1 + 1, CAPTION_FALLBACK_HEIGHT),
        };

        let top = y1 - text_h - CAPTION_PADDING;
        let Some(bar) = rect(x1, top, x1 + text_w - 1, y1 - 1) else {
            return;
        };
        draw_filled_rect_mut(image, bar, colour);

        if let Some(font) = &self.font {
            draw_text_mut(
                image,
                CAPTION_TEXT,
                bar.left(),
                (y1 - text_h - CAPTION_PADDING / 2) as i32,
                self.scale,
                font,
                &text,
            );
        }
    }
}

/// Outline `bbox` with a `LINE_WIDTH` stroke, clipped to the image.
pub fn draw_box(image: &mut RgbImage, bbox: &BoundingBox, colour: Rgb<u8>) {
    let Some((x1, y1, x2, y2)) = clamp_box(image, bbox) else {
        return;
    };
    for t in 0..LINE_WIDTH {
        match rect(x1 + t, y1 + t, x2 - t, y2 - t) {
            Some(r) => draw_hollow_rect_mut(image, r, colour),
            None => break,
        }
    }
}

/// Box corners widened to i64 and pulled into a band just outside the image,
/// so off-image edges stay off-image and no drawing loop is unbounded.
/// `None` for an inverted box.
fn clamp_box(image: &RgbImage, bbox: &BoundingBox) -> Option<(i64, i64, i64, i64)> {
    let margin = LINE_WIDTH + 1;
    let (w, h) = (i64::from(image.width()), i64::from(image.height()));
    let cx = |v: i32| i64::from(v).clamp(-margin, w + margin);
    let cy = |v: i32| i64::from(v).clamp(-margin, h + margin);
    let (x1, y1, x2, y2) = (cx(bbox.x1), cy(bbox.y1), cx(bbox.x2), cy(bbox.y2));
    (x1 <= x2 && y1 <= y2).then_some((x1, y1, x2, y2))
}

/// Inclusive corners to an imageproc `Rect`, `None` when empty or out of range.
fn rect(x1: i64, y1: i64, x2: i64, y2: i64) -> Option<Rect> {
    if x2 < x1 || y2 < y1 {
        return None;
    }
    let left = i32::try_from(x1).ok()?;
    let top = i32::try_from(y1).ok()?;
    let width = u32::try_from(x2 - x1 + 1).ok()?;
    let height = u32::try_from(y2 - y1 + 1).ok()?;
    Some(Rect::at(left, top).of_size(width, height))
}

/// `<dir>/output_recognized_<stamp>.jpg`, with a numeric suffix if taken.
pub fn output_path(dir: &Path, stamp: &str) -> PathBuf {
    let base = format!("output_recognized_{stamp}");
    let mut path = dir.join(format!("{base}.jpg"));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{base}_{n}.jpg"));
        n += 1;
    }
    path
}

/// Annotate `image` and save it under `dir`. Returns the written path.
pub fn write_annotated(
    mut image: RgbImage,
    report: &VerificationReport,
    annotator: &Annotator,
    dir: &Path,
) -> Result<PathBuf> {
    annotator.annotate(&mut image, report);
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let stamp = chrono::Local::now().format(OUTPUT_STAMP_FORMAT).to_string();
    let out = output_path(dir, &stamp);
    image
        .save(&out)
        .with_context(|| format!("saving {}", out.display()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{DetectedFace, Embedding, Label, MatchVerdict};

    const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

    fn face(bbox: BoundingBox, accepted: bool) -> FaceReport {
        FaceReport {
            face_index: 0,
            face: DetectedFace {
                bbox,
                det_score: 0.9,
                embedding: Embedding::new(vec![1.0]),
            },
            outcome: Ok(MatchVerdict {
                label: if accepted {
                    Label::Identity("alice".into())
                } else {
                    Label::Unauthorised
                },
                confidence: 0.5,
                is_accepted: accepted,
            }),
        }
    }

    fn report(faces: Vec<FaceReport>) -> VerificationReport {
        VerificationReport {
            source: "x".into(),
            timestamp: "t".into(),
            any_unauthorised: faces.iter().any(|f| !f.is_accepted()),
            faces,
        }
    }

    #[test]
    fn test_annotate_colours() {
        let mut image = RgbImage::new(40, 20);
        let report = report(vec![
            face(BoundingBox::new(1, 1, 10, 10), true),
            face(BoundingBox::new(20, 1, 30, 10), false),
        ]);
        Annotator::with_font(None).annotate(&mut image, &report);

        assert_eq!(*image.get_pixel(1, 5), ACCEPTED);
        assert_eq!(*image.get_pixel(2, 5), ACCEPTED);
        assert_eq!(*image.get_pixel(10, 5), ACCEPTED);
        assert_eq!(*image.get_pixel(20, 5), REJECTED);
        // Interior untouched.
        assert_eq!(*image.get_pixel(5, 5), BLACK);
    }

    #[test]
    fn test_caption_bar_sits_above_box() {
        let mut image = RgbImage::new(60, 80);
        let report = report(vec![face(BoundingBox::new(10, 40, 40, 70), false)]);
        Annotator::with_font(None).annotate(&mut image, &report);

        // Bar spans y = 40 - 14 - 10 ..= 39 over the box's width.
        assert_eq!(*image.get_pixel(10, 16), REJECTED);
        assert_eq!(*image.get_pixel(25, 30), REJECTED);
        assert_eq!(*image.get_pixel(40, 39), REJECTED);
        assert_eq!(*image.get_pixel(25, 15), BLACK);
        assert_eq!(*image.get_pixel(41, 30), BLACK);
        assert_eq!(*image.get_pixel(25, 55), BLACK);
    }

    #[test]
    fn test_missing_font_still_annotates() {
        let annotator = Annotator::new(Path::new("/nonexistent/vigil-font.ttf"));
        assert!(annotator.font.is_none());

        let mut image = RgbImage::new(30, 30);
        annotator.annotate(&mut image, &report(vec![face(BoundingBox::new(5, 20, 25, 28), true)]));
        assert_eq!(*image.get_pixel(5, 24), ACCEPTED);
    }

    #[test]
    fn test_box_clipped_to_image() {
        let mut image = RgbImage::new(10, 10);
        draw_box(&mut image, &BoundingBox::new(-5, -5, 50, 50), REJECTED);
        assert_eq!(*image.get_pixel(0, 0), BLACK);
        assert_eq!(*image.get_pixel(9, 9), BLACK);
    }

    #[test]
    fn test_extreme_coordinates_do_not_overflow() {
        let mut image = RgbImage::new(10, 10);
        let inverted = BoundingBox::from_f32(0.0, 0.0, 5.0, f32::MIN);
        assert_eq!(inverted.y2, i32::MIN);
        draw_box(&mut image, &inverted, REJECTED);
        assert!(image.pixels().all(|p| *p == BLACK));

        let huge = BoundingBox::new(2, 2, i32::MAX, i32::MAX);
        Annotator::with_font(None).annotate(&mut image, &report(vec![face(huge, false)]));
        assert_eq!(*image.get_pixel(2, 5), REJECTED);
        assert_eq!(*image.get_pixel(3, 5), REJECTED);
        assert_eq!(*image.get_pixel(5, 5), BLACK);
    }

    #[test]
    fn test_write_annotated_without_faces() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("output_img");
        let out = write_annotated(
            RgbImage::new(16, 16),
            &report(vec![]),
            &Annotator::with_font(None),
            &out_dir,
        )
        .unwrap();

        assert!(out.starts_with(&out_dir));
        let name = out.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("output_recognized_") && name.ends_with(".jpg"));
        assert_eq!(image::open(&out).unwrap().to_rgb8().dimensions(), (16, 16));
    }

    #[test]
    fn test_output_path_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let first = output_path(dir.path(), "2024-01-01_00-00-00");
        assert!(first.ends_with("output_recognized_2024-01-01_00-00-00.jpg"));
        std::fs::write(&first, b"").unwrap();
        let second = output_path(dir.path(), "2024-01-01_00-00-00");
        assert!(second.ends_with("output_recognized_2024-01-01_00-00-00_1.jpg"));
    }
}
