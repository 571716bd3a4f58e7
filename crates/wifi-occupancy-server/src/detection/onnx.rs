//! YOLO person detector on ONNX Runtime.
//!
//! Expects an Ultralytics-style export: one `[1, 3, S, S]` float input in
//! RGB order scaled to `0..1`, and one `[1, 4 + C, N]` output where each of
//! the `N` candidate columns holds `cx, cy, w, h` followed by `C` class
//! scores. Frames are letterboxed to `S x S`, candidates are decoded back to
//! source pixels and filtered with greedy per-class NMS.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ort::session::Session;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{Detection, Detector};
use crate::error::InferenceError;

/// Default square input size of YOLO exports.
pub const DEFAULT_INPUT_SIZE: u32 = 640;

const IOU_THRESHOLD: f32 = 0.45;
const LETTERBOX_FILL: u8 = 114;

/// ONNX Runtime YOLO detector.
pub struct OnnxDetector {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    input_size: u32,
    score_threshold: f32,
}

impl OnnxDetector {
    /// Load a model from `path`. Candidates below `score_threshold` are
    /// discarded before NMS.
    pub fn from_file(path: &Path, score_threshold: f32) -> Result<Self, InferenceError> {
        info!(?path, "Loading ONNX detector");
        let load_err = |message: String| InferenceError::ModelLoad {
            path: path.to_path_buf(),
            message,
        };

        let session = Session::builder()
            .map_err(|e| load_err(format!("Failed to create session builder: {e}")))?
            .commit_from_file(path)
            .map_err(|e| load_err(format!("Failed to load model: {e}")))?;

        let input_name = session
            .inputs()
            .first()
            .map(|i| i.name().to_string())
            .ok_or_else(|| load_err("model has no inputs".into()))?;
        let output_name = session
            .outputs()
            .first()
            .map(|o| o.name().to_string())
            .ok_or_else(|| load_err("model has no outputs".into()))?;

        info!(input = %input_name, output = %output_name, "ONNX detector ready");

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            input_size: DEFAULT_INPUT_SIZE,
            score_threshold,
        })
    }

    fn run(&self, input: Vec<f32>) -> Result<(Vec<i64>, Vec<f32>), InferenceError> {
        let s = i64::from(self.input_size);
        let tensor = ort::value::Tensor::from_array((vec![1, 3, s, s], input))
            .map_err(|e| InferenceError::model(format!("Failed to create input tensor: {e}")))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .map_err(|e| InferenceError::model(e.to_string()))?;
        let output = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| InferenceError::model(format!("missing output '{}'", self.output_name)))?;
        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::model(e.to_string()))?;
        Ok((shape.iter().copied().collect(), data.to_vec()))
    }
}

impl Detector for OnnxDetector {
    fn name(&self) -> &str {
        "onnx-yolo"
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, InferenceError> {
        let letterbox = Letterbox::fit(image.width(), image.height(), self.input_size);
        let input = letterbox.tensor(image);
        let (shape, data) = self.run(input)?;

        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            return Err(InferenceError::OutputShape { shape });
        }
        let rows = shape[1] as usize;
        let cols = shape[2] as usize;
        if data.len() != rows * cols {
            return Err(InferenceError::OutputShape { shape });
        }

        let candidates = decode_candidates(&data, rows, cols, self.score_threshold, &letterbox);
        let kept = non_max_suppression(candidates, IOU_THRESHOLD);
        debug!(kept = kept.len(), "YOLO detections");
        Ok(kept)
    }
}

/// Geometry of a source → square letterbox mapping.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    src_w: u32,
    src_h: u32,
    size: u32,
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(src_w: u32, src_h: u32, size: u32) -> Self {
        let scale = (size as f32 / src_w.max(1) as f32).min(size as f32 / src_h.max(1) as f32);
        let new_w = (src_w as f32 * scale).round();
        let new_h = (src_h as f32 * scale).round();
        Self {
            src_w,
            src_h,
            size,
            scale,
            pad_x: ((size as f32 - new_w) / 2.0).floor(),
            pad_y: ((size as f32 - new_h) / 2.0).floor(),
        }
    }

    /// NCHW float tensor, RGB, 0..1.
    fn tensor(&self, image: &RgbImage) -> Vec<f32> {
        let new_w = ((self.src_w as f32 * self.scale).round() as u32).clamp(1, self.size);
        let new_h = ((self.src_h as f32 * self.scale).round() as u32).clamp(1, self.size);
        let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

        let mut canvas = RgbImage::from_pixel(self.size, self.size, Rgb([LETTERBOX_FILL; 3]));
        imageops::overlay(&mut canvas, &resized, i64::from(self.pad_x as u32), i64::from(self.pad_y as u32));

        let plane = (self.size * self.size) as usize;
        let mut out = vec![0.0f32; plane * 3];
        for (i, px) in canvas.pixels().enumerate() {
            out[i] = f32::from(px[0]) / 255.0;
            out[plane + i] = f32::from(px[1]) / 255.0;
            out[2 * plane + i] = f32::from(px[2]) / 255.0;
        }
        out
    }

    /// Map a letterbox-space box back to source pixels.
    fn unmap(&self, cx: f32, cy: f32, w: f32, h: f32) -> [f32; 4] {
        let x1 = (cx - w / 2.0 - self.pad_x) / self.scale;
        let y1 = (cy - h / 2.0 - self.pad_y) / self.scale;
        let x2 = (cx + w / 2.0 - self.pad_x) / self.scale;
        let y2 = (cy + h / 2.0 - self.pad_y) / self.scale;
        let max_x = self.src_w as f32;
        let max_y = self.src_h as f32;
        [
            x1.clamp(0.0, max_x),
            y1.clamp(0.0, max_y),
            x2.clamp(0.0, max_x),
            y2.clamp(0.0, max_y),
        ]
    }
}

/// Decode a `[4 + C, N]` row-major output into scored candidates.
fn decode_candidates(
    data: &[f32],
    rows: usize,
    cols: usize,
    score_threshold: f32,
    letterbox: &Letterbox,
) -> Vec<Detection> {
    let classes = rows - 4;
    let at = |r: usize, c: usize| data[r * cols + c];

    (0..cols)
        .filter_map(|c| {
            let (class_id, score) = (0..classes)
                .map(|k| (k, at(4 + k, c)))
                .max_by(|a, b| a.1.total_cmp(&b.1))?;
            if score < score_threshold {
                return None;
            }
            let bbox = letterbox.unmap(at(0, c), at(1, c), at(2, c), at(3, c));
            Some(Detection {
                class_id: class_id as u32,
                class_name: coco_name(class_id).to_string(),
                confidence: score,
                bbox,
            })
        })
        .collect()
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = ix * iy;
    let area = |r: &[f32; 4]| (r[2] - r[0]).max(0.0) * (r[3] - r[1]).max(0.0);
    let union = area(a) + area(b) - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Greedy per-class NMS, highest confidence first.
fn non_max_suppression(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for cand in candidates {
        let overlaps = kept
            .iter()
            .any(|k| k.class_id == cand.class_id && iou(&k.bbox, &cand.bbox) > iou_threshold);
        if !overlaps {
            kept.push(cand);
        }
    }
    kept
}

fn coco_name(class_id: usize) -> &'static str {
    match class_id {
        0 => "person",
        1 => "bicycle",
        2 => "car",
        3 => "motorcycle",
        15 => "cat",
        16 => "dog",
        56 => "chair",
        57 => "couch",
        62 => "tv",
        _ => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letterbox_geometry() {
        let lb = Letterbox::fit(320, 240, 640);
        assert_eq!(lb.scale, 2.0);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 80.0);
        let b = lb.unmap(320.0, 320.0, 64.0, 64.0);
        assert_eq!(b, [144.0, 104.0, 176.0, 136.0]);
    }

    #[test]
    fn decode_picks_best_class() {
        // 4 box rows + 2 classes, 2 candidates.
        let rows = 6;
        let cols = 2;
        let data = vec![
            100.0, 300.0, // cx
            100.0, 300.0, // cy
            20.0, 20.0, // w
            40.0, 40.0, // h
            0.9, 0.1, // person
            0.2, 0.05, // bicycle
        ];
        let lb = Letterbox::fit(640, 640, 640);
        let dets = decode_candidates(&data, rows, cols, 0.25, &lb);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_name, "person");
        assert_eq!(dets[0].bbox, [90.0, 80.0, 110.0, 120.0]);
    }

    #[test]
    fn nms_suppresses_overlaps() {
        let d = |conf: f32, x: f32| Detection {
            class_id: 0,
            class_name: "person".into(),
            confidence: conf,
            bbox: [x, 0.0, x + 10.0, 10.0],
        };
        let kept = non_max_suppression(vec![d(0.6, 1.0), d(0.9, 0.0), d(0.8, 50.0)], 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.8);
    }
}
