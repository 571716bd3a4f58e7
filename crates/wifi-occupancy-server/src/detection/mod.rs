//! Camera frame → person count.
//!
//! [`DetectionPipeline::process`] decodes the device's JPEG, runs the
//! configured [`Detector`], keeps person-class detections at or above the
//! confidence threshold, and re-encodes an annotated copy of the frame.
//!
//! Detectors are pluggable. Without a model the server runs with
//! [`NullDetector`], which reports an empty scene; the `onnx` feature adds a
//! YOLO-family detector backed by ONNX Runtime.

pub mod annotate;
#[cfg(feature = "onnx")]
pub mod onnx;

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{DecodeError, DetectionError, InferenceError};
use crate::protocol::FrameMessage;

/// COCO class id of "person".
pub const PERSON_CLASS_ID: u32 = 0;

/// A single detector output in source-image pixel space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Detector class id
    pub class_id: u32,
    /// Detector class label
    pub class_name: String,
    /// Confidence in [0, 1]
    pub confidence: f32,
    /// `[x1, y1, x2, y2]`
    pub bbox: [f32; 4],
}

impl Detection {
    /// Whether this detection is of the person class.
    pub fn is_person(&self) -> bool {
        self.class_id == PERSON_CLASS_ID || self.class_name.eq_ignore_ascii_case("person")
    }
}

/// Pluggable object detector.
pub trait Detector: Send + Sync {
    /// Detector name for logs and the health endpoint.
    fn name(&self) -> &str;

    /// Detect objects in `image`. Output may contain any class and any
    /// confidence; filtering is done by the pipeline.
    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, InferenceError>;
}

/// Detector that never sees anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDetector;

impl Detector for NullDetector {
    fn name(&self) -> &str {
        "null"
    }

    fn detect(&self, _image: &RgbImage) -> Result<Vec<Detection>, InferenceError> {
        Ok(Vec::new())
    }
}

/// Output of one frame through the pipeline. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    /// Retained person detections
    pub detections: Vec<Detection>,
    /// `detections.len()`
    pub people_count: u32,
    /// Mean confidence of retained detections
    pub mean_confidence: Option<f64>,
    /// Annotated frame, JPEG
    pub annotated_jpeg: Bytes,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Frame arrival time
    pub timestamp: DateTime<Utc>,
}

/// Decode → detect → filter → annotate.
#[derive(Clone)]
pub struct DetectionPipeline {
    detector: Arc<dyn Detector>,
    confidence_threshold: f32,
    jpeg_quality: u8,
}

impl DetectionPipeline {
    /// Create a pipeline.
    pub fn new(detector: Arc<dyn Detector>, confidence_threshold: f32, jpeg_quality: u8) -> Self {
        Self {
            detector,
            confidence_threshold,
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    /// Name of the underlying detector.
    pub fn detector_name(&self) -> &str {
        self.detector.name()
    }

    /// Process one frame.
    pub fn process(&self, frame: &FrameMessage) -> Result<DetectionResult, DetectionError> {
        let mut image = image::load_from_memory(&frame.data)
            .map_err(|e| DecodeError::new(e.to_string()))?
            .to_rgb8();
        let (width, height) = image.dimensions();

        let detections: Vec<Detection> = self
            .detector
            .detect(&image)?
            .into_iter()
            .filter(|d| d.confidence >= self.confidence_threshold && d.is_person())
            .map(|d| clamp_to_image(d, width, height))
            .collect();

        let people_count = detections.len() as u32;
        let mean_confidence = (!detections.is_empty()).then(|| {
            detections.iter().map(|d| f64::from(d.confidence)).sum::<f64>() / detections.len() as f64
        });

        annotate::draw_detections(&mut image, &detections);
        let annotated_jpeg = annotate::encode_jpeg(&image, self.jpeg_quality)?;

        Ok(DetectionResult {
            detections,
            people_count,
            mean_confidence,
            annotated_jpeg,
            width,
            height,
            timestamp: frame.received_at,
        })
    }
}

impl std::fmt::Debug for DetectionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionPipeline")
            .field("detector", &self.detector.name())
            .field("confidence_threshold", &self.confidence_threshold)
            .field("jpeg_quality", &self.jpeg_quality)
            .finish()
    }
}

fn clamp_to_image(mut d: Detection, width: u32, height: u32) -> Detection {
    let max_x = width.saturating_sub(1) as f32;
    let max_y = height.saturating_sub(1) as f32;
    d.bbox = [
        d.bbox[0].clamp(0.0, max_x),
        d.bbox[1].clamp(0.0, max_y),
        d.bbox[2].clamp(0.0, max_x),
        d.bbox[3].clamp(0.0, max_y),
    ];
    d
}

/// Build the detector for `model_path`.
///
/// Falls back to [`NullDetector`] when no model is configured, the `onnx`
/// feature is disabled, or the model fails to load.
pub fn build_detector(model_path: Option<&Path>, confidence_threshold: f32) -> Arc<dyn Detector> {
    let Some(path) = model_path else {
        warn!("No detector model configured, camera counts will always be 0");
        return Arc::new(NullDetector);
    };

    #[cfg(feature = "onnx")]
    {
        match onnx::OnnxDetector::from_file(path, confidence_threshold) {
            Ok(detector) => {
                info!(path = %path.display(), "Loaded ONNX detector");
                Arc::new(detector)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Detector model unusable, using null detector");
                Arc::new(NullDetector)
            }
        }
    }

    #[cfg(not(feature = "onnx"))]
    {
        let _ = confidence_threshold;
        info!(path = %path.display(), "Built without the `onnx` feature");
        warn!("Detector model ignored, camera counts will always be 0");
        Arc::new(NullDetector)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Rgb;

    /// Detector returning a fixed list regardless of input.
    pub(crate) struct FixedDetector(pub Vec<Detection>);

    impl Detector for FixedDetector {
        fn name(&self) -> &str {
            "fixed"
        }

        fn detect(&self, _image: &RgbImage) -> Result<Vec<Detection>, InferenceError> {
            Ok(self.0.clone())
        }
    }

    struct FailingDetector;

    impl Detector for FailingDetector {
        fn name(&self) -> &str {
            "failing"
        }

        fn detect(&self, _image: &RgbImage) -> Result<Vec<Detection>, InferenceError> {
            Err(InferenceError::model("tensor mismatch"))
        }
    }

    pub(crate) fn det(class_id: u32, name: &str, confidence: f32) -> Detection {
        Detection {
            class_id,
            class_name: name.to_string(),
            confidence,
            bbox: [10.0, 10.0, 40.0, 50.0],
        }
    }

    pub(crate) fn test_jpeg(width: u32, height: u32) -> Bytes {
        let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
        annotate::encode_jpeg(&img, 90).expect("encode test frame")
    }

    fn frame(data: Bytes) -> FrameMessage {
        FrameMessage {
            data,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn empty_scene_counts_zero() {
        let pipeline = DetectionPipeline::new(Arc::new(NullDetector), 0.25, 85);
        let result = pipeline.process(&frame(test_jpeg(64, 48))).unwrap();
        assert_eq!(result.people_count, 0);
        assert!(result.detections.is_empty());
        assert_eq!(result.mean_confidence, None);
        assert_eq!((result.width, result.height), (64, 48));
        assert!(!result.annotated_jpeg.is_empty());
    }

    #[test]
    fn only_confident_people_are_counted() {
        let detector = FixedDetector(vec![
            det(0, "person", 0.9),
            det(0, "person", 0.7),
            det(0, "person", 0.1),
            det(2, "car", 0.95),
            det(56, "chair", 0.8),
        ]);
        let pipeline = DetectionPipeline::new(Arc::new(detector), 0.25, 85);
        let result = pipeline.process(&frame(test_jpeg(64, 64))).unwrap();
        assert_eq!(result.people_count, 2);
        assert!(result.detections.iter().all(Detection::is_person));
        let mean = result.mean_confidence.unwrap();
        assert!((mean - 0.8).abs() < 1e-6);
    }

    #[test]
    fn non_person_only_scene_is_empty() {
        let pipeline = DetectionPipeline::new(Arc::new(FixedDetector(vec![det(2, "car", 0.99)])), 0.25, 85);
        let result = pipeline.process(&frame(test_jpeg(32, 32))).unwrap();
        assert_eq!(result.people_count, 0);
        assert!(result.detections.is_empty());
    }

    #[test]
    fn garbage_bytes_are_decode_errors() {
        let pipeline = DetectionPipeline::new(Arc::new(NullDetector), 0.25, 85);
        let err = pipeline
            .process(&frame(Bytes::from_static(b"definitely not a jpeg")))
            .unwrap_err();
        assert!(matches!(err, DetectionError::Decode(_)));
    }

    #[test]
    fn detector_failure_is_inference_error() {
        let pipeline = DetectionPipeline::new(Arc::new(FailingDetector), 0.25, 85);
        let err = pipeline.process(&frame(test_jpeg(16, 16))).unwrap_err();
        assert!(matches!(err, DetectionError::Inference(_)));
    }

    #[test]
    fn processing_is_deterministic() {
        let pipeline = DetectionPipeline::new(
            Arc::new(FixedDetector(vec![det(0, "person", 0.8)])),
            0.25,
            85,
        );
        let f = frame(test_jpeg(64, 64));
        assert_eq!(pipeline.process(&f).unwrap(), pipeline.process(&f).unwrap());
    }

    #[test]
    fn boxes_are_clamped_to_frame() {
        let mut d = det(0, "person", 0.9);
        d.bbox = [-5.0, -3.0, 500.0, 400.0];
        let pipeline = DetectionPipeline::new(Arc::new(FixedDetector(vec![d])), 0.25, 85);
        let result = pipeline.process(&frame(test_jpeg(64, 48))).unwrap();
        assert_eq!(result.detections[0].bbox, [0.0, 0.0, 63.0, 47.0]);
    }
}
