//! YOLOv8 detector running on ONNX Runtime.
//!
//! Expects an exported YOLOv8 detection model with a single `[1, 3, 640, 640]`
//! input and a `[1, 4 + classes, anchors]` output.

use std::path::Path;

use image::RgbImage;
use image::imageops::FilterType;
use ndarray::{Array, ArrayView, IxDyn};
use ort::{
    session::{Session, builder::GraphOptimizationLevel},
    value::TensorRef,
};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::detector::Detector;
use crate::error::DetectorError;
use crate::types::{BoundingBox, Detection};

const INPUT_SIZE: u32 = 640;
const BASE_CONFIDENCE: f32 = 0.25;
const NMS_IOU: f32 = 0.45;

pub struct YoloV8Detector {
    session: Mutex<Session>,
}

impl YoloV8Detector {
    pub fn new(model_path: &Path) -> Result<Self, DetectorError> {
        info!(model = %model_path.display(), "loading YOLOv8 model");
        let session = Session::builder()
            .map_err(|e| DetectorError::ModelLoad(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| DetectorError::ModelLoad(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| DetectorError::ModelLoad(format!("{}: {e}", model_path.display())))?;
        Ok(Self {
            session: Mutex::new(session),
        })
    }

    /// Resize to the network input and convert to normalized CHW.
    fn preprocess(frame: &RgbImage) -> Array<f32, IxDyn> {
        let resized = image::imageops::resize(frame, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
        let side = INPUT_SIZE as usize;
        let mut input = Array::zeros((1, 3, side, side));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            input[[0, 0, y, x]] = f32::from(pixel[0]) / 255.0;
            input[[0, 1, y, x]] = f32::from(pixel[1]) / 255.0;
            input[[0, 2, y, x]] = f32::from(pixel[2]) / 255.0;
        }
        input.into_dyn()
    }

    fn postprocess(
        output: ArrayView<f32, IxDyn>,
        frame_w: u32,
        frame_h: u32,
    ) -> Result<Vec<Detection>, DetectorError> {
        let shape = output.shape();
        if shape.len() != 3 || shape[1] < 5 {
            return Err(DetectorError::Inference(format!(
                "unexpected output shape {shape:?}"
            )));
        }
        let num_classes = shape[1] - 4;
        let num_anchors = shape[2];
        let scale_x = frame_w as f32 / INPUT_SIZE as f32;
        let scale_y = frame_h as f32 / INPUT_SIZE as f32;

        let mut detections = Vec::new();
        for i in 0..num_anchors {
            let (mut best_class, mut best_score) = (0usize, 0.0f32);
            for c in 0..num_classes {
                let score = output[[0, 4 + c, i]];
                if score > best_score {
                    best_score = score;
                    best_class = c;
                }
            }
            if best_score < BASE_CONFIDENCE {
                continue;
            }

            let cx = output[[0, 0, i]];
            let cy = output[[0, 1, i]];
            let w = output[[0, 2, i]];
            let h = output[[0, 3, i]];
            let bbox = BoundingBox::new(
                ((cx - w / 2.0) * scale_x).max(0.0),
                ((cy - h / 2.0) * scale_y).max(0.0),
                ((cx + w / 2.0) * scale_x).min(frame_w as f32),
                ((cy + h / 2.0) * scale_y).min(frame_h as f32),
            );
            detections.push(Detection::new(bbox, best_score, best_class as u32));
        }

        Ok(non_max_suppression(detections, NMS_IOU))
    }
}

impl Detector for YoloV8Detector {
    fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        let input = Self::preprocess(frame);
        let tensor = TensorRef::from_array_view(&input)
            .map_err(|e| DetectorError::Preprocessing(e.to_string()))?;

        let output = {
            let mut session = self.session.lock();
            let outputs = session
                .run(ort::inputs![tensor])
                .map_err(|e| DetectorError::Inference(e.to_string()))?;
            outputs[0]
                .try_extract_array::<f32>()
                .map_err(|e| DetectorError::Inference(e.to_string()))?
                .into_owned()
        };

        let detections = Self::postprocess(output.view(), frame.width(), frame.height())?;
        debug!(count = detections.len(), "yolov8 detections");
        Ok(detections)
    }

    fn name(&self) -> &str {
        "yolov8-onnx"
    }
}

/// Greedy per-class NMS, highest confidence first.
pub(crate) fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        let suppressed = keep
            .iter()
            .any(|k| k.class_label == det.class_label && k.bbox.iou(&det.bbox) > iou_threshold);
        if !suppressed {
            keep.push(det);
        }
    }
    keep
}
