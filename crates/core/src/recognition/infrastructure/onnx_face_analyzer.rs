//! YOLO face detection plus ArcFace embedding through ONNX Runtime.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::recognition::domain::embedding::l2_normalize;
use crate::recognition::domain::face_analyzer::{DetectedFace, FaceAnalyzer};
use crate::recognition::infrastructure::execution_provider::{
    initialize_with_fallback, ExecutionBackend,
};
use crate::shared::bounding_box::BoundingBox;
use crate::shared::frame::Frame;

type AnalyzeError = Box<dyn std::error::Error + Send + Sync>;

/// Fallback detector input resolution when the model doesn't specify dimensions.
const DEFAULT_INPUT_SIZE: u32 = 640;

pub const DEFAULT_CONFIDENCE: f64 = 0.5;

const NMS_IOU_THRESH: f64 = 0.45;

const EMBEDDING_INPUT_SIZE: usize = 112;
const NORM_MEAN: f32 = 127.5;
const NORM_STD: f32 = 127.5;

pub struct OnnxFaceAnalyzer {
    detector: Mutex<ort::session::Session>,
    embedder: Mutex<ort::session::Session>,
    backend: ExecutionBackend,
    confidence: f64,
    input_size: u32,
}

impl OnnxFaceAnalyzer {
    /// Loads both models on the first backend in `backends` that accepts them.
    pub fn new(
        detection_model: &Path,
        embedding_model: &Path,
        backends: &[ExecutionBackend],
        confidence: f64,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let initialized = initialize_with_fallback(backends, |backend| {
            let detector = build_session(detection_model, backend)?;
            let embedder = build_session(embedding_model, backend)?;
            Ok::<_, String>((detector, embedder))
        })?;
        let (detector, embedder) = initialized.value;
        let input_size = model_input_size(&detector).unwrap_or(DEFAULT_INPUT_SIZE);

        Ok(Self {
            detector: Mutex::new(detector),
            embedder: Mutex::new(embedder),
            backend: initialized.backend,
            confidence,
            input_size,
        })
    }

    pub fn backend(&self) -> ExecutionBackend {
        self.backend
    }

    fn detect(&self, frame: &Frame) -> Result<Vec<RawDetection>, AnalyzeError> {
        let (input_tensor, scale, pad_x, pad_y) = letterbox(frame, self.input_size);
        let input_value = ort::value::Tensor::from_array(input_tensor).map_err(to_boxed)?;

        let mut session = lock(&self.detector)?;
        let outputs = session.run(ort::inputs![input_value]).map_err(to_boxed)?;
        if outputs.len() == 0 {
            return Err("detection model produced no outputs".into());
        }
        let tensor = outputs[0].try_extract_array::<f32>().map_err(to_boxed)?;
        let data = tensor.as_slice().ok_or("Cannot get tensor slice")?;

        let mut detections = parse_detections(
            data,
            tensor.shape(),
            self.confidence,
            Letterbox {
                scale,
                pad_x: pad_x as f64,
                pad_y: pad_y as f64,
            },
        )?;
        Ok(nms(&mut detections, NMS_IOU_THRESH))
    }

    fn embed(&self, rgb_data: &[u8], width: u32, height: u32) -> Result<Vec<f32>, AnalyzeError> {
        let tensor = preprocess(rgb_data, width, height);
        let input_value = ort::value::Tensor::from_array(tensor).map_err(to_boxed)?;
        let mut session = lock(&self.embedder)?;
        let outputs = session.run(ort::inputs![input_value]).map_err(to_boxed)?;
        let embedding_array = outputs[0].try_extract_array::<f32>().map_err(to_boxed)?;
        let embedding_slice = embedding_array
            .as_slice()
            .ok_or("Cannot get embedding slice")?;

        let mut embedding = embedding_slice.to_vec();
        l2_normalize(&mut embedding);
        Ok(embedding)
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn analyze(&self, frame: &Frame) -> Result<Vec<DetectedFace>, AnalyzeError> {
        if frame.channels() != 3 {
            return Err(format!("expected RGB frame, got {} channels", frame.channels()).into());
        }
        let detections = self.detect(frame)?;

        let mut faces = Vec::with_capacity(detections.len());
        for det in detections {
            let Some(bbox) = BoundingBox::from_corners(det.x1, det.y1, det.x2, det.y2)
                .clamp_to(frame.width(), frame.height())
            else {
                continue;
            };
            let crop = crop_rgb(frame, &bbox);
            let embedding = self.embed(&crop, bbox.width as u32, bbox.height as u32)?;
            faces.push(DetectedFace { bbox, embedding });
        }
        Ok(faces)
    }
}

fn build_session(
    model_path: &Path,
    backend: ExecutionBackend,
) -> Result<ort::session::Session, String> {
    let intra_threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let build = || -> Result<ort::session::Session, Box<dyn std::error::Error>> {
        Ok(ort::session::Session::builder()?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
            .with_inter_threads(1)?
            .with_intra_threads(intra_threads)?
            .with_execution_providers([backend.dispatch()])?
            .commit_from_file(model_path)?)
    };
    build().map_err(|e| format!("{}: {e}", model_path.display()))
}

/// Square input resolution from an NCHW model input, if static.
fn model_input_size(session: &ort::session::Session) -> Option<u32> {
    session.inputs().first().and_then(|input| {
        if let ort::value::ValueType::Tensor { ref shape, .. } = input.dtype() {
            if shape.len() >= 4 && shape[2] > 0 {
                return Some(shape[2] as u32);
            }
        }
        None
    })
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, AnalyzeError> {
    mutex
        .lock()
        .map_err(|e| format!("Lock poisoned: {e}").into())
}

fn to_boxed(e: impl std::fmt::Display) -> AnalyzeError {
    e.to_string().into()
}

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

/// Letterbox-resize a frame to `target_size` × `target_size`.
///
/// Returns `(NCHW float32 tensor, scale, pad_x, pad_y)`.
fn letterbox(frame: &Frame, target_size: u32) -> (ndarray::Array4<f32>, f64, u32, u32) {
    let fw = frame.width() as f64;
    let fh = frame.height() as f64;
    let target = target_size as f64;

    let scale = (target / fw).min(target / fh);
    let new_w = ((fw * scale).round() as u32).min(target_size);
    let new_h = ((fh * scale).round() as u32).min(target_size);
    let pad_x = (target_size - new_w) / 2;
    let pad_y = (target_size - new_h) / 2;

    // Padding is 114/255 gray, the YOLO convention.
    let gray = 114.0f32 / 255.0;
    let mut tensor =
        ndarray::Array4::<f32>::from_elem((1, 3, target_size as usize, target_size as usize), gray);

    let src = frame.as_ndarray();
    let src_h = frame.height() as usize;
    let src_w = frame.width() as usize;

    for y in 0..new_h as usize {
        let src_y = ((y as f64 / scale) as usize).min(src_h - 1);
        for x in 0..new_w as usize {
            let src_x = ((x as f64 / scale) as usize).min(src_w - 1);
            let ty = pad_y as usize + y;
            let tx = pad_x as usize + x;
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = src[[src_y, src_x, c]] as f32 / 255.0;
            }
        }
    }

    (tensor, scale, pad_x, pad_y)
}

/// Copies the pixels inside `bbox` (already clamped to the frame).
fn crop_rgb(frame: &Frame, bbox: &BoundingBox) -> Vec<u8> {
    let row_bytes = bbox.width as usize * 3;
    let stride = frame.width() as usize * 3;
    let mut out = Vec::with_capacity(row_bytes * bbox.height as usize);
    for row in bbox.y as usize..bbox.bottom() as usize {
        let start = row * stride + bbox.x as usize * 3;
        out.extend_from_slice(&frame.data()[start..start + row_bytes]);
    }
    out
}

/// Resize crop to 112x112, normalize, NCHW layout.
fn preprocess(rgb_data: &[u8], width: u32, height: u32) -> ndarray::Array4<f32> {
    let src_w = width as usize;
    let src_h = height as usize;
    let size = EMBEDDING_INPUT_SIZE;

    let mut tensor = ndarray::Array4::<f32>::zeros((1, 3, size, size));
    if src_w == 0 || src_h == 0 {
        return tensor;
    }

    for y in 0..size {
        let src_y = (((y as f64 + 0.5) * src_h as f64 / size as f64) as usize).min(src_h - 1);
        for x in 0..size {
            let src_x = (((x as f64 + 0.5) * src_w as f64 / size as f64) as usize).min(src_w - 1);
            let offset = (src_y * src_w + src_x) * 3;
            if offset + 2 < rgb_data.len() {
                for c in 0..3 {
                    tensor[[0, c, y, x]] = (rgb_data[offset + c] as f32 - NORM_MEAN) / NORM_STD;
                }
            }
        }
    }

    tensor
}

// ---------------------------------------------------------------------------
// Postprocessing
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
struct Letterbox {
    scale: f64,
    pad_x: f64,
    pad_y: f64,
}

#[derive(Clone, Debug)]
struct RawDetection {
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
    confidence: f64,
}

/// Decodes `[1, features, detections]` or `[1, detections, features]` YOLO
/// output rows of `[cx, cy, w, h, conf, ...]` into frame coordinates.
/// cx, cy, w, h, confidence.
const MIN_FEATURES: usize = 5;

fn parse_detections(
    data: &[f32],
    shape: &[usize],
    confidence: f64,
    letterbox: Letterbox,
) -> Result<Vec<RawDetection>, AnalyzeError> {
    if shape.len() != 3 {
        return Err(format!("Unexpected detection output shape: {shape:?}").into());
    }
    // Either [1, detections, features] or [1, features, detections]. An axis
    // too short to hold box + confidence cannot be the feature axis.
    let transposed = if shape[2] < MIN_FEATURES {
        true
    } else if shape[1] < MIN_FEATURES {
        false
    } else {
        shape[1] < shape[2]
    };
    let (num_dets, num_feats) = if transposed {
        (shape[2], shape[1])
    } else {
        (shape[1], shape[2])
    };
    if num_feats < MIN_FEATURES || data.len() < num_dets * num_feats {
        return Err(format!("Detection output too small for shape {shape:?}").into());
    }

    let value = |det: usize, feat: usize| -> f64 {
        let idx = if transposed {
            feat * num_dets + det
        } else {
            det * num_feats + feat
        };
        data[idx] as f64
    };

    let mut dets = Vec::new();
    for i in 0..num_dets {
        let conf = value(i, 4);
        if conf < confidence {
            continue;
        }
        let (cx, cy, w, h) = (value(i, 0), value(i, 1), value(i, 2), value(i, 3));
        dets.push(RawDetection {
            x1: ((cx - w / 2.0) - letterbox.pad_x) / letterbox.scale,
            y1: ((cy - h / 2.0) - letterbox.pad_y) / letterbox.scale,
            x2: ((cx + w / 2.0) - letterbox.pad_x) / letterbox.scale,
            y2: ((cy + h / 2.0) - letterbox.pad_y) / letterbox.scale,
            confidence: conf,
        });
    }
    Ok(dets)
}

/// Greedy NMS: sort by confidence descending, suppress overlapping boxes.
fn nms(dets: &mut [RawDetection], iou_thresh: f64) -> Vec<RawDetection> {
    dets.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; dets.len()];

    for i in 0..dets.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(dets[i].clone());
        for j in (i + 1)..dets.len() {
            if !suppressed[j] && bbox_iou(&dets[i], &dets[j]) > iou_thresh {
                suppressed[j] = true;
            }
        }
    }
    keep
}

fn bbox_iou(a: &RawDetection, b: &RawDetection) -> f64 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    if inter == 0.0 {
        return 0.0;
    }
    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    inter / (area_a + area_b - inter)
}
