//! Face detection and embedding extraction via ONNX Runtime.
//!
//! Detection uses an UltraFace-style model (`scores` [1, N, 2] and
//! normalized corner `boxes` [1, N, 4]). Each detected box is cropped,
//! resized to the recognizer's 112x112 input and embedded by an
//! ArcFace-style model; embeddings are L2-normalized.

use crate::types::{BoundingBox, Detection, Embedding};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DETECTOR_INPUT_WIDTH: u32 = 320;
const DETECTOR_INPUT_HEIGHT: u32 = 240;
const DETECTOR_MEAN: f32 = 127.0;
const DETECTOR_STD: f32 = 128.0;
/// `scores` and `boxes`.
const DETECTOR_OUTPUTS: usize = 2;
const RECOGNIZER_OUTPUTS: usize = 1;

/// Raw-distance match tolerance calibrated for the ArcFace recognizer.
/// Embeddings are unit length, so squared distance is `2 - 2 * cos`; this
/// value squares to 1.2, i.e. cosine similarity 0.40.
pub const ARCFACE_MATCH_TOLERANCE: f32 = 1.095_445;

const RECOGNIZER_INPUT_SIZE: u32 = 112;
const RECOGNIZER_MEAN: f32 = 127.5;
const RECOGNIZER_STD: f32 = 127.5;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("frame buffer does not match {width}x{height}")]
    InvalidFrame { width: u32, height: u32 },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that turns a grayscale frame into face detections with
/// fixed-dimension embeddings. Zero detections is a valid answer.
pub trait EmbeddingSource: Send {
    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>, EmbedderError>;
}

#[derive(Debug, Clone)]
pub struct OnnxEmbedderConfig {
    pub detector_path: PathBuf,
    pub recognizer_path: PathBuf,
    pub embedding_dim: usize,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    /// Boxes narrower or shorter than this (in frame pixels) are ignored.
    pub min_face_size: u32,
}

impl OnnxEmbedderConfig {
    /// Default model file names inside `model_dir`.
    pub fn in_dir(model_dir: &Path, embedding_dim: usize) -> Self {
        Self {
            detector_path: model_dir.join("version-RFB-320.onnx"),
            recognizer_path: model_dir.join("w600k_r50.onnx"),
            embedding_dim,
            confidence_threshold: 0.7,
            nms_threshold: 0.3,
            min_face_size: 24,
        }
    }
}

pub struct OnnxEmbedder {
    detector: Session,
    recognizer: Session,
    config: OnnxEmbedderConfig,
}

/// Fail with `InferenceFailed` unless a model produced at least `needed`
/// outputs.
fn require_outputs(actual: usize, needed: usize, model: &str) -> Result<(), EmbedderError> {
    if actual < needed {
        return Err(EmbedderError::InferenceFailed(format!(
            "{model} produced {actual} outputs, expected {needed}"
        )));
    }
    Ok(())
}

fn load_session(path: &Path, outputs: usize) -> Result<Session, EmbedderError> {
    if !path.exists() {
        return Err(EmbedderError::ModelNotFound(path.display().to_string()));
    }
    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(path)?;
    require_outputs(session.outputs().len(), outputs, &path.display().to_string())?;

    tracing::info!(
        path = %path.display(),
        inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded ONNX model"
    );
    Ok(session)
}

impl OnnxEmbedder {
    pub fn load(config: OnnxEmbedderConfig) -> Result<Self, EmbedderError> {
        let detector = load_session(&config.detector_path, DETECTOR_OUTPUTS)?;
        let recognizer = load_session(&config.recognizer_path, RECOGNIZER_OUTPUTS)?;
        Ok(Self {
            detector,
            recognizer,
            config,
        })
    }

    fn find_faces(&mut self, image: &GrayImage) -> Result<Vec<BoundingBox>, EmbedderError> {
        let resized = imageops::resize(
            image,
            DETECTOR_INPUT_WIDTH,
            DETECTOR_INPUT_HEIGHT,
            FilterType::Triangle,
        );
        let input = to_tensor(&resized, DETECTOR_MEAN, DETECTOR_STD);

        let outputs = self
            .detector
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        require_outputs(outputs.len(), DETECTOR_OUTPUTS, "detector")?;
        let (_, scores) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("scores: {e}")))?;
        let (_, boxes) = outputs[1]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("boxes: {e}")))?;

        let candidates = decode_boxes(
            scores,
            boxes,
            image.width(),
            image.height(),
            self.config.confidence_threshold,
        );
        let min = self.config.min_face_size as f32;
        Ok(nms(candidates, self.config.nms_threshold)
            .into_iter()
            .filter(|b| b.width >= min && b.height >= min)
            .collect())
    }

    fn embed(&mut self, image: &GrayImage, face: &BoundingBox) -> Result<Embedding, EmbedderError> {
        let x = face.x.max(0.0) as u32;
        let y = face.y.max(0.0) as u32;
        let w = (face.width as u32).min(image.width().saturating_sub(x)).max(1);
        let h = (face.height as u32).min(image.height().saturating_sub(y)).max(1);

        let crop = imageops::crop_imm(image, x, y, w, h).to_image();
        let aligned = imageops::resize(
            &crop,
            RECOGNIZER_INPUT_SIZE,
            RECOGNIZER_INPUT_SIZE,
            FilterType::Triangle,
        );
        let input = to_tensor(&aligned, RECOGNIZER_MEAN, RECOGNIZER_STD);

        let outputs = self
            .recognizer
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        require_outputs(outputs.len(), RECOGNIZER_OUTPUTS, "recognizer")?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding: {e}")))?;

        if raw.len() != self.config.embedding_dim {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {}-dim embedding, got {}",
                self.config.embedding_dim,
                raw.len()
            )));
        }
        Ok(Embedding::new(l2_normalize(raw)))
    }
}

impl EmbeddingSource for OnnxEmbedder {
    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>, EmbedderError> {
        let expected = (width as usize) * (height as usize);
        let data = pixels
            .get(..expected)
            .ok_or(EmbedderError::InvalidFrame { width, height })?;
        let image = GrayImage::from_raw(width, height, data.to_vec())
            .ok_or(EmbedderError::InvalidFrame { width, height })?;

        let faces = self.find_faces(&image)?;
        tracing::debug!(faces = faces.len(), "faces detected");

        Ok(embed_each(faces, |region| self.embed(&image, region)))
    }
}

/// Embed every face; a face whose embedding fails is logged and left out
/// without affecting the others.
fn embed_each(
    faces: Vec<BoundingBox>,
    mut embed: impl FnMut(&BoundingBox) -> Result<Embedding, EmbedderError>,
) -> Vec<Detection> {
    let mut detections = Vec::with_capacity(faces.len());
    for region in faces {
        match embed(&region) {
            Ok(embedding) => detections.push(Detection { region, embedding }),
            Err(e) => tracing::warn!(error = %e, x = region.x, y = region.y, "face skipped"),
        }
    }
    detections
}

/// Grayscale image → NCHW float tensor with the channel replicated three times.
fn to_tensor(image: &GrayImage, mean: f32, std: f32) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in image.enumerate_pixels() {
        let v = (pixel.0[0] as f32 - mean) / std;
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = v;
        tensor[[0, 1, y, x]] = v;
        tensor[[0, 2, y, x]] = v;
    }
    tensor
}

/// Turn raw detector output into frame-space boxes above `threshold`.
fn decode_boxes(
    scores: &[f32],
    boxes: &[f32],
    frame_width: u32,
    frame_height: u32,
    threshold: f32,
) -> Vec<BoundingBox> {
    let (fw, fh) = (frame_width as f32, frame_height as f32);
    scores
        .chunks_exact(2)
        .zip(boxes.chunks_exact(4))
        .filter(|(score, _)| score[1] >= threshold)
        .map(|(score, corners)| {
            let x1 = (corners[0] * fw).clamp(0.0, fw);
            let y1 = (corners[1] * fh).clamp(0.0, fh);
            let x2 = (corners[2] * fw).clamp(0.0, fw);
            let y2 = (corners[3] * fh).clamp(0.0, fh);
            BoundingBox {
                x: x1,
                y: y1,
                width: (x2 - x1).max(0.0),
                height: (y2 - y1).max(0.0),
                confidence: score[1],
            }
        })
        .collect()
}

/// Greedy non-maximum suppression, highest confidence first.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}
