//! Object detection with a pretrained YOLO model in ONNX format.
//!
//! The network expects a square, letterboxed RGB input scaled to `0..1` and returns one row per
//! candidate box: `cx, cy, w, h` followed by one score per class.
use std::{fs, path::Path};

use anyhow::{bail, Context, Result};
use image::{imageops, Rgb, RgbImage};
use ndarray::{ArrayView2, ArrayViewD, Axis, Ix3};
use tract_onnx::prelude::*;

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Grey used to fill the letterbox borders.
const PAD_VALUE: u8 = 114;

pub const DEFAULT_INPUT_SIZE: u32 = 640;
pub const DEFAULT_MAX_IOU: f32 = 0.45;
pub const DEFAULT_MAX_DETECTIONS: usize = 300;

/// A single prediction of the model.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    /// `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]` in pixels of the input image.
    pub bbox: [f32; 4],
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
}

/// Anything that turns an image into detections.
pub trait InferModel: Send + Sync {
    fn run(&self, image: &RgbImage, min_confidence: f32) -> Result<Vec<Detection>>;
}

pub struct YoloModel {
    model: NnModel,
    input_size: u32,
    max_iou: f32,
    max_detections: usize,
    labels: Vec<String>,
}

impl YoloModel {
    /// Load the ONNX model at `model_path` for a square input of `input_size` pixels.
    pub fn new(model_path: impl AsRef<Path>, input_size: u32) -> Result<Self> {
        let model = get_yolo_model(model_path.as_ref(), input_size)?;
        Ok(Self {
            model,
            input_size,
            max_iou: DEFAULT_MAX_IOU,
            max_detections: DEFAULT_MAX_DETECTIONS,
            labels: Vec::new(),
        })
    }

    /// Attach class names, indexed by class id.
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    fn label(&self, class_id: usize) -> String {
        label_for(&self.labels, class_id)
    }

    fn preproc(&self, input: &RgbImage, letterbox: &Letterbox) -> Tensor {
        let boxed = letterbox.apply(input);
        let size = self.input_size as usize;

        tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            boxed[(x as _, y as _)][c] as f32 / 255.0
        })
        .into()
    }
}

impl InferModel for YoloModel {
    fn run(&self, image: &RgbImage, min_confidence: f32) -> Result<Vec<Detection>> {
        if image.width() == 0 || image.height() == 0 {
            bail!("cannot run detection on an empty image");
        }

        let letterbox = Letterbox::new(image.width(), image.height(), self.input_size);
        let input = self.preproc(image, &letterbox);
        let raw_nn_out = self.model.run(tvec!(input.into()))?;
        let output = raw_nn_out.get(0).context("model produced no outputs")?;

        let candidates = decode_output(output.to_array_view::<f32>()?, min_confidence)?;
        let selected = non_maximum_suppression(candidates, self.max_iou, self.max_detections);

        Ok(selected
            .into_iter()
            .map(|candidate| Detection {
                bbox: letterbox.to_source(candidate.bbox),
                class_id: candidate.class_id,
                label: self.label(candidate.class_id),
                confidence: candidate.confidence,
            })
            .collect())
    }
}

fn get_yolo_model(model_path: &Path, input_size: u32) -> Result<NnModel> {
    let size = input_size as usize;
    let input_fact = InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size));
    let model = tract_onnx::onnx()
        .model_for_path(model_path)
        .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
        .with_input_fact(0, input_fact)
        .context("failed to set input fact")?
        .into_optimized()
        .context("failed to optimize ONNX model")?
        .into_runnable()
        .context("failed to build runnable ONNX model")?;

    Ok(model)
}

/// Read class names from a text file with one name per line.
pub fn load_labels(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read labels from {}", path.display()))?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}

/// Name of `class_id`, falling back to `class <id>` for unknown ids.
pub fn label_for(labels: &[String], class_id: usize) -> String {
    labels
        .get(class_id)
        .cloned()
        .unwrap_or_else(|| format!("class {class_id}"))
}

/// Scaling and padding that fit an image into the square model input.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Letterbox {
    size: u32,
    scale: f32,
    resized: (u32, u32),
    pad: (u32, u32),
    source: (u32, u32),
}

impl Letterbox {
    fn new(width: u32, height: u32, size: u32) -> Self {
        let scale = f32::min(size as f32 / width as f32, size as f32 / height as f32);
        let resized_width = ((width as f32 * scale).round() as u32).clamp(1, size);
        let resized_height = ((height as f32 * scale).round() as u32).clamp(1, size);

        Self {
            size,
            scale,
            resized: (resized_width, resized_height),
            pad: ((size - resized_width) / 2, (size - resized_height) / 2),
            source: (width, height),
        }
    }

    fn apply(&self, input: &RgbImage) -> RgbImage {
        let resized = imageops::resize(
            input,
            self.resized.0,
            self.resized.1,
            imageops::FilterType::Triangle,
        );
        let mut canvas = RgbImage::from_pixel(self.size, self.size, Rgb([PAD_VALUE; 3]));
        imageops::replace(&mut canvas, &resized, self.pad.0 as i64, self.pad.1 as i64);
        canvas
    }

    /// Map a box in model input coordinates back onto the source image, clamped to its bounds.
    fn to_source(&self, bbox: [f32; 4]) -> [f32; 4] {
        let (pad_x, pad_y) = (self.pad.0 as f32, self.pad.1 as f32);
        let (width, height) = (self.source.0 as f32, self.source.1 as f32);

        [
            ((bbox[0] - pad_x) / self.scale).clamp(0.0, width),
            ((bbox[1] - pad_y) / self.scale).clamp(0.0, height),
            ((bbox[2] - pad_x) / self.scale).clamp(0.0, width),
            ((bbox[3] - pad_y) / self.scale).clamp(0.0, height),
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Candidate {
    bbox: [f32; 4],
    class_id: usize,
    confidence: f32,
}

/// Turn the raw network output into candidates scoring above `min_confidence`.
///
/// Both `[1, 4 + classes, candidates]` (YOLOv8 export default) and the transposed
/// `[1, candidates, 4 + classes]` layouts are accepted. There are always far more candidates than
/// classes, which tells the two apart.
fn decode_output(output: ArrayViewD<f32>, min_confidence: f32) -> Result<Vec<Candidate>> {
    let output = output
        .into_dimensionality::<Ix3>()
        .context("expected a rank 3 output tensor")?;
    let rows: ArrayView2<f32> = output.index_axis_move(Axis(0), 0);
    let rows = match rows.nrows() < rows.ncols() {
        true => rows.reversed_axes(),
        false => rows,
    };

    if rows.ncols() < 5 {
        bail!(
            "output has {} values per candidate, expected at least 5",
            rows.ncols()
        );
    }

    let candidates = rows
        .outer_iter()
        .filter_map(|row| {
            let (class_id, confidence) = row.iter().skip(4).copied().enumerate().fold(
                (0, f32::NEG_INFINITY),
                |best, (id, score)| match score > best.1 {
                    true => (id, score),
                    false => best,
                },
            );
            if confidence <= min_confidence {
                return None;
            }

            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            Some(Candidate {
                bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
                class_id,
                confidence,
            })
        })
        .collect();

    Ok(candidates)
}

/// Run class-aware non-maximum-suppression on candidate bounding boxes.
///
/// Starting with the most confident candidate, a box is kept only if it does not overlap any
/// already kept box of the same class by more than `max_iou`. At most `max_detections` boxes are
/// kept.
fn non_maximum_suppression(
    mut candidates: Vec<Candidate>,
    max_iou: f32,
    max_detections: usize,
) -> Vec<Candidate> {
    candidates.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

    let mut selected: Vec<Candidate> = vec![];
    'candidates: while let Some(candidate) = candidates.pop() {
        if selected.len() >= max_detections {
            break;
        }

        for kept in selected.iter().filter(|k| k.class_id == candidate.class_id) {
            if iou(&candidate.bbox, &kept.bbox) > max_iou {
                continue 'candidates;
            }
        }

        selected.push(candidate);
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
fn iou(bbox_a: &[f32; 4], bbox_b: &[f32; 4]) -> f32 {
    // If the boxes do not overlap, the bottom-right corner of the overlap box lies above or left
    // of its top-left corner and the area is zero.
    let overlap_box: [f32; 4] = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Calculate the area enclosed by a bounding box.
///
/// The bounding box is passed as `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`.
/// Ill-defined boxes have an area of zero.
fn bbox_area(bbox: &[f32; 4]) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}
