//! Detector adapter: run the model over an image and draw the results onto it.
//!
use std::{fs, path::Path};

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};
use rusttype::{Font, Scale};

use crate::nn::{Detection, InferModel};

/// Minimum confidence of detections drawn onto images and frames.
pub const CONFIDENCE_THRESHOLD: f32 = 0.3;

/// Caption font used unless another one is configured.
const DEFAULT_FONT_DATA: &[u8] = include_bytes!("../resources/DejaVuSansMono.ttf");

const FONT_SCALE: f32 = 16.0;
const CAPTION_HEIGHT: u32 = 18;

const PALETTE: [[u8; 3]; 8] = [
    [0, 255, 0],
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [72, 249, 10],
    [26, 147, 52],
    [0, 212, 187],
    [52, 69, 147],
];

/// Result of a detection run.
pub struct Annotated {
    pub image: RgbImage,
    pub detections: Vec<Detection>,
}

pub struct Detector {
    model: Box<dyn InferModel>,
    font: Option<Font<'static>>,
}

impl Detector {
    /// Detector captioning its boxes with the bundled font.
    pub fn new(model: Box<dyn InferModel>) -> Self {
        let font = Font::try_from_bytes(DEFAULT_FONT_DATA);
        if font.is_none() {
            log::warn!("Bundled font is unusable, boxes are drawn without captions");
        }

        Self { model, font }
    }

    /// Use `font` instead of the bundled one to caption the drawn boxes.
    pub fn with_font(mut self, font: Font<'static>) -> Self {
        self.font = Some(font);
        self
    }

    /// Run the model on `image` and draw all detections above `confidence_threshold`.
    ///
    /// The annotated image keeps the dimensions of the input.
    pub fn detect(&self, image: RgbImage, confidence_threshold: f32) -> Result<Annotated> {
        let detections = self.model.run(&image, confidence_threshold)?;
        log::debug!("Found {} objects in image", detections.len());

        let image = draw_detections(image, &detections, self.font.as_ref());
        Ok(Annotated { image, detections })
    }
}

/// Load a TrueType font from disk.
pub fn load_font(path: impl AsRef<Path>) -> Result<Font<'static>> {
    let path = path.as_ref();
    let font_data =
        fs::read(path).with_context(|| format!("failed to read font {}", path.display()))?;
    Font::try_from_vec(font_data)
        .with_context(|| format!("{} is not a valid TrueType font", path.display()))
}

fn class_color(class_id: usize) -> Rgb<u8> {
    Rgb(PALETTE[class_id % PALETTE.len()])
}

/// Draw bounding boxes with labels and confidence scores on the image.
fn draw_detections(
    mut frame: RgbImage,
    detections: &[Detection],
    font: Option<&Font<'static>>,
) -> RgbImage {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return frame;
    }

    for detection in detections.iter() {
        // Coordinate frame basis is on the top left corner
        let x_tl = (detection.bbox[0].max(0.0) as u32).min(width - 1);
        let y_tl = (detection.bbox[1].max(0.0) as u32).min(height - 1);
        let x_br = (detection.bbox[2].max(0.0) as u32).min(width);
        let y_br = (detection.bbox[3].max(0.0) as u32).min(height);

        let color = class_color(detection.class_id);
        let rect = Rect::at(x_tl as i32, y_tl as i32).of_size(
            x_br.saturating_sub(x_tl).max(1),
            y_br.saturating_sub(y_tl).max(1),
        );
        draw_hollow_rect_mut(&mut frame, rect, color);

        if let Some(font) = font {
            let caption = format!("{} {:.2}", detection.label, detection.confidence);
            let caption_y = match y_tl >= CAPTION_HEIGHT {
                true => y_tl - CAPTION_HEIGHT,
                false => y_tl,
            };
            let caption_width = (caption.len() as u32 * FONT_SCALE as u32 / 2 + 4).min(width);

            draw_filled_rect_mut(
                &mut frame,
                Rect::at(x_tl as i32, caption_y as i32).of_size(caption_width, CAPTION_HEIGHT),
                color,
            );
            draw_text_mut(
                &mut frame,
                Rgb([255, 255, 255]),
                x_tl as i32 + 2,
                caption_y as i32 + 1,
                Scale::uniform(FONT_SCALE),
                font,
                &caption,
            );
        }
    }

    frame
}

#[cfg(test)]
mod test {
    use super::*;

    struct FixedModel(Vec<Detection>);

    impl InferModel for FixedModel {
        fn run(&self, _image: &RgbImage, min_confidence: f32) -> Result<Vec<Detection>> {
            Ok(self
                .0
                .iter()
                .filter(|d| d.confidence > min_confidence)
                .cloned()
                .collect())
        }
    }

    fn detection(bbox: [f32; 4], confidence: f32) -> Detection {
        Detection {
            bbox,
            class_id: 0,
            label: "person".into(),
            confidence,
        }
    }

    #[test]
    fn test_annotated_image_keeps_dimensions() -> Result<()> {
        let detector = Detector::new(Box::new(FixedModel(vec![
            detection([2.0, 2.0, 20.0, 10.0], 0.9),
            detection([-5.0, -5.0, 500.0, 500.0], 0.8),
        ])));

        for (width, height) in [(32, 24), (1, 1), (640, 480)] {
            let annotated = detector.detect(RgbImage::new(width, height), CONFIDENCE_THRESHOLD)?;
            assert_eq!(annotated.image.dimensions(), (width, height));
        }
        Ok(())
    }

    #[test]
    fn test_boxes_are_drawn() -> Result<()> {
        let detector = Detector::new(Box::new(FixedModel(vec![detection(
            [10.0, 30.0, 40.0, 60.0],
            0.9,
        )])));

        let annotated = detector.detect(RgbImage::new(64, 64), CONFIDENCE_THRESHOLD)?;
        assert_eq!(annotated.detections.len(), 1);
        assert_eq!(annotated.image[(10, 30)], class_color(0));
        assert_eq!(annotated.image[(39, 59)], class_color(0));
        assert_eq!(annotated.image[(25, 45)], Rgb([0, 0, 0]));
        Ok(())
    }

    #[test]
    fn test_default_detector_draws_captions() -> Result<()> {
        let detector = Detector::new(Box::new(FixedModel(vec![detection(
            [20.0, 40.0, 60.0, 80.0],
            0.9,
        )])));

        let annotated = detector.detect(RgbImage::new(100, 100), CONFIDENCE_THRESHOLD)?;

        // Caption sits above the box: a filled label background with white text on it
        let band: Vec<_> = (22..40)
            .flat_map(|y| (20..60).map(move |x| (x, y)))
            .map(|(x, y)| annotated.image[(x, y)])
            .collect();
        assert!(band.iter().all(|p| *p != Rgb([0, 0, 0])));
        assert!(band.iter().any(|p| p[0] > 200 && p[2] > 200));
        Ok(())
    }

    #[test]
    fn test_bundled_font_loads() {
        assert!(Font::try_from_bytes(DEFAULT_FONT_DATA).is_some());
    }

    #[test]
    fn test_low_confidence_detections_are_dropped() -> Result<()> {
        let detector = Detector::new(Box::new(FixedModel(vec![detection(
            [2.0, 2.0, 20.0, 10.0],
            0.2,
        )])));

        let annotated = detector.detect(RgbImage::new(32, 24), CONFIDENCE_THRESHOLD)?;
        assert!(annotated.detections.is_empty());
        assert!(annotated.image.pixels().all(|p| *p == Rgb([0, 0, 0])));
        Ok(())
    }

    #[test]
    fn test_missing_font_is_an_error() {
        assert!(load_font("/nonexistent/font.ttf").is_err());
    }
}
