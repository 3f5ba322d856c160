//! Live stream of annotated camera frames.
//!
//! Every viewer gets its own producer on the blocking thread pool. The producer captures a frame,
//! runs the detector, encodes the result as JPEG and sends it as one part of a
//! `multipart/x-mixed-replace` response through a bounded channel. It stops when
//! - the viewer disconnects and the channel closes,
//! - the camera is turned off or fails to deliver a frame, or
//! - inference or encoding fails.
use std::{io::Cursor, sync::Arc, time::Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use image::{codecs::jpeg::JpegEncoder, ColorType, RgbImage};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    camera::CameraSession,
    detector::{Detector, CONFIDENCE_THRESHOLD},
    meter::METER,
};

pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

pub const JPEG_QUALITY: u8 = 80;

/// Frames in flight per viewer. Slow viewers hold back the producer instead of queueing frames.
const CHANNEL_CAPACITY: usize = 2;

/// Frame a JPEG image as one part of the multipart stream.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::from(
        [
            "--frame\r\nContent-Type: image/jpeg\r\n\r\n".as_bytes(),
            data,
            "\r\n".as_bytes(),
        ]
        .concat(),
    )
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode(image, image.width(), image.height(), ColorType::Rgb8)
        .context("failed to encode JPEG")?;

    Ok(buf.into_inner())
}

/// Start producing annotated frames for one viewer.
pub fn spawn_detection_stream(
    camera: Arc<CameraSession>,
    detector: Arc<Detector>,
) -> (mpsc::Receiver<Bytes>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handle = tokio::task::spawn_blocking(move || run_detection_loop(&camera, &detector, &tx));

    (rx, handle)
}

fn run_detection_loop(camera: &CameraSession, detector: &Detector, tx: &mpsc::Sender<Bytes>) {
    let _viewer = METER.join_viewer();
    log::info!("Detection stream started");

    loop {
        if tx.is_closed() {
            log::info!("Viewer disconnected, stopping detection stream");
            break;
        }

        let start = Instant::now();
        match annotate_next_frame(camera, detector) {
            Ok(Some(part)) => {
                let annotate = start.elapsed();
                log::debug!("Frame annotated in {:?}", annotate);
                if tx.blocking_send(part).is_err() {
                    log::info!("Viewer disconnected, stopping detection stream");
                    break;
                }
                METER.record_frame(annotate);
            }
            Ok(None) => {
                log::info!("No frame from camera, ending detection stream");
                break;
            }
            Err(err) => {
                log::error!("Ending detection stream: {err:#}");
                break;
            }
        }
    }
}

fn annotate_next_frame(camera: &CameraSession, detector: &Detector) -> Result<Option<Bytes>> {
    let frame = match camera.capture() {
        Some(frame) => frame,
        None => return Ok(None),
    };

    let annotated = detector.detect(frame, CONFIDENCE_THRESHOLD)?;
    let jpeg = encode_jpeg(&annotated.image, JPEG_QUALITY)?;

    Ok(Some(as_jpeg_stream_item(&jpeg)))
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::{
        nn::{Detection, InferModel},
        sensors::{CameraOpener, FrameSource},
    };

    use super::*;

    struct NoDetections;

    impl InferModel for NoDetections {
        fn run(&self, _image: &RgbImage, _min_confidence: f32) -> Result<Vec<Detection>> {
            Ok(vec![])
        }
    }

    /// Camera delivering `frames` frames before failing.
    struct FiniteOpener {
        frames: usize,
        captured: Arc<AtomicUsize>,
    }

    struct FiniteCamera {
        remaining: usize,
        captured: Arc<AtomicUsize>,
    }

    impl FrameSource for FiniteCamera {
        fn capture(&mut self) -> Option<RgbImage> {
            self.remaining = self.remaining.checked_sub(1)?;
            self.captured.fetch_add(1, Ordering::SeqCst);
            Some(RgbImage::new(8, 6))
        }
    }

    impl CameraOpener for FiniteOpener {
        fn open(&self) -> Result<Box<dyn FrameSource>> {
            Ok(Box::new(FiniteCamera {
                remaining: self.frames,
                captured: self.captured.clone(),
            }))
        }
    }

    fn setup(frames: usize) -> Result<(Arc<CameraSession>, Arc<Detector>, Arc<AtomicUsize>)> {
        let captured = Arc::new(AtomicUsize::new(0));
        let camera = Arc::new(CameraSession::new(Box::new(FiniteOpener {
            frames,
            captured: captured.clone(),
        })));
        camera.turn_on()?;
        let detector = Arc::new(Detector::new(Box::new(NoDetections)));

        Ok((camera, detector, captured))
    }

    #[test]
    fn test_stream_item_framing() {
        let item = as_jpeg_stream_item(&[0xff, 0xd8, 0xff, 0xd9]);
        assert_eq!(
            &item[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xff\xd8\xff\xd9\r\n"
        );
    }

    #[test]
    fn test_encoded_jpeg_starts_with_soi_marker() -> Result<()> {
        let jpeg = encode_jpeg(&RgbImage::new(8, 8), JPEG_QUALITY)?;
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_ends_when_camera_fails() -> Result<()> {
        let (camera, detector, captured) = setup(3)?;
        let (mut rx, handle) = spawn_detection_stream(camera, detector);

        let mut parts = 0;
        while let Some(part) = rx.recv().await {
            assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xff\xd8"));
            parts += 1;
        }
        handle.await?;

        assert_eq!(parts, 3);
        assert_eq!(captured.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_ends_when_camera_is_turned_off() -> Result<()> {
        let (camera, detector, _) = setup(usize::MAX)?;
        let (mut rx, handle) = spawn_detection_stream(camera.clone(), detector);

        assert!(rx.recv().await.is_some());
        camera.turn_off();

        // At most the frames already in flight arrive before the stream ends
        let mut remaining = 0;
        while rx.recv().await.is_some() {
            remaining += 1;
        }
        handle.await?;

        assert!(remaining <= CHANNEL_CAPACITY + 1);
        Ok(())
    }

    #[test]
    fn test_loop_stops_without_viewer() -> Result<()> {
        let (camera, detector, captured) = setup(usize::MAX)?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        drop(rx);

        run_detection_loop(&camera, &detector, &tx);
        assert_eq!(captured.load(Ordering::SeqCst), 0);
        Ok(())
    }
}
