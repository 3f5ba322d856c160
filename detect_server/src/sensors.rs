//! Sensors module.
//!
//! Frame sources deliver decoded RGB frames. The V4L2 webcam backend is only available with the
//! `v4l` feature since it links against `libv4l2`.
use anyhow::{Context, Result};
use image::{ImageFormat, RgbImage};

use crate::config::CameraConfig;

/// A device delivering frames one at a time.
pub trait FrameSource: Send {
    /// Capture the next frame, blocking until it is available.
    ///
    /// Returns `None` once the device cannot deliver frames anymore.
    fn capture(&mut self) -> Option<RgbImage>;
}

/// Opens a frame source on demand.
pub trait CameraOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>>;
}

/// Decode an MJPG frame to RGB.
pub fn decode_jpeg_frame(data: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
        .context("failed to decode camera frame")?;
    Ok(image.to_rgb8())
}

/// Camera opener for the configured capture device.
pub fn default_opener(config: &CameraConfig) -> Box<dyn CameraOpener> {
    #[cfg(feature = "v4l")]
    {
        Box::new(v4l::V4lOpener::new(config.clone()))
    }
    #[cfg(not(feature = "v4l"))]
    {
        Box::new(UnsupportedOpener {
            device: config.device.clone(),
        })
    }
}

/// Stand-in when the crate is built without camera support.
#[cfg(not(feature = "v4l"))]
struct UnsupportedOpener {
    device: String,
}

#[cfg(not(feature = "v4l"))]
impl CameraOpener for UnsupportedOpener {
    fn open(&self) -> Result<Box<dyn FrameSource>> {
        anyhow::bail!(
            "cannot open {}: built without the `v4l` feature",
            self.device
        )
    }
}

#[cfg(feature = "v4l")]
pub mod v4l {
    //! V4L2 webcams delivering Motion JPEG.
    use anyhow::{anyhow, Context, Result};
    use image::RgbImage;
    use rscam::{Camera, Config};

    use super::{decode_jpeg_frame, CameraOpener, FrameSource};
    use crate::config::CameraConfig;

    const FORMAT: &[u8] = b"MJPG";

    pub struct V4lOpener {
        config: CameraConfig,
    }

    impl V4lOpener {
        pub fn new(config: CameraConfig) -> Self {
            Self { config }
        }
    }

    impl CameraOpener for V4lOpener {
        fn open(&self) -> Result<Box<dyn FrameSource>> {
            Ok(Box::new(V4lCamera::open(&self.config)?))
        }
    }

    /// Started capture on a V4L2 device.
    pub struct V4lCamera {
        cam: Camera,
    }

    impl V4lCamera {
        pub fn open(config: &CameraConfig) -> Result<Self> {
            let mut cam = Camera::new(&config.device)
                .with_context(|| format!("failed to open camera {}", &config.device))?;
            log_supported_formats(&cam);

            let resolution = match config.resolution {
                Some(resolution) => resolution,
                None => get_max_resolution(&cam)?,
            };
            let interval = match config.fps {
                Some(fps) => (1, fps),
                None => get_max_frame_rate(&cam, resolution)?,
            };

            cam.start(&Config {
                interval,
                resolution,
                format: FORMAT,
                ..Default::default()
            })
            .with_context(|| format!("failed to start capture on {}", &config.device))?;

            log::info!(
                "Using camera {} at {}x{}, interval {}/{}",
                &config.device,
                resolution.0,
                resolution.1,
                interval.0,
                interval.1
            );

            Ok(Self { cam })
        }
    }

    impl FrameSource for V4lCamera {
        fn capture(&mut self) -> Option<RgbImage> {
            let frame = match self.cam.capture() {
                Ok(frame) => frame,
                Err(err) => {
                    log::warn!("Error capturing frame: {err}");
                    return None;
                }
            };

            match decode_jpeg_frame(&frame[..]) {
                Ok(image) => Some(image),
                Err(err) => {
                    log::warn!("{err:#}");
                    None
                }
            }
        }
    }

    /// Get the maximum supported resolution for MJPG.
    fn get_max_resolution(cam: &Camera) -> Result<(u32, u32)> {
        let resolution_info = cam.resolutions(FORMAT)?;
        log::debug!("Found resolutions: {:?}", &resolution_info);
        match resolution_info {
            rscam::ResolutionInfo::Discretes(resolutions) => resolutions
                .iter()
                // Highest resolution in terms of number of pixels
                .max_by_key(|res| res.0 * res.1)
                .copied(),
            rscam::ResolutionInfo::Stepwise { max, .. } => Some(max),
        }
        .ok_or_else(|| anyhow!("no resolution found"))
    }

    /// Get the maximum supported frame rate for MJPG at the given resolution.
    fn get_max_frame_rate(cam: &Camera, resolution: (u32, u32)) -> Result<(u32, u32)> {
        let interval_info = cam.intervals(FORMAT, resolution)?;
        log::debug!("Found frame rates: {:?}", &interval_info);
        match interval_info {
            // Intervals are (numerator, denominator) seconds per frame
            rscam::IntervalInfo::Discretes(intervals) => intervals
                .iter()
                .max_by_key(|(num, den)| den / num.max(&1))
                .copied(),
            rscam::IntervalInfo::Stepwise { min, .. } => Some(min),
        }
        .ok_or_else(|| anyhow!("no frame rate found"))
    }

    fn log_supported_formats(cam: &Camera) {
        let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
        log::debug!("Supported formats: {:?}", formats);
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use image::{codecs::jpeg::JpegEncoder, ColorType, Rgb};

    use super::*;

    #[test]
    fn test_decode_jpeg_frame() -> Result<()> {
        let frame = RgbImage::from_pixel(16, 8, Rgb([10, 200, 30]));
        let mut buf = Cursor::new(Vec::new());
        JpegEncoder::new_with_quality(&mut buf, 90).encode(&frame, 16, 8, ColorType::Rgb8)?;

        let decoded = decode_jpeg_frame(buf.get_ref())?;
        assert_eq!(decoded.dimensions(), (16, 8));
        Ok(())
    }

    #[test]
    fn test_decode_garbage_frame_fails() {
        assert!(decode_jpeg_frame(b"not a jpeg").is_err());
    }

    #[cfg(not(feature = "v4l"))]
    #[test]
    fn test_opening_without_camera_support_fails() {
        let opener = default_opener(&CameraConfig::default());
        assert!(opener.open().is_err());
    }
}
