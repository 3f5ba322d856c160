//! Server configuration.
//!
use std::path::PathBuf;

use crate::nn::DEFAULT_INPUT_SIZE;

/// Upload size limit for `/detect` requests.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub server_address: String,
    pub model: PathBuf,
    pub labels: Option<PathBuf>,
    pub font: Option<PathBuf>,
    pub input_size: u32,
    /// Directory holding uploads and the annotated output image.
    pub static_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub camera: CameraConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1:5000".into(),
            model: "best.onnx".into(),
            labels: None,
            font: None,
            input_size: DEFAULT_INPUT_SIZE,
            static_dir: "static".into(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            camera: CameraConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraConfig {
    pub device: String,
    /// Capture resolution, the largest supported one if unset.
    pub resolution: Option<(u32, u32)>,
    /// Capture frame rate, the highest supported one if unset.
    pub fps: Option<u32>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            resolution: Some((640, 480)),
            fps: Some(30),
        }
    }
}

/// Parse a resolution given as `<width>x<height>`.
pub fn parse_resolution(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .split_once(|c: char| c.eq_ignore_ascii_case(&'x'))
        .ok_or_else(|| format!("expected <width>x<height>, got {value:?}"))?;
    let width: u32 = width
        .trim()
        .parse()
        .map_err(|_| format!("invalid width {width:?}"))?;
    let height: u32 = height
        .trim()
        .parse()
        .map_err(|_| format!("invalid height {height:?}"))?;

    if width == 0 || height == 0 {
        return Err(format!("resolution {value:?} is empty"));
    }

    Ok((width, height))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_resolution() {
        assert_eq!(parse_resolution("640x480"), Ok((640, 480)));
        assert_eq!(parse_resolution("1280X720"), Ok((1280, 720)));
        assert!(parse_resolution("640").is_err());
        assert!(parse_resolution("0x480").is_err());
        assert!(parse_resolution("axb").is_err());
    }
}
