//! Ingestion of uploaded or remote images and the annotated output artifact.
//!
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use image::{io::Reader as ImageReader, RgbImage};
use reqwest::Client;

use crate::error::AppError;

/// Name of the annotated image in the static directory, overwritten by every detection.
pub const OUTPUT_FILENAME: &str = "output.jpg";

/// Where the image to run detection on comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum ImageSource {
    Upload { filename: String, data: Bytes },
    Url(String),
}

impl ImageSource {
    /// Pick the image source of a request. An uploaded file wins over a URL.
    pub fn select(
        file: Option<(String, Bytes)>,
        image_url: Option<String>,
    ) -> Result<Self, AppError> {
        let file = file.filter(|(filename, _)| !filename.is_empty());
        let image_url = image_url
            .map(|url| url.trim().to_owned())
            .filter(|url| !url.is_empty());

        match (file, image_url) {
            (Some((filename, data)), _) => Ok(ImageSource::Upload { filename, data }),
            (None, Some(url)) => Ok(ImageSource::Url(url)),
            (None, None) => Err(AppError::MissingInput),
        }
    }
}

/// Reduce an uploaded filename to its last path component.
///
/// Returns `None` if nothing usable is left, e.g. for `..` or `/`.
pub fn sanitize_filename(filename: &str) -> Option<&str> {
    let name = filename.rsplit(|c: char| c == '/' || c == '\\').next()?.trim();
    match name {
        "" | "." | ".." => None,
        name => Some(name),
    }
}

/// Create the static directory if it does not exist yet.
pub fn ensure_static_dir(static_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(static_dir)
        .with_context(|| format!("failed to create static dir {}", static_dir.display()))
}

/// Turn the image source into a decoded RGB image.
///
/// Uploads are saved into `static_dir` under their own name first. URLs are fetched into memory.
pub async fn materialize(
    source: &ImageSource,
    static_dir: &Path,
    client: &Client,
) -> Result<RgbImage, AppError> {
    match source {
        ImageSource::Upload { filename, data } => {
            let name = sanitize_filename(filename)
                .ok_or_else(|| AppError::BadRequest(format!("Invalid filename {filename:?}")))?;
            let path = static_dir.join(name);
            let data = data.clone();

            let image = tokio::task::spawn_blocking(move || {
                save_upload(&path, &data)?;
                decode_file(&path)
            })
            .await
            .context("upload task failed")??;

            Ok(image)
        }
        ImageSource::Url(url) => {
            let data = fetch_image(client, url).await?;
            let image = tokio::task::spawn_blocking(move || decode_bytes(&data))
                .await
                .context("decode task failed")??;

            Ok(image)
        }
    }
}

/// Download an image into memory.
pub async fn fetch_image(client: &Client, url: &str) -> Result<Bytes> {
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("failed to fetch {url}"))?
        .error_for_status()
        .with_context(|| format!("failed to fetch {url}"))?;

    resp.bytes()
        .await
        .with_context(|| format!("failed to read body of {url}"))
}

fn save_upload(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data).with_context(|| format!("failed to save {}", path.display()))
}

fn decode_file(path: &Path) -> Result<RgbImage> {
    let image = ImageReader::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("failed to read {}", path.display()))?
        .decode()
        .with_context(|| format!("failed to decode {}", path.display()))?;

    Ok(image.to_rgb8())
}

fn decode_bytes(data: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(data).context("failed to decode fetched image")?;
    Ok(image.to_rgb8())
}

/// Write the annotated image to the fixed output path, replacing the previous one.
pub fn write_output(static_dir: &Path, image: &RgbImage) -> Result<PathBuf> {
    let path = static_dir.join(OUTPUT_FILENAME);
    image
        .save_with_format(&path, image::ImageFormat::Jpeg)
        .with_context(|| format!("failed to write {}", path.display()))?;

    Ok(path)
}
