//! Endpoints of HTTP server.
//!
use std::{
    convert::Infallible,
    io::ErrorKind,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use axum::{
    async_trait,
    body::{Body, Bytes, StreamBody},
    extract::{DefaultBodyLimit, FromRequest, Multipart, Path},
    http::{header, Request, StatusCode},
    response::{Html, IntoResponse},
    routing::{get, post},
    Extension, Form, Router,
};
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    camera::CameraSession,
    config::ServerConfig,
    detector::{Detector, CONFIDENCE_THRESHOLD},
    error::AppError,
    ingest::{materialize, sanitize_filename, write_output, ImageSource, OUTPUT_FILENAME},
    meter::METER,
    responder::{spawn_detection_stream, STREAM_CONTENT_TYPE},
    views::{index_page, result_page},
};

/// State shared by all handlers.
pub struct AppState {
    pub config: ServerConfig,
    pub detector: Arc<Detector>,
    pub camera: Arc<CameraSession>,
    pub client: Client,
}

impl AppState {
    pub fn new(config: ServerConfig, detector: Detector, camera: CameraSession) -> Self {
        Self {
            config,
            detector: Arc::new(detector),
            camera: Arc::new(camera),
            client: Client::new(),
        }
    }

    /// Use `client` to fetch images from URLs.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }
}

/// Build the HTTP router with all endpoints.
pub fn router(state: Arc<AppState>) -> Router {
    let max_upload_bytes = state.config.max_upload_bytes;

    Router::new()
        .route("/", get(index))
        .route("/healthcheck", get(healthcheck))
        .route("/toggle_camera", post(toggle_camera))
        .route("/video_feed", get(video_feed))
        .route("/detect", post(detect))
        .route("/static/:name", get(static_file))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(Extension(state))
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

/// Landing page.
pub async fn index() -> Html<&'static str> {
    Html(index_page())
}

/// Form parameters of the camera toggle.
#[derive(Debug, Deserialize)]
pub struct ToggleParams {
    #[serde(default)]
    action: Option<String>,
}

/// Turn the camera on or off. Unknown actions are ignored.
pub async fn toggle_camera(
    Extension(state): Extension<Arc<AppState>>,
    form: Option<Form<ToggleParams>>,
) -> Result<StatusCode, AppError> {
    let action = form.and_then(|Form(params)| params.action);
    let camera = Arc::clone(&state.camera);

    match action.as_deref() {
        Some("on") => {
            tokio::task::spawn_blocking(move || camera.turn_on())
                .await
                .context("camera task failed")??;
        }
        Some("off") => {
            tokio::task::spawn_blocking(move || camera.turn_off())
                .await
                .context("camera task failed")?;
        }
        other => log::warn!("Ignoring camera action {:?}", other),
    }

    Ok(StatusCode::NO_CONTENT)
}

/// Endpoint of the annotated live camera stream.
pub async fn video_feed(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    if !state.camera.is_on() {
        return Err(AppError::CameraOff);
    }
    log::info!("Video feed requested");

    let (rx, _producer) =
        spawn_detection_stream(Arc::clone(&state.camera), Arc::clone(&state.detector));
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);

    // Set body and headers for multipart streaming
    let body = StreamBody::new(stream);
    let headers = [
        (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
        (header::CACHE_CONTROL, "no-cache"),
    ];

    Ok((headers, body))
}

/// Run detection on an uploaded image or an image URL and show the annotated result.
pub async fn detect(
    Extension(state): Extension<Arc<AppState>>,
    form: DetectForm,
) -> Result<Html<String>, AppError> {
    let source = ImageSource::select(form.file, form.image_url)?;
    match &source {
        ImageSource::Upload { filename, data } => {
            log::info!("Detecting objects in upload {} ({} bytes)", filename, data.len())
        }
        ImageSource::Url(url) => log::info!("Detecting objects in {}", url),
    }

    let image = materialize(&source, &state.config.static_dir, &state.client).await?;

    let detector = Arc::clone(&state.detector);
    let static_dir = state.config.static_dir.clone();
    let detections = tokio::task::spawn_blocking(move || {
        let annotated = detector.detect(image, CONFIDENCE_THRESHOLD)?;
        write_output(&static_dir, &annotated.image)?;
        Ok::<_, anyhow::Error>(annotated.detections)
    })
    .await
    .context("detection task failed")??;

    METER.tick_annotated();
    log::info!("Found {} objects", detections.len());

    let version = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();

    Ok(Html(result_page(OUTPUT_FILENAME, version, &detections)))
}

/// Serve uploads and the annotated output from the static directory.
pub async fn static_file(
    Extension(state): Extension<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    // Reject anything that could leave the static directory
    if sanitize_filename(&name) != Some(name.as_str()) {
        return Err(AppError::NotFound);
    }

    let path = state.config.static_dir.join(&name);
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(err) if err.kind() == ErrorKind::NotFound => return Err(AppError::NotFound),
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("failed to read {}", path.display()))
                .into())
        }
    };

    let headers = [
        (header::CONTENT_TYPE, content_type_for(&name)),
        (header::CACHE_CONTROL, "no-cache"),
    ];

    Ok((headers, data))
}

fn content_type_for(name: &str) -> &'static str {
    let extension = name
        .rsplit_once('.')
        .map(|(_, extension)| extension.to_ascii_lowercase());

    match extension.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        Some("tif") | Some("tiff") => "image/tiff",
        _ => "application/octet-stream",
    }
}

/// Input of the detect endpoint, sent either as multipart or as URL-encoded form.
#[derive(Debug, Default)]
pub struct DetectForm {
    /// Filename and content of the `file` field.
    pub file: Option<(String, Bytes)>,
    pub image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DetectParams {
    #[serde(default)]
    image_url: Option<String>,
}

#[async_trait]
impl<S> FromRequest<S, Body> for DetectForm
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request<Body>, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with("multipart/form-data") {
            let multipart = Multipart::from_request(req, state)
                .await
                .map_err(|rejection| AppError::Rejected {
                    status: rejection.status(),
                    message: rejection.body_text(),
                })?;
            read_multipart(multipart).await
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            let Form(params) = Form::<DetectParams>::from_request(req, state)
                .await
                .map_err(|rejection| AppError::Rejected {
                    status: rejection.status(),
                    message: rejection.body_text(),
                })?;
            Ok(DetectForm {
                file: None,
                image_url: params.image_url,
            })
        } else {
            // Without form data there is no image
            Ok(DetectForm::default())
        }
    }
}

async fn read_multipart(mut multipart: Multipart) -> Result<DetectForm, AppError> {
    let mut form = DetectForm::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().unwrap_or_default().to_owned();
                let data = field.bytes().await?;
                if form.file.is_none() {
                    form.file = Some((filename, data));
                }
            }
            Some("image_url") => {
                let url = field.text().await?;
                form.image_url.get_or_insert(url);
            }
            _ => log::debug!("Skipping form field {:?}", name),
        }
    }

    Ok(form)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("output.jpg"), "image/jpeg");
        assert_eq!(content_type_for("CAT.PNG"), "image/png");
        assert_eq!(content_type_for("notes"), "application/octet-stream");
    }

    fn multipart_request(body: &'static str) -> Request<Body> {
        Request::post("/detect")
            .header(
                header::CONTENT_TYPE,
                "multipart/form-data; boundary=XBOUNDARY",
            )
            .body(Body::from(body.replace('\n', "\r\n")))
            .expect("valid request")
    }

    #[tokio::test]
    async fn test_multipart_form_is_parsed() -> Result<(), AppError> {
        let req = multipart_request(
            "--XBOUNDARY\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"cat.jpg\"\n\
             Content-Type: image/jpeg\n\
             \n\
             jpegdata\n\
             --XBOUNDARY\n\
             Content-Disposition: form-data; name=\"image_url\"\n\
             \n\
             http://example.com/dog.jpg\n\
             --XBOUNDARY--\n",
        );

        let form = DetectForm::from_request(req, &()).await?;
        let (filename, data) = form.file.expect("file field");
        assert_eq!(filename, "cat.jpg");
        assert_eq!(&data[..], b"jpegdata");
        assert_eq!(form.image_url.as_deref(), Some("http://example.com/dog.jpg"));
        Ok(())
    }

    #[tokio::test]
    async fn test_urlencoded_form_is_parsed() -> Result<(), AppError> {
        let req = Request::post("/detect")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("image_url=http%3A%2F%2Fexample.com%2Fdog.jpg"))
            .expect("valid request");

        let form = DetectForm::from_request(req, &()).await?;
        assert!(form.file.is_none());
        assert_eq!(form.image_url.as_deref(), Some("http://example.com/dog.jpg"));
        Ok(())
    }

    #[tokio::test]
    async fn test_request_without_form_is_empty() -> Result<(), AppError> {
        let req = Request::post("/detect")
            .body(Body::empty())
            .expect("valid request");

        let form = DetectForm::from_request(req, &()).await?;
        assert!(form.file.is_none());
        assert!(form.image_url.is_none());
        Ok(())
    }
}
