//! Detect server binary.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use detect_server::{
    camera::CameraSession,
    config::{parse_resolution, CameraConfig, ServerConfig, DEFAULT_MAX_UPLOAD_BYTES},
    detector::{load_font, Detector},
    endpoints::{router, AppState},
    ingest::ensure_static_dir,
    meter::spawn_meter_logger,
    nn::{load_labels, YoloModel, DEFAULT_INPUT_SIZE},
    sensors::default_opener,
};
use env_logger::TimestampPrecision;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to serve HTTP on
    #[clap(long, default_value = "127.0.0.1:5000")]
    server_address: String,

    /// ONNX detection model
    #[clap(long, default_value = "best.onnx")]
    model: PathBuf,

    /// Class names, one per line
    #[clap(long)]
    labels: Option<PathBuf>,

    /// TrueType font for box captions, replacing the bundled one
    #[clap(long)]
    font: Option<PathBuf>,

    /// Side length of the square model input
    #[clap(long, default_value_t = DEFAULT_INPUT_SIZE)]
    input_size: u32,

    /// Directory for uploads and the annotated output
    #[clap(long, default_value = "static")]
    static_dir: PathBuf,

    /// Maximum size of uploaded images in bytes
    #[clap(long, default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    max_upload_bytes: usize,

    /// Video device of the camera
    #[clap(long, default_value = "/dev/video0")]
    camera_device: String,

    /// Camera resolution as <width>x<height>
    #[clap(long, default_value = "640x480", value_parser = parse_resolution)]
    camera_resolution: (u32, u32),

    /// Camera frames per second
    #[clap(long, default_value_t = 30)]
    camera_fps: u32,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            server_address: args.server_address,
            model: args.model,
            labels: args.labels,
            font: args.font,
            input_size: args.input_size,
            static_dir: args.static_dir,
            max_upload_bytes: args.max_upload_bytes,
            camera: CameraConfig {
                device: args.camera_device,
                resolution: Some(args.camera_resolution),
                fps: Some(args.camera_fps),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::from(Args::parse());

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    ensure_static_dir(&config.static_dir)?;

    // Build detector from the pretrained model
    log::info!("Loading model {}", config.model.display());
    let mut model = YoloModel::new(&config.model, config.input_size)?;
    match &config.labels {
        Some(path) => model = model.with_labels(load_labels(path)?),
        None => log::warn!("No labels given, classes are shown by their id"),
    }

    let mut detector = Detector::new(Box::new(model));
    if let Some(path) = &config.font {
        detector = detector.with_font(load_font(path)?);
    }

    let camera = CameraSession::new(default_opener(&config.camera));
    let addr: SocketAddr = config.server_address.parse()?;
    let state = Arc::new(AppState::new(config, detector, camera));

    spawn_meter_logger();

    // Build HTTP server with endpoints
    let app = router(Arc::clone(&state));

    // Release the camera on shutdown, which also ends running streams
    let shutdown = async move {
        tokio::signal::ctrl_c().await.ok();
        log::info!("Shutting down");
        let camera = Arc::clone(&state.camera);
        if let Err(err) = tokio::task::spawn_blocking(move || camera.turn_off()).await {
            log::error!("Failed to release camera: {err}");
        }
    };

    log::info!("Serving on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
