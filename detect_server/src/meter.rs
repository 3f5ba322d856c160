//! Stream statistics, reported to the log periodically.
//!
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

const REPORT_INTERVAL: Duration = Duration::from_secs(2);

pub struct Meter {
    viewers: AtomicU64,
    streamed_frames: AtomicU64,
    annotate_micros: AtomicU64,
    annotated_images: AtomicU64,
}

/// Statistics gathered since the previous report.
#[derive(Debug, PartialEq)]
pub struct Report {
    /// Viewers connected right now.
    pub viewers: u64,
    pub streamed_frames: u64,
    /// Mean time to capture and annotate one streamed frame.
    pub mean_annotate: Option<Duration>,
    pub annotated_images: u64,
}

/// Counts a connected viewer until dropped.
pub struct ViewerGuard<'a> {
    meter: &'a Meter,
}

impl Drop for ViewerGuard<'_> {
    fn drop(&mut self) {
        self.meter.viewers.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            viewers: AtomicU64::new(0),
            streamed_frames: AtomicU64::new(0),
            annotate_micros: AtomicU64::new(0),
            annotated_images: AtomicU64::new(0),
        }
    }

    pub fn join_viewer(&self) -> ViewerGuard<'_> {
        self.viewers.fetch_add(1, Ordering::Relaxed);
        ViewerGuard { meter: self }
    }

    /// Count a streamed frame that took `annotate` to produce.
    pub fn record_frame(&self, annotate: Duration) {
        let micros = u64::try_from(annotate.as_micros()).unwrap_or(u64::MAX);
        self.annotate_micros.fetch_add(micros, Ordering::Relaxed);
        self.streamed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_annotated(&self) {
        self.annotated_images.fetch_add(1, Ordering::Relaxed);
    }

    /// Take the statistics and start counting anew. The viewer count is kept.
    pub fn take_report(&self) -> Report {
        let streamed_frames = self.streamed_frames.swap(0, Ordering::Relaxed);
        let annotate_micros = self.annotate_micros.swap(0, Ordering::Relaxed);
        let mean_annotate = match streamed_frames {
            0 => None,
            n => Some(Duration::from_micros(annotate_micros / n)),
        };

        Report {
            viewers: self.viewers.load(Ordering::Relaxed),
            streamed_frames,
            mean_annotate,
            annotated_images: self.annotated_images.swap(0, Ordering::Relaxed),
        }
    }
}

pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut report_interval = interval(REPORT_INTERVAL);
        report_interval.tick().await;

        loop {
            let start = Instant::now();
            report_interval.tick().await;
            let report = METER.take_report();

            if let Some(mean_annotate) = report.mean_annotate {
                let fps = report.streamed_frames as f32 / start.elapsed().as_secs_f32();
                log::info!(
                    "{} viewers, {fps:.2} streamed frames per second, {mean_annotate:?} per frame",
                    report.viewers
                );
            }
            if report.annotated_images > 0 {
                log::info!("Annotated {} uploaded images", report.annotated_images);
            }
        }
    })
}
