//! Camera session shared by the HTTP handlers.
//!
//! The session is either off or holds exactly one open frame source. Turning it on or off twice
//! in a row is a no-op. Frame reads go through the session lock, so concurrent viewers never
//! read from the device at the same time. The on/off flag is readable without the lock, which may
//! be held for a whole frame interval.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, MutexGuard, PoisonError,
};

use anyhow::Result;
use image::RgbImage;

use crate::sensors::{CameraOpener, FrameSource};

pub struct CameraSession {
    opener: Box<dyn CameraOpener>,
    source: Mutex<Option<Box<dyn FrameSource>>>,
    /// Mirrors `source.is_some()`, only written with the lock held.
    on: AtomicBool,
}

impl CameraSession {
    pub fn new(opener: Box<dyn CameraOpener>) -> Self {
        Self {
            opener,
            source: Mutex::new(None),
            on: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn FrameSource>>> {
        self.source.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the camera unless it is already on.
    ///
    /// Returns whether the camera was opened by this call. Opening may block.
    pub fn turn_on(&self) -> Result<bool> {
        let mut source = self.lock();
        if source.is_some() {
            return Ok(false);
        }

        *source = Some(self.opener.open()?);
        self.on.store(true, Ordering::Release);
        log::info!("Camera turned on");
        Ok(true)
    }

    /// Release the camera if it is on.
    ///
    /// Returns whether the camera was released by this call.
    pub fn turn_off(&self) -> bool {
        let mut source = self.lock();
        self.on.store(false, Ordering::Release);
        let released = source.take().is_some();
        drop(source);

        if released {
            log::info!("Camera turned off");
        }
        released
    }

    /// Whether the camera is on. Never waits for a running capture.
    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::Acquire)
    }

    /// Capture one frame, blocking until it is available.
    ///
    /// Returns `None` if the camera is off or the read failed.
    pub fn capture(&self) -> Option<RgbImage> {
        self.lock().as_mut()?.capture()
    }
}
