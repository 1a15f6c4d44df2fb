use image::DynamicImage;
use log::info;
use xcap::Monitor;

use crate::error::CaptureError;

use super::source::{Frame, FrameSource};

/// Grabs frames from the primary monitor. The monitor handle is
/// resolved once at construction; display hotplug requires a restart.
pub struct PrimaryMonitorSource {
    monitor: Monitor,
}

impl PrimaryMonitorSource {
    pub fn new() -> Result<Self, CaptureError> {
        let monitors = Monitor::all().map_err(|e| CaptureError(e.to_string()))?;
        let monitor = monitors
            .into_iter()
            .find(|m| m.is_primary())
            .ok_or_else(|| CaptureError("no primary monitor found".into()))?;

        info!(
            "capturing monitor {} ({}x{})",
            monitor.name(),
            monitor.width(),
            monitor.height()
        );
        Ok(Self { monitor })
    }
}

impl FrameSource for PrimaryMonitorSource {
    fn grab(&mut self) -> Result<Option<Frame>, CaptureError> {
        let rgba = self
            .monitor
            .capture_image()
            .map_err(|e| CaptureError(e.to_string()))?;
        Ok(Some(DynamicImage::ImageRgba8(rgba).to_rgb8()))
    }
}
