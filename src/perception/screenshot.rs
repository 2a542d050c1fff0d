//! Window capture of the mirroring app via `xcap`.

use async_trait::async_trait;

use crate::config::PerceptionConfig;
use crate::errors::CaptureError;
use crate::perception::traits::PerceptionAdapter;
use crate::perception::types::{CalibrationTransform, Capture, Snapshot, SurfaceSelector};

pub struct XcapWindowCapture {
    config: PerceptionConfig,
}

impl XcapWindowCapture {
    pub fn new(config: PerceptionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PerceptionAdapter for XcapWindowCapture {
    async fn capture(&self, selector: &SurfaceSelector) -> Result<Capture, CaptureError> {
        let selector = selector.clone();
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || capture_window(&selector, &config))
            .await
            .map_err(|e| CaptureError::Unavailable(format!("capture task failed: {e}")))?
    }
}

fn capture_window(selector: &SurfaceSelector, config: &PerceptionConfig) -> Result<Capture, CaptureError> {
    let windows = xcap::Window::all()
        .map_err(|e| CaptureError::Unavailable(format!("window list: {e}")))?;
    let window = windows
        .into_iter()
        .find(|w| !w.is_minimized() && selector.matches(w.app_name(), w.title()))
        .ok_or_else(|| CaptureError::Unavailable(format!("no window for '{}'", selector.app_name)))?;

    let image = window
        .capture_image()
        .map_err(|e| CaptureError::Unavailable(format!("window capture: {e}")))?;
    let (px_w, px_h) = image.dimensions();

    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgba8(image)
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|e| CaptureError::Unavailable(format!("PNG encode: {e}")))?;

    let width = f64::from(window.width());
    let scale_factor = if width > 0.0 { f64::from(px_w) / width } else { 1.0 };
    tracing::debug!(
        title = window.title(),
        x = window.x(),
        y = window.y(),
        px_w,
        px_h,
        scale_factor,
        "window captured"
    );

    Ok(Capture {
        snapshot: Snapshot {
            bytes,
            mime: "image/png".into(),
            width: px_w,
            height: px_h,
            captured_at: chrono::Utc::now(),
        },
        transform: CalibrationTransform {
            origin_x: f64::from(window.x()),
            origin_y: f64::from(window.y()),
            width,
            height: f64::from(window.height()),
            scale_factor,
            space: config.coordinate_space,
            coord_factor: config.coord_factor,
        },
    })
}
