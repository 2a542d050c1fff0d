use serde::{Deserialize, Serialize};

use crate::config::{CoordinateSpace, PerceptionConfig};

/// Encoded image of the mirrored surface at one instant.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub bytes: Vec<u8>,
    /// `image/png` or `image/jpeg`.
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub captured_at: chrono::DateTime<chrono::Utc>,
}

/// Which window holds the mirrored device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceSelector {
    pub app_name: String,
    /// Extra substring the window title must contain.
    pub window_contains: Option<String>,
}

impl SurfaceSelector {
    pub fn from_config(cfg: &PerceptionConfig) -> Self {
        Self {
            app_name: cfg.app_name.clone(),
            window_contains: cfg.window_contains.clone(),
        }
    }

    pub fn matches(&self, app_name: &str, title: &str) -> bool {
        let app_ok = app_name.contains(&self.app_name) || title.contains(&self.app_name);
        let title_ok = self
            .window_contains
            .as_deref()
            .map_or(true, |needle| title.contains(needle));
        app_ok && title_ok
    }
}

/// Maps model-space coordinates onto the screen for the snapshot it was captured with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTransform {
    /// Window origin in screen points.
    pub origin_x: f64,
    pub origin_y: f64,
    /// Window size in screen points.
    pub width: f64,
    pub height: f64,
    /// Snapshot pixels per screen point.
    pub scale_factor: f64,
    pub space: CoordinateSpace,
    pub coord_factor: f64,
}

impl CalibrationTransform {
    /// Fraction of the surface (0.0–1.0, clamped) for a model-space point.
    pub fn to_fraction(&self, x: f64, y: f64) -> (f64, f64) {
        let factor = if self.coord_factor > 0.0 { self.coord_factor } else { 1000.0 };
        let (fx, fy) = match self.space {
            CoordinateSpace::Normalized => (x, y),
            CoordinateSpace::Thousandths => (x / factor, y / factor),
            CoordinateSpace::Auto if x <= 1.0 && y <= 1.0 => (x, y),
            CoordinateSpace::Auto => (x / factor, y / factor),
        };
        (fx.clamp(0.0, 1.0), fy.clamp(0.0, 1.0))
    }

    /// Screen point for a model-space point.
    pub fn to_screen(&self, x: f64, y: f64) -> (f64, f64) {
        let (fx, fy) = self.to_fraction(x, y);
        (self.origin_x + fx * self.width, self.origin_y + fy * self.height)
    }

    /// Centre of the surface in screen points.
    pub fn center(&self) -> (f64, f64) {
        (self.origin_x + self.width / 2.0, self.origin_y + self.height / 2.0)
    }
}

/// A snapshot together with the transform that was valid when it was taken.
#[derive(Debug, Clone)]
pub struct Capture {
    pub snapshot: Snapshot,
    pub transform: CalibrationTransform,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform(space: CoordinateSpace) -> CalibrationTransform {
        CalibrationTransform {
            origin_x: 100.0,
            origin_y: 50.0,
            width: 400.0,
            height: 800.0,
            scale_factor: 2.0,
            space,
            coord_factor: 1000.0,
        }
    }

    #[test]
    fn auto_space_reads_small_values_as_fractions() {
        let t = transform(CoordinateSpace::Auto);
        assert_eq!(t.to_screen(0.5, 0.3), (300.0, 290.0));
        assert_eq!(t.to_screen(500.0, 300.0), (300.0, 290.0));
    }

    #[test]
    fn thousandths_space_always_divides() {
        let t = transform(CoordinateSpace::Thousandths);
        assert_eq!(t.to_fraction(1.0, 0.0), (0.001, 0.0));
    }

    #[test]
    fn out_of_range_points_are_clamped_to_the_surface() {
        let t = transform(CoordinateSpace::Normalized);
        assert_eq!(t.to_screen(1.5, -0.2), (500.0, 50.0));
    }

    #[test]
    fn selector_matches_app_and_title() {
        let sel = SurfaceSelector {
            app_name: "iPhone Mirroring".into(),
            window_contains: Some("iPhone".into()),
        };
        assert!(sel.matches("iPhone Mirroring", "iPhone"));
        assert!(!sel.matches("Finder", "Documents"));
    }
}
