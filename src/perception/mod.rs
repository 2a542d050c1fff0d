pub mod fingerprint;
pub mod image_prep;
#[cfg(feature = "desktop")]
pub mod screenshot;
pub mod traits;
pub mod types;

pub use traits::PerceptionAdapter;
pub use types::{CalibrationTransform, Capture, Snapshot, SurfaceSelector};
