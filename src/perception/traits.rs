use async_trait::async_trait;

use crate::errors::CaptureError;
use crate::perception::types::{Capture, SurfaceSelector};

/// Source of snapshots of the mirrored surface.
#[async_trait]
pub trait PerceptionAdapter: Send + Sync {
    async fn capture(&self, selector: &SurfaceSelector) -> Result<Capture, CaptureError>;
}
