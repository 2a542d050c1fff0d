//! Scripted fakes for the perception, model and executor contracts.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::agent_engine::Collaborators;
use crate::config::{AppConfig, CoordinateSpace};
use crate::errors::{CaptureError, ExecutionError, ModelError};
use crate::executor::{ActionExecutor, CalibratedAction, ExecutionReport};
use crate::llm::types::ChatMessage;
use crate::llm::ModelClient;
use crate::perception::{CalibrationTransform, Capture, PerceptionAdapter, Snapshot, SurfaceSelector};

/// Config tuned for tests: records under `dir`, no pacing, millisecond backoff.
pub fn test_config(dir: &Path) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.recorder.dir = Some(dir.to_path_buf());
    cfg.recorder.save_snapshots = true;
    cfg.agent.loop_interval_ms = 0;
    cfg.agent.retry.initial_backoff_ms = 1;
    cfg.agent.retry.max_backoff_ms = 5;
    cfg.agent.timeouts.capture_ms = 1_000;
    cfg.agent.timeouts.model_ms = 1_000;
    cfg.agent.timeouts.execute_ms = 1_000;
    cfg.perception.coordinate_space = CoordinateSpace::Auto;
    cfg
}

pub fn collaborators(
    perception: Arc<FakePerception>,
    model: Arc<ScriptedModel>,
    executor: Arc<RecordingExecutor>,
) -> Collaborators {
    Collaborators {
        perception,
        model,
        executor,
    }
}

/// A `w`x`h` grey PNG.
pub fn png(w: u32, h: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(w, h, image::Rgb([120, 120, 120]));
    let mut out = std::io::Cursor::new(Vec::new());
    // Encoding an in-memory RGB buffer cannot fail.
    let _ = image::DynamicImage::ImageRgb8(img).write_to(&mut out, image::ImageFormat::Png);
    out.into_inner()
}

/// A `w`x`h` horizontal grey gradient, brightening to the right when `rising`.
/// Rising and falling gradients have maximally different fingerprints.
pub fn gradient_png(w: u32, h: u32, rising: bool) -> Vec<u8> {
    let img = image::GrayImage::from_fn(w, h, |x, _| {
        let v = (x * 255 / w.saturating_sub(1).max(1)) as u8;
        image::Luma([if rising { v } else { 255 - v }])
    });
    let mut out = std::io::Cursor::new(Vec::new());
    let _ = image::DynamicImage::ImageLuma8(img).write_to(&mut out, image::ImageFormat::Png);
    out.into_inner()
}

pub fn reply(thought: &str, action: &str) -> String {
    format!("Thought: {thought}\nAction: {action}")
}

/// Model that answers from a script, then repeats `fallback` (or fails when unset).
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<String, ModelError>>>,
    fallback: Option<String>,
    delay: Duration,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<Result<String, ModelError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            delay: Duration::ZERO,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Replies that all succeed.
    pub fn replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(replies.into_iter().map(|r| Ok(r.into())).collect())
    }

    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    /// Sleeps this long before every answer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every message list the model was called with, in call order.
    pub fn prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or_default()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ModelError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(messages.to_vec());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match (next, &self.fallback) {
            (Some(answer), _) => answer,
            (None, Some(fallback)) => Ok(fallback.clone()),
            (None, None) => Err(ModelError::Rejected {
                status: 400,
                body: "script exhausted".into(),
            }),
        }
    }
}

/// Perception that serves snapshots in rotation, optionally failing its first captures.
pub struct FakePerception {
    frames: Vec<Vec<u8>>,
    served: Mutex<usize>,
    width: u32,
    height: u32,
    failures: Mutex<VecDeque<CaptureError>>,
    captures: Mutex<usize>,
}

impl FakePerception {
    pub fn new() -> Self {
        Self::sized(200, 400)
    }

    pub fn sized(width: u32, height: u32) -> Self {
        Self {
            frames: vec![png(width, height)],
            served: Mutex::new(0),
            width,
            height,
            failures: Mutex::new(VecDeque::new()),
            captures: Mutex::new(0),
        }
    }

    /// Cycles through `frames` (encoded `width`x`height` images), one per successful capture.
    pub fn with_frames(mut self, frames: Vec<Vec<u8>>) -> Self {
        if !frames.is_empty() {
            self.frames = frames;
        }
        self
    }

    pub fn failing_first(self, errors: Vec<CaptureError>) -> Self {
        if let Ok(mut f) = self.failures.lock() {
            f.extend(errors);
        }
        self
    }

    pub fn captures(&self) -> usize {
        self.captures.lock().map(|c| *c).unwrap_or_default()
    }

    /// The transform every capture reports: window at (100, 50), one point per pixel.
    pub fn transform(&self) -> CalibrationTransform {
        CalibrationTransform {
            origin_x: 100.0,
            origin_y: 50.0,
            width: self.width as f64,
            height: self.height as f64,
            scale_factor: 1.0,
            space: CoordinateSpace::Auto,
            coord_factor: 1000.0,
        }
    }
}

impl Default for FakePerception {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PerceptionAdapter for FakePerception {
    async fn capture(&self, _selector: &SurfaceSelector) -> Result<Capture, CaptureError> {
        if let Ok(mut n) = self.captures.lock() {
            *n += 1;
        }
        if let Some(err) = self.failures.lock().ok().and_then(|mut f| f.pop_front()) {
            return Err(err);
        }
        let frame = match self.served.lock() {
            Ok(mut n) => {
                *n += 1;
                (*n - 1) % self.frames.len()
            }
            Err(_) => 0,
        };
        Ok(Capture {
            snapshot: Snapshot {
                bytes: self.frames[frame].clone(),
                mime: "image/png".into(),
                width: self.width,
                height: self.height,
                captured_at: chrono::Utc::now(),
            },
            transform: self.transform(),
        })
    }
}

/// Executor that records every action and answers from a script, then succeeds.
pub struct RecordingExecutor {
    script: Mutex<VecDeque<Result<ExecutionReport, ExecutionError>>>,
    executed: Mutex<Vec<CalibratedAction>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(script: Vec<Result<ExecutionReport, ExecutionError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn executed(&self) -> Vec<CalibratedAction> {
        self.executed.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl Default for RecordingExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn execute(&self, action: &CalibratedAction) -> Result<ExecutionReport, ExecutionError> {
        if let Ok(mut e) = self.executed.lock() {
            e.push(action.clone());
        }
        match self.script.lock().ok().and_then(|mut s| s.pop_front()) {
            Some(result) => result,
            None => Ok(ExecutionReport::ok(format!("{} done", action.action.kind.name()))),
        }
    }
}
