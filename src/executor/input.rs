// Physical input simulation through enigo.
use std::thread::sleep;
use std::time::Duration;

use async_trait::async_trait;
use enigo::{Axis, Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};

use crate::errors::ExecutionError;
use crate::executor::dispatcher::{ActionExecutor, CalibratedAction, ExecutionReport};
use crate::executor::text_input::{contains_cjk, parse_hotkey, KeyName, Modifier};
use crate::protocol::ActionKind;

const STEP: Duration = Duration::from_millis(20);
const MAX_WAIT_SECS: f64 = 10.0;

#[derive(Default)]
pub struct EnigoExecutor;

impl EnigoExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ActionExecutor for EnigoExecutor {
    async fn execute(&self, action: &CalibratedAction) -> Result<ExecutionReport, ExecutionError> {
        let action = action.clone();
        tokio::task::spawn_blocking(move || perform(&action))
            .await
            .map_err(|e| ExecutionError::Failed(format!("input task failed: {e}")))?
    }
}

fn input_err(e: impl std::fmt::Display) -> ExecutionError {
    ExecutionError::Failed(e.to_string())
}

fn required(point: Option<(f64, f64)>, what: &str) -> Result<(i32, i32), ExecutionError> {
    let (x, y) = point.ok_or_else(|| ExecutionError::Failed(format!("{what} has no target point")))?;
    Ok((x.round() as i32, y.round() as i32))
}

fn perform(calibrated: &CalibratedAction) -> Result<ExecutionReport, ExecutionError> {
    let action = &calibrated.action;
    if action.kind == ActionKind::Wait {
        let secs = action.number("seconds").unwrap_or(1.0).clamp(0.0, MAX_WAIT_SECS);
        sleep(Duration::from_secs_f64(secs));
        return Ok(ExecutionReport::ok(format!("waited {secs}s")));
    }

    // Enigo cannot connect without a display server or accessibility permission.
    let mut enigo = Enigo::new(&Settings::default())
        .map_err(|e| ExecutionError::SurfaceUnreachable(format!("input backend: {e}")))?;

    match action.kind {
        ActionKind::Click => {
            let (x, y) = required(calibrated.point, "click")?;
            enigo.move_mouse(x, y, Coordinate::Abs).map_err(input_err)?;
            enigo.button(Button::Left, Direction::Click).map_err(input_err)?;
            Ok(ExecutionReport::ok(format!("clicked ({x}, {y})")))
        }
        ActionKind::LongPress => {
            let (x, y) = required(calibrated.point, "long_press")?;
            let hold = action.number("duration_ms").unwrap_or(800.0).max(0.0);
            enigo.move_mouse(x, y, Coordinate::Abs).map_err(input_err)?;
            enigo.button(Button::Left, Direction::Press).map_err(input_err)?;
            sleep(Duration::from_millis(hold as u64));
            enigo.button(Button::Left, Direction::Release).map_err(input_err)?;
            Ok(ExecutionReport::ok(format!("long-pressed ({x}, {y}) for {hold}ms")))
        }
        ActionKind::Drag | ActionKind::Swipe => {
            let (x, y) = required(calibrated.point, action.kind.name())?;
            let (x2, y2) = required(calibrated.end_point, action.kind.name())?;
            enigo.move_mouse(x, y, Coordinate::Abs).map_err(input_err)?;
            enigo.button(Button::Left, Direction::Press).map_err(input_err)?;
            for i in 1..=10 {
                let t = f64::from(i) / 10.0;
                let ix = x + ((x2 - x) as f64 * t).round() as i32;
                let iy = y + ((y2 - y) as f64 * t).round() as i32;
                enigo.move_mouse(ix, iy, Coordinate::Abs).map_err(input_err)?;
                sleep(STEP);
            }
            enigo.button(Button::Left, Direction::Release).map_err(input_err)?;
            Ok(ExecutionReport::ok(format!("{} ({x}, {y}) → ({x2}, {y2})", action.kind)))
        }
        ActionKind::Scroll => {
            let (x, y) = required(calibrated.point, "scroll")?;
            let amount = action.number("amount").unwrap_or(5.0).abs().round() as i32;
            let (length, axis) = match action.text("direction").unwrap_or("down") {
                "up" => (-amount, Axis::Vertical),
                "left" => (-amount, Axis::Horizontal),
                "right" => (amount, Axis::Horizontal),
                _ => (amount, Axis::Vertical),
            };
            enigo.move_mouse(x, y, Coordinate::Abs).map_err(input_err)?;
            enigo.scroll(length, axis).map_err(input_err)?;
            Ok(ExecutionReport::ok(format!("scrolled {length} at ({x}, {y})")))
        }
        ActionKind::Type => {
            let content = action.text("content").unwrap_or_default();
            if contains_cjk(content) {
                // IMEs drop characters when a whole CJK string arrives at once.
                for c in content.chars() {
                    enigo.text(&c.to_string()).map_err(input_err)?;
                    sleep(STEP);
                }
            } else {
                enigo.text(content).map_err(input_err)?;
            }
            Ok(ExecutionReport::ok(format!("typed {} chars", content.chars().count())))
        }
        ActionKind::Hotkey => {
            let spec = action.text("key").unwrap_or_default();
            let chord = parse_hotkey(spec)?;
            let modifiers: Vec<Key> = chord.modifiers.iter().map(|m| modifier_key(*m)).collect();
            for m in &modifiers {
                enigo.key(*m, Direction::Press).map_err(input_err)?;
            }
            let pressed = enigo.key(key(&chord.key), Direction::Click).map_err(input_err);
            for m in modifiers.iter().rev() {
                enigo.key(*m, Direction::Release).map_err(input_err)?;
            }
            pressed?;
            Ok(ExecutionReport::ok(format!("pressed {spec}")))
        }
        ActionKind::Wait | ActionKind::Finished | ActionKind::Failed | ActionKind::CallUser => {
            Ok(ExecutionReport::ok("nothing to execute"))
        }
    }
}

fn modifier_key(m: Modifier) -> Key {
    match m {
        Modifier::Command => Key::Meta,
        Modifier::Control => Key::Control,
        Modifier::Alt => Key::Alt,
        Modifier::Shift => Key::Shift,
    }
}

fn key(k: &KeyName) -> Key {
    match k {
        KeyName::Return => Key::Return,
        KeyName::Tab => Key::Tab,
        KeyName::Space => Key::Space,
        KeyName::Escape => Key::Escape,
        KeyName::Backspace => Key::Backspace,
        KeyName::Up => Key::UpArrow,
        KeyName::Down => Key::DownArrow,
        KeyName::Left => Key::LeftArrow,
        KeyName::Right => Key::RightArrow,
        KeyName::Char(c) => Key::Unicode(*c),
    }
}
