use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of actions the model may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    LongPress,
    Type,
    Scroll,
    Drag,
    Swipe,
    Hotkey,
    Wait,
    Finished,
    Failed,
    /// Hands the device back to a human.
    CallUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Number,
    Text,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Number => f.write_str("number"),
            ParamType::Text => f.write_str("string"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: ParamType,
    pub required: bool,
}

const fn num(name: &'static str, required: bool) -> ParamSpec {
    ParamSpec { name, ty: ParamType::Number, required }
}

const fn text(name: &'static str, required: bool) -> ParamSpec {
    ParamSpec { name, ty: ParamType::Text, required }
}

const CLICK: &[ParamSpec] = &[num("x", true), num("y", true)];
const LONG_PRESS: &[ParamSpec] = &[num("x", true), num("y", true), num("duration_ms", false)];
const TYPE: &[ParamSpec] = &[text("content", true)];
const SCROLL: &[ParamSpec] = &[
    text("direction", true),
    num("x", false),
    num("y", false),
    num("amount", false),
];
const DRAG: &[ParamSpec] = &[num("x", true), num("y", true), num("x2", true), num("y2", true)];
const SWIPE: &[ParamSpec] = &[text("direction", true), num("x", false), num("y", false)];
const HOTKEY: &[ParamSpec] = &[text("key", true)];
const WAIT: &[ParamSpec] = &[num("seconds", false)];
const FINISHED: &[ParamSpec] = &[text("content", false)];
const FAILED: &[ParamSpec] = &[text("reason", false)];
const CALL_USER: &[ParamSpec] = &[text("content", false)];

pub const DIRECTIONS: &[&str] = &["up", "down", "left", "right"];

impl ActionKind {
    pub const ALL: [ActionKind; 11] = [
        ActionKind::Click,
        ActionKind::LongPress,
        ActionKind::Type,
        ActionKind::Scroll,
        ActionKind::Drag,
        ActionKind::Swipe,
        ActionKind::Hotkey,
        ActionKind::Wait,
        ActionKind::Finished,
        ActionKind::Failed,
        ActionKind::CallUser,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ActionKind::Click => "click",
            ActionKind::LongPress => "long_press",
            ActionKind::Type => "type",
            ActionKind::Scroll => "scroll",
            ActionKind::Drag => "drag",
            ActionKind::Swipe => "swipe",
            ActionKind::Hotkey => "hotkey",
            ActionKind::Wait => "wait",
            ActionKind::Finished => "finished",
            ActionKind::Failed => "failed",
            ActionKind::CallUser => "call_user",
        }
    }

    /// Resolves a call name, including the UI-TARS spellings some models emit.
    pub fn from_name(name: &str) -> Option<ActionKind> {
        let kind = match name {
            "click" | "tap" | "left_single" => ActionKind::Click,
            "long_press" => ActionKind::LongPress,
            "type" => ActionKind::Type,
            "scroll" => ActionKind::Scroll,
            "drag" | "select" => ActionKind::Drag,
            "swipe" => ActionKind::Swipe,
            "hotkey" => ActionKind::Hotkey,
            "wait" => ActionKind::Wait,
            "finished" => ActionKind::Finished,
            "failed" => ActionKind::Failed,
            "call_user" => ActionKind::CallUser,
            _ => return None,
        };
        Some(kind)
    }

    pub fn schema(self) -> &'static [ParamSpec] {
        match self {
            ActionKind::Click => CLICK,
            ActionKind::LongPress => LONG_PRESS,
            ActionKind::Type => TYPE,
            ActionKind::Scroll => SCROLL,
            ActionKind::Drag => DRAG,
            ActionKind::Swipe => SWIPE,
            ActionKind::Hotkey => HOTKEY,
            ActionKind::Wait => WAIT,
            ActionKind::Finished => FINISHED,
            ActionKind::Failed => FAILED,
            ActionKind::CallUser => CALL_USER,
        }
    }

    /// `finished`, `failed` and `call_user` end the run after the turn is recorded,
    /// unless the run is configured to hang on them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionKind::Finished | ActionKind::Failed | ActionKind::CallUser
        )
    }

    /// Call signature as shown to the model, e.g. `click(x=<number>, y=<number>)`.
    pub fn signature(self) -> String {
        let params: Vec<String> = self
            .schema()
            .iter()
            .map(|p| {
                let placeholder = match p.ty {
                    ParamType::Number => "<number>",
                    ParamType::Text => "'<text>'",
                };
                if p.required {
                    format!("{}={placeholder}", p.name)
                } else {
                    format!("[{}={placeholder}]", p.name)
                }
            })
            .collect();
        format!("{}({})", self.name(), params.join(", "))
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Text(String),
}

impl ParamValue {
    pub fn ty(&self) -> ParamType {
        match self {
            ParamValue::Number(_) => ParamType::Number,
            ParamValue::Text(_) => ParamType::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            params: BTreeMap::new(),
        }
    }

    pub fn with_number(mut self, name: &str, value: f64) -> Self {
        self.params.insert(name.to_string(), ParamValue::Number(value));
        self
    }

    pub fn with_text(mut self, name: &str, value: impl Into<String>) -> Self {
        self.params.insert(name.to_string(), ParamValue::Text(value.into()));
        self
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        match self.params.get(name) {
            Some(ParamValue::Number(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.params.get(name) {
            Some(ParamValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Primary point (`x`, `y`) when both are present.
    pub fn point(&self) -> Option<(f64, f64)> {
        Some((self.number("x")?, self.number("y")?))
    }

    /// Drag end point (`x2`, `y2`).
    pub fn end_point(&self) -> Option<(f64, f64)> {
        Some((self.number("x2")?, self.number("y2")?))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| match v {
                ParamValue::Number(n) => format!("{k}={n}"),
                ParamValue::Text(s) => format!("{k}='{}'", s.replace('\'', "\\'")),
            })
            .collect();
        write!(f, "{}({})", self.kind, params.join(", "))
    }
}
