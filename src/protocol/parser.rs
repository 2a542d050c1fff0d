//! Thought/Action protocol parser.
//!
//! A completion must look like:
//!
//! ```text
//! Thought: I will tap Settings.
//! Action: click(x=0.5, y=0.3)
//! ```
//!
//! Repeated `Thought:` lines are joined with a newline. Anything other than
//! exactly one `Action:` segment holding exactly one call is rejected so the
//! worker can ask the model to correct itself.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::ParseError;
use crate::protocol::action::{Action, ActionKind, ParamType, ParamValue, DIRECTIONS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedResponse {
    pub thought: String,
    pub action: Action,
    /// The call expression exactly as the model wrote it.
    pub raw_action: String,
}

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?i:(thought|action))\s*:\s*(.*)$").expect("static regex")
    })
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("static regex"))
}

enum Segment {
    Thought,
    Action,
}

pub fn parse_response(raw: &str) -> Result<ParsedResponse, ParseError> {
    let mut thoughts: Vec<String> = Vec::new();
    let mut actions: Vec<String> = Vec::new();
    let mut current: Option<Segment> = None;

    for line in raw.lines() {
        if let Some(caps) = marker_re().captures(line) {
            let body = caps[2].to_string();
            if caps[1].eq_ignore_ascii_case("thought") {
                thoughts.push(body);
                current = Some(Segment::Thought);
            } else {
                actions.push(body);
                current = Some(Segment::Action);
            }
            continue;
        }
        let target = match current {
            Some(Segment::Thought) => thoughts.last_mut(),
            Some(Segment::Action) => actions.last_mut(),
            None => None,
        };
        if let Some(buf) = target {
            buf.push('\n');
            buf.push_str(line);
        }
    }

    let raw_action = match actions.len() {
        0 => return Err(ParseError::MissingAction),
        1 => actions[0].trim().to_string(),
        n => return Err(ParseError::MultipleActions(n)),
    };

    let thought = thoughts
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    if thought.is_empty() {
        return Err(ParseError::MissingThought);
    }

    let action = parse_action(&raw_action)?;
    Ok(ParsedResponse {
        thought,
        action,
        raw_action,
    })
}

/// Parses a single call expression such as `click(x=0.5, y=0.3)`.
pub fn parse_action(expr: &str) -> Result<Action, ParseError> {
    let mut scanner = Scanner::new(expr);
    scanner.skip_ws();
    if scanner.at_end() {
        return Err(ParseError::MalformedCall("empty action segment".into()));
    }
    let call = scanner.call()?;

    let mut extra_calls = 0;
    loop {
        scanner.skip_separators();
        if scanner.at_end() {
            break;
        }
        // Anything after the first call must itself be a call to count as a second action.
        scanner.call().map_err(|_| {
            ParseError::MalformedCall(format!("unexpected trailing text after `{}`", call.name))
        })?;
        extra_calls += 1;
    }
    if extra_calls > 0 {
        return Err(ParseError::MultipleActions(extra_calls + 1));
    }

    let kind = ActionKind::from_name(&call.name)
        .ok_or_else(|| ParseError::UnknownAction(call.name.clone()))?;
    let params = normalize_params(kind, call.args)?;
    validate(kind, &params)?;
    Ok(Action { kind, params })
}

#[derive(Debug, Clone, PartialEq)]
enum RawValue {
    Quoted(String),
    Bare(String),
}

impl RawValue {
    fn as_str(&self) -> &str {
        match self {
            RawValue::Quoted(s) | RawValue::Bare(s) => s,
        }
    }
}

struct Call {
    name: String,
    args: Vec<(String, RawValue)>,
}

struct Scanner<'a> {
    chars: Vec<char>,
    pos: usize,
    src: &'a str,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
            src,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn skip_separators(&mut self) {
        while self.peek().is_some_and(|c| c.is_whitespace() || c == ';') {
            self.pos += 1;
        }
    }

    fn malformed(&self, what: &str) -> ParseError {
        ParseError::MalformedCall(format!("{what} in `{}`", self.src.trim()))
    }

    fn ident(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        if start == self.pos || self.chars[start].is_ascii_digit() {
            return Err(self.malformed("expected identifier"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn expect(&mut self, ch: char) -> Result<(), ParseError> {
        if self.peek() == Some(ch) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.malformed(&format!("expected `{ch}`")))
        }
    }

    fn call(&mut self) -> Result<Call, ParseError> {
        let name = self.ident()?;
        self.skip_ws();
        self.expect('(')?;
        let mut args = Vec::new();
        self.skip_ws();
        if self.peek() == Some(')') {
            self.pos += 1;
            return Ok(Call { name, args });
        }
        loop {
            self.skip_ws();
            let key = self.ident()?;
            self.skip_ws();
            self.expect('=')?;
            self.skip_ws();
            let value = self.value()?;
            args.push((key, value));
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.pos += 1;
                    self.skip_ws();
                    // Tolerate a trailing comma.
                    if self.peek() == Some(')') {
                        self.pos += 1;
                        return Ok(Call { name, args });
                    }
                }
                Some(')') => {
                    self.pos += 1;
                    return Ok(Call { name, args });
                }
                _ => return Err(self.malformed("expected `,` or `)`")),
            }
        }
    }

    fn value(&mut self) -> Result<RawValue, ParseError> {
        match self.peek() {
            Some(q @ ('\'' | '"')) => {
                self.pos += 1;
                let mut out = String::new();
                loop {
                    match self.peek() {
                        None => return Err(self.malformed("unterminated string")),
                        Some('\\') => {
                            self.pos += 1;
                            match self.peek() {
                                Some('n') => out.push('\n'),
                                Some('t') => out.push('\t'),
                                Some(c) => out.push(c),
                                None => return Err(self.malformed("unterminated string")),
                            }
                            self.pos += 1;
                        }
                        Some(c) if c == q => {
                            self.pos += 1;
                            return Ok(RawValue::Quoted(out));
                        }
                        Some(c) => {
                            out.push(c);
                            self.pos += 1;
                        }
                    }
                }
            }
            Some('(') => {
                // Unquoted point such as `(10,20)`.
                let start = self.pos;
                let mut depth = 0usize;
                while let Some(c) = self.peek() {
                    self.pos += 1;
                    match c {
                        '(' => depth += 1,
                        ')' => {
                            depth -= 1;
                            if depth == 0 {
                                return Ok(RawValue::Bare(
                                    self.chars[start..self.pos].iter().collect(),
                                ));
                            }
                        }
                        _ => {}
                    }
                }
                Err(self.malformed("unbalanced parentheses"))
            }
            _ => {
                let start = self.pos;
                while self.peek().is_some_and(|c| c != ',' && c != ')') {
                    self.pos += 1;
                }
                let token: String = self.chars[start..self.pos].iter().collect();
                let token = token.trim().to_string();
                if token.is_empty() {
                    return Err(self.malformed("missing value"));
                }
                Ok(RawValue::Bare(token))
            }
        }
    }
}

/// Maps alias parameter names onto the canonical schema and types each value.
fn normalize_params(
    kind: ActionKind,
    args: Vec<(String, RawValue)>,
) -> Result<BTreeMap<String, ParamValue>, ParseError> {
    let invalid = |reason: String| ParseError::InvalidParameters {
        action: kind.name().to_string(),
        reason,
    };
    let mut params: BTreeMap<String, ParamValue> = BTreeMap::new();
    let insert = |params: &mut BTreeMap<String, ParamValue>, key: &str, value: ParamValue| {
        if params.insert(key.to_string(), value).is_some() {
            return Err(invalid(format!("parameter `{key}` given more than once")));
        }
        Ok(())
    };

    for (key, raw) in args {
        match key.as_str() {
            "start_box" | "point" | "start_point" | "end_box" | "end_point" => {
                let (x, y) = parse_point(raw.as_str())
                    .ok_or_else(|| invalid(format!("`{key}` is not a point: {}", raw.as_str())))?;
                let (kx, ky) = if key.starts_with("end") { ("x2", "y2") } else { ("x", "y") };
                insert(&mut params, kx, ParamValue::Number(x))?;
                insert(&mut params, ky, ParamValue::Number(y))?;
            }
            _ => {
                let canonical = match (kind, key.as_str()) {
                    (ActionKind::Hotkey, "hotkey") => "key",
                    (ActionKind::Type, "text") => "content",
                    (_, other) => other,
                };
                let Some(spec) = kind.schema().iter().find(|p| p.name == canonical) else {
                    return Err(invalid(format!("unexpected parameter `{key}`")));
                };
                let value = match (spec.ty, raw) {
                    (ParamType::Number, RawValue::Bare(s)) => s
                        .parse::<f64>()
                        .ok()
                        .filter(|n| n.is_finite())
                        .map(ParamValue::Number)
                        .ok_or_else(|| invalid(format!("`{key}` expects a number, got `{s}`")))?,
                    (ParamType::Number, RawValue::Quoted(s)) => {
                        return Err(invalid(format!("`{key}` expects a number, got string '{s}'")));
                    }
                    (ParamType::Text, RawValue::Quoted(s)) => ParamValue::Text(s),
                    (ParamType::Text, RawValue::Bare(s)) => {
                        if s.parse::<f64>().is_ok() {
                            return Err(invalid(format!("`{key}` expects a string, got number {s}")));
                        }
                        ParamValue::Text(s)
                    }
                };
                // Executors match directions exactly.
                let value = match value {
                    ParamValue::Text(dir) if canonical == "direction" => {
                        ParamValue::Text(dir.trim().to_ascii_lowercase())
                    }
                    other => other,
                };
                insert(&mut params, canonical, value)?;
            }
        }
    }
    Ok(params)
}

fn validate(kind: ActionKind, params: &BTreeMap<String, ParamValue>) -> Result<(), ParseError> {
    let invalid = |reason: String| ParseError::InvalidParameters {
        action: kind.name().to_string(),
        reason,
    };
    for spec in kind.schema() {
        match params.get(spec.name) {
            None if spec.required => {
                return Err(invalid(format!("missing required parameter `{}`", spec.name)));
            }
            Some(value) if value.ty() != spec.ty => {
                return Err(invalid(format!("`{}` expects a {}", spec.name, spec.ty)));
            }
            _ => {}
        }
    }
    for key in params.keys() {
        if !kind.schema().iter().any(|p| p.name == key) {
            return Err(invalid(format!("unexpected parameter `{key}`")));
        }
    }
    if let Some(ParamValue::Text(dir)) = params.get("direction") {
        if !DIRECTIONS.contains(&dir.to_ascii_lowercase().as_str()) {
            return Err(invalid(format!(
                "direction must be one of {}, got `{dir}`",
                DIRECTIONS.join("/")
            )));
        }
    }
    Ok(())
}

/// Extracts a point from the formats models use for boxes.
///
/// Two numbers are a point; four numbers are a box and resolve to its centre.
pub fn parse_point(raw: &str) -> Option<(f64, f64)> {
    let cleaned = raw
        .replace("<|box_start|>", " ")
        .replace("<|box_end|>", " ")
        .replace("<point>", " ")
        .replace("</point>", " ")
        .replace("<bbox>", " ")
        .replace("</bbox>", " ");
    let nums: Vec<f64> = number_re()
        .find_iter(&cleaned)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();
    match nums.as_slice() {
        [x, y] => Some((*x, *y)),
        [x1, y1, x2, y2] => Some(((x1 + x2) / 2.0, (y1 + y2) / 2.0)),
        _ => None,
    }
}
