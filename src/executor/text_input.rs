// Keyboard helpers shared by input backends.
use crate::errors::ExecutionError;

/// Returns true if the text contains CJK (Chinese/Japanese/Korean) characters.
pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c)
        || ('\u{3040}'..='\u{309f}').contains(&c)
        || ('\u{30a0}'..='\u{30ff}').contains(&c)
        || ('\u{ac00}'..='\u{d7af}').contains(&c))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Command,
    Control,
    Alt,
    Shift,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyName {
    Return,
    Tab,
    Space,
    Escape,
    Backspace,
    Up,
    Down,
    Left,
    Right,
    Char(char),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chord {
    pub modifiers: Vec<Modifier>,
    pub key: KeyName,
}

/// Parses `cmd+shift+a`, `enter`, `home` and similar key descriptions.
///
/// The mirroring app maps device buttons onto shortcuts: `home` is ⌘1,
/// `app_switcher` ⌘2 and `spotlight` ⌘3.
pub fn parse_hotkey(spec: &str) -> Result<Chord, ExecutionError> {
    let spec = spec.trim().to_lowercase();
    match spec.as_str() {
        "home" => return Ok(cmd_digit('1')),
        "app_switcher" | "appswitcher" => return Ok(cmd_digit('2')),
        "spotlight" => return Ok(cmd_digit('3')),
        _ => {}
    }

    let parts: Vec<&str> = spec
        .split(['+', ' '])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    let Some((last, mods)) = parts.split_last() else {
        return Err(ExecutionError::Failed("empty hotkey".into()));
    };

    let modifiers = mods
        .iter()
        .map(|m| match *m {
            "cmd" | "command" | "meta" => Ok(Modifier::Command),
            "ctrl" | "control" => Ok(Modifier::Control),
            "alt" | "option" => Ok(Modifier::Alt),
            "shift" => Ok(Modifier::Shift),
            other => Err(ExecutionError::Failed(format!("unsupported modifier: {other}"))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let key = match *last {
        "return" | "enter" => KeyName::Return,
        "tab" => KeyName::Tab,
        "space" => KeyName::Space,
        "esc" | "escape" => KeyName::Escape,
        "delete" | "backspace" => KeyName::Backspace,
        "up" => KeyName::Up,
        "down" => KeyName::Down,
        "left" => KeyName::Left,
        "right" => KeyName::Right,
        other => {
            let mut chars = other.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => KeyName::Char(c),
                _ => return Err(ExecutionError::Failed(format!("unsupported key: {other}"))),
            }
        }
    };
    Ok(Chord { modifiers, key })
}

fn cmd_digit(c: char) -> Chord {
    Chord {
        modifiers: vec![Modifier::Command],
        key: KeyName::Char(c),
    }
}
