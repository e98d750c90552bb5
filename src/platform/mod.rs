//! Platform Abstraction Layer
//!
//! The kernel only knows two devices: a display sink that accepts DRAW
//! requests, and a keyboard source that produces key presses. Everything
//! host-specific lives behind these types.

pub mod native;

pub use native::{TextDisplay, spawn_keyboard};

use serde_json::Value;

/// Columns of the `text-display` form
pub const TEXT_COLS: usize = 80;
/// Rows of the `text-display` form
pub const TEXT_ROWS: usize = 24;

/// The only form the built-in display understands
pub const TEXT_DISPLAY_FORM: &str = "text-display";

/// Key event from input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    /// The key value (e.g., "a", "Enter", "Backspace")
    pub key: String,
    /// The key code (e.g., "KeyA", "Enter", "Backspace")
    pub code: String,
}

impl KeyEvent {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        let code = match key.chars().next() {
            Some(c) if key.chars().count() == 1 && c.is_ascii_alphabetic() => {
                format!("Key{}", c.to_ascii_uppercase())
            }
            Some(c) if key.chars().count() == 1 && c.is_ascii_digit() => format!("Digit{}", c),
            Some(' ') if key.len() == 1 => "Space".to_string(),
            _ => key.clone(),
        };
        Self { key, code }
    }
}

/// Where DRAW requests end up. The kernel forwards `data` untouched.
pub trait DisplaySink {
    fn draw(&mut self, form: &str, data: &Value);
}

/// Flatten DRAW data for the text display into exactly 80x24 characters.
///
/// Accepts a string or an array of one-character strings; short input is
/// padded with spaces, long input is cut off. Returns `None` for any other
/// shape.
pub fn text_cells(data: &Value) -> Option<Vec<char>> {
    let mut cells: Vec<char> = match data {
        Value::String(s) => s.chars().collect(),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().and_then(|s| s.chars().next()).unwrap_or(' '))
            .collect(),
        _ => return None,
    };
    cells.resize(TEXT_COLS * TEXT_ROWS, ' ');
    Some(cells)
}
