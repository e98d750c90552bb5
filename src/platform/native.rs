//! Native terminal platform
//!
//! Renders the text display as plain lines on any writer and turns lines of
//! input into key presses for the kernel.

use super::{DisplaySink, KeyEvent, TEXT_COLS, TEXT_DISPLAY_FORM, text_cells};
use crate::kernel::{Inbound, KernelSender};
use serde_json::Value;
use std::io::{BufRead, Write};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Display sink for the `text-display` form
pub struct TextDisplay<W: Write> {
    out: W,
    frame: Option<Vec<char>>,
    frames: usize,
}

impl<W: Write> TextDisplay<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            frame: None,
            frames: 0,
        }
    }

    /// The last frame drawn, one string per row with trailing blanks trimmed
    pub fn lines(&self) -> Vec<String> {
        self.frame
            .as_deref()
            .map(|cells| {
                cells
                    .chunks(TEXT_COLS)
                    .map(|row| row.iter().collect::<String>().trim_end().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of frames drawn so far
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn render(&mut self) -> std::io::Result<()> {
        let rule = "-".repeat(TEXT_COLS);
        writeln!(self.out, "+{}+", rule)?;
        if let Some(cells) = &self.frame {
            for row in cells.chunks(TEXT_COLS) {
                writeln!(self.out, "|{}|", row.iter().collect::<String>())?;
            }
        }
        writeln!(self.out, "+{}+", rule)?;
        self.out.flush()
    }
}

impl<W: Write> DisplaySink for TextDisplay<W> {
    fn draw(&mut self, form: &str, data: &Value) {
        if form != TEXT_DISPLAY_FORM {
            debug!(form, "unsupported display form");
            return;
        }
        let Some(cells) = text_cells(data) else {
            debug!("text-display data is neither a string nor an array");
            return;
        };

        self.frame = Some(cells);
        self.frames += 1;
        if let Err(e) = self.render() {
            warn!(error = %e, "failed to render frame");
        }
    }
}

/// Feed key presses from a line-oriented reader into the kernel.
///
/// Every character of a line becomes one key press, followed by `Enter`.
/// End of input shuts the kernel down.
pub fn spawn_keyboard<R>(reader: R, kernel: KernelSender) -> std::io::Result<JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    thread::Builder::new()
        .name("keyboard".to_string())
        .spawn(move || {
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "keyboard read failed");
                        break;
                    }
                };
                let keys = line
                    .chars()
                    .map(|c| KeyEvent::new(c.to_string()))
                    .chain(std::iter::once(KeyEvent::new("Enter")));
                for key in keys {
                    if kernel.unbounded_send(Inbound::Key(key)).is_err() {
                        return;
                    }
                }
            }
            let _ = kernel.unbounded_send(Inbound::Shutdown);
        })
}
