//! Built-in programs
//!
//! `init` is the root process: it owns the screen, greets, runs `/bin/echo`
//! to show that children work, and then echoes key presses. `echo` prints
//! its arguments.

use super::client::{ClientError, Syscalls};
use crate::kernel::{Fd, Interrupt, ReadAmount, Signal};
use crate::platform::{TEXT_COLS, TEXT_DISPLAY_FORM, TEXT_ROWS};
use serde_json::Value;
use tracing::debug;

/// Interrupts carrying a child's output to init
pub const CHILD_OUTPUT: Signal = Signal(2);

/// What init asks `/bin/echo` to say
pub const GREETING: &str = "Welcome to jascos";

/// A character grid with a cursor. Output wraps at the last column and
/// scrolls at the last row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextScreen {
    cells: Vec<char>,
    row: usize,
    col: usize,
}

impl Default for TextScreen {
    fn default() -> Self {
        Self::new()
    }
}

impl TextScreen {
    pub fn new() -> Self {
        Self {
            cells: vec![' '; TEXT_COLS * TEXT_ROWS],
            row: 0,
            col: 0,
        }
    }

    /// (row, column)
    pub fn cursor(&self) -> (usize, usize) {
        (self.row, self.col)
    }

    pub fn write(&mut self, text: &str) {
        for c in text.chars() {
            self.put(c);
        }
    }

    pub fn put(&mut self, c: char) {
        match c {
            '\n' => self.newline(),
            '\r' => self.col = 0,
            c => {
                self.cells[self.row * TEXT_COLS + self.col] = c;
                self.col += 1;
                if self.col == TEXT_COLS {
                    self.newline();
                }
            }
        }
    }

    /// Erase the character left of the cursor, within the current row
    pub fn backspace(&mut self) {
        if self.col > 0 {
            self.col -= 1;
            self.cells[self.row * TEXT_COLS + self.col] = ' ';
        }
    }

    fn newline(&mut self) {
        self.col = 0;
        self.row += 1;
        if self.row == TEXT_ROWS {
            self.row = TEXT_ROWS - 1;
            self.scroll_up();
        }
    }

    fn scroll_up(&mut self) {
        self.cells.drain(..TEXT_COLS);
        self.cells.extend(std::iter::repeat_n(' ', TEXT_COLS));
    }

    /// One row with trailing blanks trimmed
    pub fn line(&self, row: usize) -> String {
        self.cells
            .chunks(TEXT_COLS)
            .nth(row)
            .map(|r| r.iter().collect::<String>().trim_end().to_string())
            .unwrap_or_default()
    }

    /// The whole grid, row after row, as DRAW data
    pub fn flatten(&self) -> String {
        self.cells.iter().collect()
    }
}

fn redraw(sys: &Syscalls, screen: &TextScreen) -> Result<(), ClientError> {
    sys.draw(TEXT_DISPLAY_FORM, Value::String(screen.flatten()))
}

/// The root process
pub async fn init(sys: Syscalls) {
    if let Err(e) = run_init(&sys).await {
        debug!(pid = %sys.pid(), error = %e, "init stopped");
    }
}

async fn run_init(sys: &Syscalls) -> Result<(), ClientError> {
    let mut screen = TextScreen::new();
    screen.write("Hello, world!\n");
    redraw(sys, &screen)?;
    sys.log("init started")?;

    let child = sys
        .spawn(vec!["/bin/echo".to_string(), GREETING.to_string()])
        .await?;
    sys.listen(child.stdout, CHILD_OUTPUT)?;
    // Whatever the child wrote before the listener was installed
    let early = sys.read(child.stdout, ReadAmount::All).await?;
    if !early.is_empty() {
        screen.write(&early);
        redraw(sys, &screen)?;
    }

    loop {
        let interrupt = sys.next_interrupt().await?;
        if apply(&mut screen, interrupt) {
            redraw(sys, &screen)?;
        }
    }
}

/// Update the screen for one interrupt. Returns whether anything changed.
fn apply(screen: &mut TextScreen, interrupt: Interrupt) -> bool {
    match (interrupt.key, interrupt.data) {
        (Some(key), _) => match key.as_str() {
            "Enter" => {
                screen.put('\n');
                true
            }
            "Backspace" => {
                screen.backspace();
                true
            }
            printable if printable.chars().count() == 1 => {
                screen.write(printable);
                true
            }
            _ => false,
        },
        (None, Some(data)) if interrupt.sig == CHILD_OUTPUT && !data.is_empty() => {
            screen.write(&data);
            true
        }
        _ => false,
    }
}

/// Print the arguments, space separated, followed by a newline
pub async fn echo(sys: Syscalls) {
    let line = sys.args().get(1..).unwrap_or_default().join(" ");
    if let Err(e) = sys.write(Fd::STDOUT, &format!("{}\n", line)) {
        debug!(pid = %sys.pid(), error = %e, "echo failed");
    }
}
