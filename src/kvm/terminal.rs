//! Local terminal handling for interactive guest sessions and passphrase prompts.

use anyhow::{Context, Result, bail};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{self, disable_raw_mode, enable_raw_mode};
use secrecy::SecretString;
use std::io::{self, Write};

/// Terminal size (width x height).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub fn current() -> Result<Self> {
        let (cols, rows) = terminal::size().context("failed to get terminal size")?;
        Ok(Self { cols, rows })
    }

    /// Current size, or 80x24 when stdout is not a terminal.
    pub fn current_or_default() -> Self {
        Self::current().unwrap_or(Self { cols: 80, rows: 24 })
    }
}

/// RAII guard that restores terminal mode on drop.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self> {
        enable_raw_mode().context("failed to enable raw mode")?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Reads a line from the terminal without echoing it.
pub fn read_secret(prompt: &str) -> Result<SecretString> {
    let mut stderr = io::stderr();
    write!(stderr, "{}", prompt)?;
    stderr.flush()?;

    let mut secret = String::new();
    {
        let _raw = RawModeGuard::new()?;
        loop {
            let Event::Key(key) = event::read().context("failed to read from terminal")? else {
                continue;
            };
            if key.kind == KeyEventKind::Release {
                continue;
            }
            match key.code {
                KeyCode::Enter => break,
                KeyCode::Backspace => {
                    secret.pop();
                }
                KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                    drop(_raw);
                    writeln!(stderr)?;
                    bail!("interrupted");
                }
                KeyCode::Char(c) => secret.push(c),
                _ => {}
            }
        }
    }
    writeln!(stderr)?;
    Ok(SecretString::from(secret))
}
