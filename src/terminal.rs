use std::{
    io::{self, Stdout},
    time::Duration,
};

use anyhow::Result;
use crossterm::{
    event::{self, DisableBracketedPaste, EnableBracketedPaste, Event},
    execute,
    terminal::{self, disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use log::warn;
use ratatui::{backend::CrosstermBackend, text::Line, widgets::Paragraph, Terminal};

use crate::input::{is_press, Input};

type Backend = CrosstermBackend<Stdout>;

pub struct TerminalGuard {
    terminal: Terminal<Backend>,
}

impl TerminalGuard {
    pub fn enter() -> Result<Self> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        if let Err(err) = execute!(stdout, EnterAlternateScreen, EnableBracketedPaste) {
            let _ = disable_raw_mode();
            return Err(err.into());
        }
        let terminal = Terminal::new(CrosstermBackend::new(stdout))?;
        Ok(Self { terminal })
    }

    pub fn size(&self) -> Result<(u16, u16)> {
        Ok(terminal::size()?)
    }

    pub fn draw(&mut self, lines: Vec<Line<'static>>) -> Result<()> {
        self.terminal.draw(|frame| {
            let area = frame.size();
            frame.render_widget(Paragraph::new(lines), area);
        })?;
        Ok(())
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let mut stdout = io::stdout();
        if let Err(err) = disable_raw_mode() {
            warn!("failed to leave raw mode: {err}");
        }
        if let Err(err) = execute!(stdout, DisableBracketedPaste, LeaveAlternateScreen) {
            warn!("failed to leave alternate screen: {err}");
        }
        let _ = self.terminal.show_cursor();
    }
}

/// Waits up to `timeout` for input. Key releases, focus and resize events yield `None`.
pub fn read_input(timeout: Duration) -> Result<Option<Input>> {
    if !event::poll(timeout)? {
        return Ok(None);
    }
    let input = match event::read()? {
        Event::Key(key) if is_press(&key) => Some(Input::Key(key)),
        Event::Paste(text) => Some(Input::Paste(text)),
        _ => None,
    };
    Ok(input)
}
