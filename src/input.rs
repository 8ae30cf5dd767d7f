use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

use crate::view::{DisplayToggle, PeerColumn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Key(KeyEvent),
    Paste(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Quit,
    PrevFilter,
    NextFilter,
    CursorUp,
    CursorDown,
    ToggleSession,
    PromptMagnet,
    TogglePause,
    ToggleForceStart,
    Recheck,
    Reannounce,
    Scrape,
    ToggleSequential,
    ClearError,
    PieceDeadlines,
    DeleteJob,
    SaveAll,
    Toggle(DisplayToggle),
    Help,
}

pub fn is_press(key: &KeyEvent) -> bool {
    key.kind == KeyEventKind::Press
}

pub fn is_interrupt(key: &KeyEvent) -> bool {
    key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c')
}

pub fn action_for(key: &KeyEvent) -> Option<Action> {
    if is_interrupt(key) {
        return Some(Action::Quit);
    }
    let action = match key.code {
        KeyCode::Left => Action::PrevFilter,
        KeyCode::Right => Action::NextFilter,
        KeyCode::Up => Action::CursorUp,
        KeyCode::Down => Action::CursorDown,
        KeyCode::Char(c) => match c {
            'q' => Action::Quit,
            ' ' => Action::ToggleSession,
            'm' => Action::PromptMagnet,
            'p' => Action::TogglePause,
            'k' => Action::ToggleForceStart,
            'j' => Action::Recheck,
            'r' => Action::Reannounce,
            'v' => Action::Scrape,
            's' => Action::ToggleSequential,
            'c' => Action::ClearError,
            'o' => Action::PieceDeadlines,
            'D' => Action::DeleteJob,
            'R' => Action::SaveAll,
            'h' => Action::Help,
            't' => Action::Toggle(DisplayToggle::Trackers),
            'i' => Action::Toggle(DisplayToggle::Peers),
            'l' => Action::Toggle(DisplayToggle::Log),
            'd' => Action::Toggle(DisplayToggle::PieceQueue),
            'y' => Action::Toggle(DisplayToggle::Matrix),
            'f' => Action::Toggle(DisplayToggle::Files),
            'P' => Action::Toggle(DisplayToggle::PadFiles),
            'g' => Action::Toggle(DisplayToggle::Lookup),
            '1' => Action::Toggle(DisplayToggle::Column(PeerColumn::Address)),
            '2' => Action::Toggle(DisplayToggle::Column(PeerColumn::Progress)),
            '3' => Action::Toggle(DisplayToggle::Column(PeerColumn::Rates)),
            '4' => Action::Toggle(DisplayToggle::Column(PeerColumn::Flags)),
            '5' => Action::Toggle(DisplayToggle::Column(PeerColumn::Client)),
            _ => return None,
        },
        _ => return None,
    };
    Some(action)
}

pub fn help_lines() -> Vec<&'static str> {
    vec![
        "navigation",
        "  left/right  previous / next job filter",
        "  up/down     move cursor",
        "",
        "session",
        "  space       pause / resume all jobs",
        "  m           add magnet link",
        "  R           save recovery state for all jobs",
        "  q, ctrl+c   quit",
        "",
        "selected job",
        "  p  pause / resume      k  toggle force start",
        "  j  force recheck       r  force reannounce",
        "  v  scrape              s  toggle sequential download",
        "  c  clear error         o  set piece deadlines",
        "  D  delete job and data",
        "",
        "display",
        "  i  peers     t  trackers      l  log",
        "  d  piece queue   y  piece matrix",
        "  f  files     P  pad files     g  lookup diagnostics",
        "  1-5  peer columns: address, progress, rates, flags, client",
        "",
        "press any key to close",
    ]
}
