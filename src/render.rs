use ratatui::{
    style::{Color, Modifier, Style},
    text::{Line, Span},
};

use crate::{
    engine::Severity,
    input::help_lines,
    model::{
        add_suffix, format_eta, format_progress, BlockState, JobDetail, JobState, JobStatusView,
        PieceQueueView,
    },
    view::{ConsoleState, JobFilter},
};

pub const MATRIX_MAX_WIDTH: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlay<'a> {
    None,
    Prompt { label: &'a str, buffer: &'a str },
    Confirm(&'a str),
    Help,
}

pub struct RenderInput<'a> {
    pub state: &'a ConsoleState,
    pub detail: &'a JobDetail,
    pub overlay: Overlay<'a>,
    pub tick: u64,
}

struct FrameBuf {
    lines: Vec<Line<'static>>,
    width: usize,
    height: usize,
}

impl FrameBuf {
    fn new(width: usize, height: usize) -> Self {
        Self {
            lines: Vec::with_capacity(height),
            width,
            height,
        }
    }

    fn remaining(&self) -> usize {
        self.height.saturating_sub(self.lines.len())
    }

    fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    fn push(&mut self, line: Line<'static>) -> bool {
        if self.is_full() {
            return false;
        }
        self.lines.push(clip(line, self.width));
        true
    }

    fn text(&mut self, text: impl Into<String>) -> bool {
        let text = fit(&text.into(), self.width);
        self.push(Line::from(text))
    }

    fn styled(&mut self, text: impl Into<String>, style: Style) -> bool {
        let text = fit(&text.into(), self.width);
        self.push(Line::from(Span::styled(text, style)))
    }
}

/// Cuts a styled line to `width` display columns.
fn clip(line: Line<'static>, width: usize) -> Line<'static> {
    if line.width() <= width {
        return line;
    }
    let mut used = 0;
    let mut spans = Vec::with_capacity(line.spans.len());
    for span in line.spans {
        let span_width = span.width();
        if used + span_width <= width {
            used += span_width;
            spans.push(span);
            continue;
        }
        let mut content = String::new();
        for c in span.content.chars() {
            let mut buf = [0; 4];
            let cols = Span::raw(&*c.encode_utf8(&mut buf)).width();
            if used + cols > width {
                break;
            }
            used += cols;
            content.push(c);
        }
        spans.push(Span::styled(content, span.style));
        break;
    }
    Line::from(spans)
}

fn fit(text: &str, width: usize) -> String {
    text.chars().take(width).collect()
}

fn pad(text: &str, width: usize) -> String {
    let mut out = fit(text, width);
    let len = out.chars().count();
    out.extend(std::iter::repeat(' ').take(width - len));
    out
}

pub fn progress_bar(progress: f64, width: usize) -> String {
    let filled = ((progress.clamp(0.0, 1.0) * width as f64).round() as usize).min(width);
    let mut bar = String::with_capacity(width * 3);
    bar.extend(std::iter::repeat('█').take(filled));
    bar.extend(std::iter::repeat('░').take(width - filled));
    bar
}

pub fn render(input: &RenderInput<'_>, width: u16, height: u16) -> Vec<Line<'static>> {
    let width = usize::from(width);
    let height = usize::from(height);
    if input.overlay == Overlay::Help {
        let mut frame = FrameBuf::new(width, height);
        for line in help_lines() {
            if !frame.text(line) {
                break;
            }
        }
        return frame.lines;
    }

    let reserve = usize::from(!matches!(input.overlay, Overlay::None));
    let mut frame = FrameBuf::new(width, height.saturating_sub(reserve));
    let state = input.state;
    job_list(&mut frame, state);
    stats_line(&mut frame, state);
    if state.flags.lookup {
        lookup(&mut frame, state);
    }
    let active = state.jobs.active();
    if let Some(job) = active {
        completion(&mut frame, job);
    }
    if state.flags.peers {
        peers(&mut frame, state, input.detail);
    }
    if state.flags.trackers {
        trackers(&mut frame, input.detail);
    }
    if state.flags.matrix {
        if let Some(job) = active {
            piece_matrix(&mut frame, job);
        }
    }
    if state.flags.piece_queue {
        piece_queue(&mut frame, &input.detail.queue, input.tick);
    }
    if state.flags.files {
        files(&mut frame, state, input.detail);
    }
    if state.flags.log {
        event_log(&mut frame, state);
    }

    let mut lines = frame.lines;
    match input.overlay {
        Overlay::Prompt { label, buffer } if height > 0 => {
            lines.push(clip(
                Line::from(Span::styled(
                    format!("{label}: {buffer}_"),
                    Style::default().add_modifier(Modifier::REVERSED),
                )),
                width,
            ));
        }
        Overlay::Confirm(question) if height > 0 => {
            lines.push(clip(
                Line::from(Span::styled(
                    format!("{question} [y/N]"),
                    Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
                )),
                width,
            ));
        }
        _ => {}
    }
    lines
}

fn job_list(frame: &mut FrameBuf, state: &ConsoleState) {
    let list = &state.jobs;
    let mut tabs = Vec::new();
    for (index, filter) in JobFilter::ALL.iter().enumerate() {
        let style = if index == list.filter() {
            Style::default().add_modifier(Modifier::REVERSED)
        } else {
            Style::default()
        };
        tabs.push(Span::styled(format!(" {} ", filter.label()), style));
        tabs.push(Span::raw(" "));
    }
    if !frame.push(Line::from(tabs)) {
        return;
    }
    let visible = list.visible();
    if visible.is_empty() {
        frame.styled("no jobs", Style::default().add_modifier(Modifier::DIM));
        return;
    }
    let cursor = list.cursor_index();
    let rows = list.rows().max(1);
    for (index, job) in visible.iter().enumerate().skip(list.scroll()).take(rows) {
        let selected = cursor == Some(index);
        let mut style = job_style(job);
        if selected {
            style = style.add_modifier(Modifier::REVERSED);
        }
        if !frame.styled(job_row(job, selected, frame.width), style) {
            return;
        }
    }
}

fn job_style(job: &JobStatusView) -> Style {
    if job.error.is_some() {
        Style::default().fg(Color::Red)
    } else if job.paused {
        Style::default().add_modifier(Modifier::DIM)
    } else if job.state == JobState::Seeding {
        Style::default().fg(Color::Green)
    } else if job.state.is_checking() {
        Style::default().fg(Color::Magenta)
    } else {
        Style::default()
    }
}

fn job_row(job: &JobStatusView, selected: bool, width: usize) -> String {
    const FIXED: usize = 47;
    let marker = if selected { "> " } else { "  " };
    let name = pad(&job.name, width.saturating_sub(FIXED).max(10));
    let mut flags = String::new();
    if job.sequential {
        flags.push('S');
    }
    if !job.auto_managed {
        flags.push('F');
    }
    if job.needs_save {
        flags.push('*');
    }
    let mut row = format!(
        "{marker}{name} {:<11} {} {} {} {:>4}/{:<4}{flags}",
        job.state.label(),
        format_progress(job.progress),
        add_suffix(job.download_rate, "/s"),
        add_suffix(job.upload_rate, "/s"),
        job.num_peers,
        job.num_seeds,
    );
    if let Some(error) = &job.error {
        row.push_str(" error: ");
        row.push_str(error);
    }
    row
}

fn stats_line(frame: &mut FrameBuf, state: &ConsoleState) {
    let stats = &state.stats;
    let line = format!(
        "down {} ({})  up {} ({})  jobs {} active {} paused  saves pending {}  {}",
        add_suffix(stats.download_rate, "/s"),
        add_suffix(stats.total_download, ""),
        add_suffix(stats.upload_rate, "/s"),
        add_suffix(stats.total_upload, ""),
        stats.active_jobs,
        stats.paused_jobs,
        state.recovery.outstanding(),
        stats.version,
    );
    frame.styled(line, Style::default().fg(Color::Cyan));
}

fn lookup(frame: &mut FrameBuf, state: &ConsoleState) {
    let lookup = &state.lookup;
    if lookup.routing_table.is_empty() && lookup.active_lookups.is_empty() {
        frame.styled(
            "lookup: no routing table",
            Style::default().add_modifier(Modifier::DIM),
        );
        return;
    }
    for (index, bucket) in lookup.routing_table.iter().enumerate() {
        let bar = "#".repeat(bucket.num_nodes as usize);
        let replacements = "-".repeat(bucket.num_replacements as usize);
        let line = format!(
            "{index:>3} [{:>3}, {:>3}] {bar}{replacements}",
            bucket.num_nodes, bucket.num_replacements
        );
        if !frame.text(line) {
            return;
        }
    }
    for request in &lookup.active_lookups {
        let target: String = request.target.chars().take(8).collect();
        let line = format!(
            "  {:>10} [limit: {:>2}] target: {target} in-flight: {:>2} left: {:>3} 1st-timeout: {:>2} timeouts: {:>2} responses: {:>2} last_sent: {:>2}",
            request.kind,
            request.branch_factor,
            request.outstanding_requests,
            request.nodes_left,
            request.first_timeout,
            request.timeouts,
            request.responses,
            request.last_sent,
        );
        if !frame.text(line) {
            return;
        }
    }
}

fn completion(frame: &mut FrameBuf, job: &JobStatusView) {
    let label = format!(
        " {} {}/{} eta {}",
        format_progress(job.progress),
        add_suffix(job.total_wanted_done, ""),
        add_suffix(job.total_wanted, ""),
        format_eta(job.eta),
    );
    let bar_width = frame.width.saturating_sub(label.chars().count());
    let style = if job.progress >= 1.0 {
        Style::default().fg(Color::Green)
    } else {
        Style::default().fg(Color::Yellow)
    };
    frame.push(Line::from(vec![
        Span::styled(progress_bar(job.progress, bar_width), style),
        Span::raw(label),
    ]));
}

fn peers(frame: &mut FrameBuf, state: &ConsoleState, detail: &JobDetail) {
    let columns = state.flags.columns;
    let mut header = String::new();
    if columns.address {
        header.push_str(&format!("{:<22} ", "address"));
    }
    if columns.progress {
        header.push_str(&format!("{:>6} ", "have"));
    }
    if columns.rates {
        header.push_str(&format!("{:>7} {:>7} ", "down", "up"));
    }
    if columns.flags {
        header.push_str(&format!("{:<12} ", "flags"));
    }
    if columns.client {
        header.push_str("client");
    }
    if !frame.styled(header, Style::default().add_modifier(Modifier::BOLD)) {
        return;
    }
    for peer in &detail.peers {
        if peer.connecting || peer.handshaking {
            continue;
        }
        let mut row = String::new();
        if columns.address {
            row.push_str(&pad(&peer.address, 22));
            row.push(' ');
        }
        if columns.progress {
            row.push_str(&format_progress(peer.progress));
            row.push(' ');
        }
        if columns.rates {
            row.push_str(&format!(
                "{} {} ",
                add_suffix(peer.download_rate, "/s"),
                add_suffix(peer.upload_rate, "/s")
            ));
        }
        if columns.flags {
            let mut flags = peer.flags.clone();
            if peer.utp {
                flags.push('U');
            }
            if peer.encrypted {
                flags.push('E');
            }
            if peer.incoming {
                flags.push('I');
            }
            row.push_str(&pad(&flags, 12));
            row.push(' ');
        }
        if columns.client {
            row.push_str(&peer.client);
        }
        if !frame.text(row) {
            return;
        }
    }
}

fn trackers(frame: &mut FrameBuf, detail: &JobDetail) {
    let url_width = frame.width.saturating_sub(40).clamp(10, 60);
    for tracker in &detail.trackers {
        let next = match tracker.next_announce {
            Some(seconds) => format_eta(Some(seconds)),
            None => "-".to_string(),
        };
        let style = if tracker.announced && !tracker.succeeded {
            Style::default().fg(Color::Red)
        } else {
            Style::default()
        };
        let row = format!(
            "{:>2} {} {:>6} {:>5}/{:<5} {}",
            tracker.tier,
            pad(&tracker.url, url_width),
            next,
            tracker.seeders,
            tracker.leechers,
            tracker.last_result,
        );
        if !frame.styled(row, style) {
            return;
        }
    }
}

/// Two pieces per cell, stacked vertically.
fn piece_matrix(frame: &mut FrameBuf, job: &JobStatusView) {
    let columns = frame.width.min(MATRIX_MAX_WIDTH);
    if columns == 0 || job.pieces.is_empty() {
        return;
    }
    let have = |index: usize| job.pieces.get(index).copied().unwrap_or(false);
    let pieces = job.num_pieces();
    let rows = pieces.div_ceil(columns * 2);
    let style = Style::default().fg(Color::Cyan).bg(Color::DarkGray);
    for row in 0..rows {
        let top = row * 2 * columns;
        let line: String = (0..columns)
            .take_while(|column| top + column < pieces)
            .map(|column| match (have(top + column), have(top + columns + column)) {
                (true, true) => '█',
                (true, false) => '▀',
                (false, true) => '▄',
                (false, false) => ' ',
            })
            .collect();
        if !frame.push(Line::from(Span::styled(line, style))) {
            return;
        }
    }
}

fn legend() -> String {
    let mut entries = Vec::new();
    for state in BlockState::ALL.iter().rev().copied() {
        entries.push(format!("[{}] {}", block_char(state, false), state.label()));
        if state == BlockState::Requested {
            entries.push(format!("[{}] requested from several peers", block_char(state, true)));
        }
    }
    entries.join("  ")
}

fn block_char(state: BlockState, multiple_peers: bool) -> char {
    match state {
        BlockState::Open => ' ',
        BlockState::Requested if multiple_peers => '=',
        BlockState::Requested => '-',
        BlockState::Writing => '>',
        BlockState::Finished => '#',
    }
}

fn piece_cell(piece: &PieceQueueView) -> String {
    let blocks: String = piece
        .blocks
        .iter()
        .map(|block| block_char(block.state, block.multiple_peers))
        .collect();
    format!("[{blocks}]")
}

/// Packs pieces left to right and wraps. A piece wider than the frame scrolls with `tick`.
fn piece_queue(frame: &mut FrameBuf, queue: &[PieceQueueView], tick: u64) {
    let width = frame.width.max(1);
    let mut current = String::new();
    for piece in queue {
        let cell = piece_cell(piece);
        let len = cell.chars().count();
        if len > width {
            if !current.is_empty() && !frame.text(std::mem::take(&mut current)) {
                return;
            }
            let offset = (tick % len as u64) as usize;
            let window: String = cell.chars().chain(cell.chars()).skip(offset).take(width).collect();
            if !frame.text(window) {
                return;
            }
            continue;
        }
        if current.chars().count() + len > width && !frame.text(std::mem::take(&mut current)) {
            return;
        }
        current.push_str(&cell);
    }
    if !current.is_empty() && !frame.text(current) {
        return;
    }
    if queue.is_empty() {
        frame.styled("no pieces in flight", Style::default().add_modifier(Modifier::DIM));
    }
    frame.styled(legend(), Style::default().add_modifier(Modifier::DIM));
}

fn files(frame: &mut FrameBuf, state: &ConsoleState, detail: &JobDetail) {
    let bar_width = (frame.width / 4).clamp(10, 40).min(frame.width);
    for file in &detail.files {
        if file.pad && !state.flags.pad_files {
            continue;
        }
        let per_mille = file.progress_per_mille();
        let priority = match file.priority {
            p if p > 0 => "high",
            p if p < 0 => "low",
            _ => "",
        };
        let style = if !file.wanted {
            Style::default().add_modifier(Modifier::DIM)
        } else if file.is_complete() {
            Style::default().fg(Color::Green)
        } else {
            Style::default()
        };
        let line = Line::from(vec![
            Span::styled(progress_bar(f64::from(per_mille) / 1000.0, bar_width), style),
            Span::raw(fit(
                &format!(
                    " {:>3}.{}% {} {:<4} {}",
                    per_mille / 10,
                    per_mille % 10,
                    add_suffix(file.size, ""),
                    priority,
                    file.name
                ),
                frame.width.saturating_sub(bar_width),
            )),
        ]);
        if !frame.push(line) {
            return;
        }
    }
}

fn severity_style(severity: Severity) -> Style {
    match severity {
        Severity::Error => Style::default().fg(Color::Red),
        Severity::Warning => Style::default().fg(Color::Yellow),
        Severity::Info => Style::default(),
    }
}

/// Newest entries win when the log does not fit.
fn event_log(frame: &mut FrameBuf, state: &ConsoleState) {
    if state.log.is_empty() {
        return;
    }
    let room = frame.remaining();
    let skip = state.log.len().saturating_sub(room);
    for entry in state.log.iter().skip(skip) {
        if !frame.styled(entry.text(), severity_style(entry.severity)) {
            return;
        }
    }
}
