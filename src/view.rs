use std::{collections::VecDeque, net::SocketAddr, path::PathBuf, sync::OnceLock};

use time::{macros::format_description, OffsetDateTime, UtcOffset};

use crate::{
    engine::Severity,
    model::{JobId, JobStatusView, LookupBucket, LookupRequest, SessionStatsView},
    recovery::RecoveryTracker,
};

pub const LOG_CAPACITY: usize = 20;

static LOCAL_OFFSET: OnceLock<UtcOffset> = OnceLock::new();

/// Reading the local offset is only sound while the process is single-threaded,
/// so it is captured once at startup. Log timestamps fall back to UTC otherwise.
pub fn capture_local_offset() -> UtcOffset {
    *LOCAL_OFFSET.get_or_init(|| UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFilter {
    All,
    Downloading,
    NotPaused,
    Seeding,
    Queued,
    Stopped,
    Checking,
}

impl JobFilter {
    pub const ALL: [JobFilter; 7] = [
        JobFilter::All,
        JobFilter::Downloading,
        JobFilter::NotPaused,
        JobFilter::Seeding,
        JobFilter::Queued,
        JobFilter::Stopped,
        JobFilter::Checking,
    ];

    pub fn label(self) -> &'static str {
        match self {
            JobFilter::All => "all",
            JobFilter::Downloading => "downloading",
            JobFilter::NotPaused => "not-paused",
            JobFilter::Seeding => "seeding",
            JobFilter::Queued => "queued",
            JobFilter::Stopped => "stopped",
            JobFilter::Checking => "checking",
        }
    }

    pub fn matches(self, job: &JobStatusView) -> bool {
        use crate::model::JobState;
        match self {
            JobFilter::All => true,
            JobFilter::Downloading => !job.paused && job.state == JobState::Downloading,
            JobFilter::NotPaused => !job.paused,
            JobFilter::Seeding => !job.paused && job.state == JobState::Seeding,
            JobFilter::Queued => !job.paused && job.state.is_queued(),
            JobFilter::Stopped => job.paused,
            JobFilter::Checking => job.state.is_checking(),
        }
    }
}

#[derive(Debug, Default)]
pub struct TorrentListView {
    jobs: Vec<JobStatusView>,
    filter: usize,
    cursor: Option<JobId>,
    scroll: usize,
    height: u16,
}

impl TorrentListView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, mut snapshot: Vec<JobStatusView>) {
        snapshot.sort_by(|a, b| {
            a.queue_position
                .cmp(&b.queue_position)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.id.cmp(&b.id))
        });
        snapshot.dedup_by(|a, b| a.id == b.id);
        self.jobs = snapshot;
        self.reselect();
    }

    pub fn jobs(&self) -> &[JobStatusView] {
        &self.jobs
    }

    pub fn get(&self, id: &JobId) -> Option<&JobStatusView> {
        self.jobs.iter().find(|job| &job.id == id)
    }

    pub fn visible(&self) -> Vec<&JobStatusView> {
        let filter = self.filter_kind();
        self.jobs.iter().filter(|job| filter.matches(job)).collect()
    }

    pub fn filter(&self) -> usize {
        self.filter
    }

    pub fn filter_kind(&self) -> JobFilter {
        JobFilter::ALL[self.filter]
    }

    pub fn set_filter(&mut self, index: usize) {
        self.filter = index.min(JobFilter::ALL.len() - 1);
        self.scroll = 0;
        self.reselect();
    }

    pub fn prev_filter(&mut self) -> bool {
        if self.filter == 0 {
            return false;
        }
        self.set_filter(self.filter - 1);
        true
    }

    pub fn next_filter(&mut self) -> bool {
        if self.filter + 1 >= JobFilter::ALL.len() {
            return false;
        }
        self.set_filter(self.filter + 1);
        true
    }

    pub fn arrow_up(&mut self) {
        self.move_cursor(-1);
    }

    pub fn arrow_down(&mut self) {
        self.move_cursor(1);
    }

    fn move_cursor(&mut self, delta: isize) {
        let visible = self.visible();
        if visible.is_empty() {
            self.cursor = None;
            return;
        }
        let current = self
            .cursor
            .as_ref()
            .and_then(|id| visible.iter().position(|job| &job.id == id))
            .unwrap_or(0) as isize;
        let max_index = visible.len() as isize - 1;
        let next = (current + delta).clamp(0, max_index) as usize;
        self.cursor = Some(visible[next].id.clone());
        self.ensure_visible();
    }

    /// Sets how many rows the list may occupy; one row is reserved for the filter tabs.
    pub fn set_height(&mut self, height: u16) {
        self.height = height;
        self.ensure_visible();
    }

    pub fn rows(&self) -> usize {
        usize::from(self.height.saturating_sub(1))
    }

    pub fn scroll(&self) -> usize {
        self.scroll
    }

    pub fn cursor_index(&self) -> Option<usize> {
        let id = self.cursor.as_ref()?;
        self.visible().iter().position(|job| &job.id == id)
    }

    pub fn active(&self) -> Option<&JobStatusView> {
        let id = self.cursor.as_ref()?;
        self.get(id)
    }

    pub fn needing_save(&self) -> impl Iterator<Item = &JobStatusView> {
        self.jobs.iter().filter(|job| job.needs_save)
    }

    fn reselect(&mut self) {
        let visible = self.visible();
        let keep = self
            .cursor
            .as_ref()
            .is_some_and(|id| visible.iter().any(|job| &job.id == id));
        if !keep {
            self.cursor = visible.first().map(|job| job.id.clone());
        }
        self.ensure_visible();
    }

    fn ensure_visible(&mut self) {
        let rows = self.rows().max(1);
        let Some(index) = self.cursor_index() else {
            self.scroll = 0;
            return;
        };
        if index < self.scroll {
            self.scroll = index;
        } else if index >= self.scroll + rows {
            self.scroll = index + 1 - rows;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupView {
    pub routing_table: Vec<LookupBucket>,
    pub active_lookups: Vec<LookupRequest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerColumn {
    Address,
    Progress,
    Rates,
    Flags,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerColumns {
    pub address: bool,
    pub progress: bool,
    pub rates: bool,
    pub flags: bool,
    pub client: bool,
}

impl Default for PeerColumns {
    fn default() -> Self {
        Self {
            address: true,
            progress: true,
            rates: true,
            flags: false,
            client: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayToggle {
    Peers,
    Trackers,
    Log,
    PieceQueue,
    Matrix,
    Files,
    PadFiles,
    Lookup,
    Column(PeerColumn),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayFlags {
    pub peers: bool,
    pub trackers: bool,
    pub log: bool,
    pub piece_queue: bool,
    pub matrix: bool,
    pub files: bool,
    pub pad_files: bool,
    pub lookup: bool,
    pub columns: PeerColumns,
}

impl DisplayFlags {
    pub fn toggle(&mut self, toggle: DisplayToggle) {
        let flag = match toggle {
            DisplayToggle::Peers => &mut self.peers,
            DisplayToggle::Trackers => &mut self.trackers,
            DisplayToggle::Log => &mut self.log,
            DisplayToggle::PieceQueue => &mut self.piece_queue,
            DisplayToggle::Matrix => &mut self.matrix,
            DisplayToggle::Files => &mut self.files,
            DisplayToggle::PadFiles => &mut self.pad_files,
            DisplayToggle::Lookup => &mut self.lookup,
            DisplayToggle::Column(PeerColumn::Address) => &mut self.columns.address,
            DisplayToggle::Column(PeerColumn::Progress) => &mut self.columns.progress,
            DisplayToggle::Column(PeerColumn::Rates) => &mut self.columns.rates,
            DisplayToggle::Column(PeerColumn::Flags) => &mut self.columns.flags,
            DisplayToggle::Column(PeerColumn::Client) => &mut self.columns.client,
        };
        *flag = !*flag;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: String,
    pub severity: Severity,
    pub message: String,
}

impl LogEntry {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        let format = format_description!("[month repr:short] [day] [hour]:[minute]:[second]");
        let offset = LOCAL_OFFSET.get().copied().unwrap_or(UtcOffset::UTC);
        let timestamp = OffsetDateTime::now_utc()
            .to_offset(offset)
            .format(format)
            .unwrap_or_default();
        Self {
            timestamp,
            severity,
            message: message.into(),
        }
    }

    pub fn text(&self) -> String {
        format!("[{}] {}", self.timestamp, self.message)
    }
}

#[derive(Debug, Clone)]
pub struct LogRing {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl Default for LogRing {
    fn default() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }
}

impl LogRing {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &LogEntry> + ExactSizeIterator {
        self.entries.iter()
    }
}

#[derive(Debug)]
pub struct ConsoleState {
    pub jobs: TorrentListView,
    pub stats: SessionStatsView,
    pub lookup: LookupView,
    pub flags: DisplayFlags,
    pub log: LogRing,
    pub recovery: RecoveryTracker,
    pub save_path: PathBuf,
    pub max_connections: u32,
    pub peer: Option<SocketAddr>,
}

impl ConsoleState {
    pub fn new(save_path: PathBuf, max_connections: u32) -> Self {
        Self {
            jobs: TorrentListView::new(),
            stats: SessionStatsView::default(),
            lookup: LookupView::default(),
            flags: DisplayFlags::default(),
            log: LogRing::default(),
            recovery: RecoveryTracker::default(),
            save_path,
            max_connections,
            peer: None,
        }
    }

    pub fn push_log(&mut self, severity: Severity, message: impl Into<String>) {
        let entry = LogEntry::new(severity, message);
        log::info!("{}", entry.message);
        self.log.push(entry);
    }
}
