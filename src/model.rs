use std::{fmt, time::Duration};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(String);

impl JobId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Stopped,
    CheckWait,
    Checking,
    DownloadWait,
    Downloading,
    SeedWait,
    Seeding,
    Unknown(i64),
}

impl JobState {
    pub fn from_rpc(value: i64) -> Self {
        match value {
            0 => JobState::Stopped,
            1 => JobState::CheckWait,
            2 => JobState::Checking,
            3 => JobState::DownloadWait,
            4 => JobState::Downloading,
            5 => JobState::SeedWait,
            6 => JobState::Seeding,
            other => JobState::Unknown(other),
        }
    }

    pub fn label(self) -> String {
        match self {
            JobState::Stopped => "stopped".to_string(),
            JobState::CheckWait => "check-wait".to_string(),
            JobState::Checking => "checking".to_string(),
            JobState::DownloadWait => "queued".to_string(),
            JobState::Downloading => "downloading".to_string(),
            JobState::SeedWait => "seed-wait".to_string(),
            JobState::Seeding => "seeding".to_string(),
            JobState::Unknown(other) => format!("status-{other}"),
        }
    }

    pub fn is_queued(self) -> bool {
        matches!(self, JobState::DownloadWait | JobState::SeedWait)
    }

    pub fn is_checking(self) -> bool {
        matches!(self, JobState::CheckWait | JobState::Checking)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobStatusView {
    pub id: JobId,
    pub name: String,
    pub state: JobState,
    pub progress: f64,
    pub total_wanted: i64,
    pub total_wanted_done: i64,
    pub total_download: i64,
    pub total_upload: i64,
    pub download_rate: i64,
    pub upload_rate: i64,
    pub num_peers: i64,
    pub num_seeds: i64,
    pub queue_position: i64,
    pub eta: Option<i64>,
    pub error: Option<String>,
    pub pieces: Vec<bool>,
    pub sequential: bool,
    pub auto_managed: bool,
    pub paused: bool,
    pub needs_save: bool,
    pub has_metadata: bool,
}

impl JobStatusView {
    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStatsView {
    pub version: String,
    pub download_rate: i64,
    pub upload_rate: i64,
    pub total_download: i64,
    pub total_upload: i64,
    pub active_jobs: i64,
    pub paused_jobs: i64,
    pub total_jobs: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupBucket {
    pub num_nodes: u32,
    pub num_replacements: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupRequest {
    pub kind: String,
    pub target: String,
    pub branch_factor: u32,
    pub outstanding_requests: u32,
    pub nodes_left: u32,
    pub first_timeout: u32,
    pub timeouts: u32,
    pub responses: u32,
    pub last_sent: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerInfoView {
    pub address: String,
    pub client: String,
    pub progress: f64,
    pub download_rate: i64,
    pub upload_rate: i64,
    pub flags: String,
    pub utp: bool,
    pub encrypted: bool,
    pub incoming: bool,
    pub connecting: bool,
    pub handshaking: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileView {
    pub index: usize,
    pub name: String,
    pub size: i64,
    pub downloaded: i64,
    pub priority: i32,
    pub wanted: bool,
    pub pad: bool,
}

impl FileView {
    /// Completion in per-mille; empty files count as complete.
    pub fn progress_per_mille(&self) -> u32 {
        if self.size <= 0 {
            return 1000;
        }
        ((self.downloaded.clamp(0, self.size) as f64 / self.size as f64) * 1000.0) as u32
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.size
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerView {
    pub tier: i64,
    pub url: String,
    pub last_result: String,
    pub succeeded: bool,
    pub announced: bool,
    pub next_announce: Option<i64>,
    pub seeders: i64,
    pub leechers: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockState {
    #[default]
    Open,
    Requested,
    Writing,
    Finished,
}

impl BlockState {
    pub const ALL: [BlockState; 4] = [
        BlockState::Open,
        BlockState::Requested,
        BlockState::Writing,
        BlockState::Finished,
    ];

    pub fn label(self) -> &'static str {
        match self {
            BlockState::Open => "open",
            BlockState::Requested => "requested",
            BlockState::Writing => "writing",
            BlockState::Finished => "finished",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BlockView {
    pub state: BlockState,
    pub progress: f32,
    pub multiple_peers: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PieceQueueView {
    pub piece: u32,
    pub blocks: Vec<BlockView>,
}

#[derive(Debug, Clone, Default)]
pub struct JobDetail {
    pub peers: Vec<PeerInfoView>,
    pub files: Vec<FileView>,
    pub trackers: Vec<TrackerView>,
    pub queue: Vec<PieceQueueView>,
}

/// Fixed-width unit formatter: four digits, a one-letter magnitude, then `suffix`.
pub fn add_suffix(value: i64, suffix: &str) -> String {
    const UNITS: [&str; 5] = ["B", "K", "M", "G", "T"];
    let mut magnitude = value.max(0) as f64;
    let mut unit = 0;
    while magnitude >= 999.5 && unit < UNITS.len() - 1 {
        magnitude /= 1024.0;
        unit += 1;
    }
    format!("{:>4.0}{}{}", magnitude, UNITS[unit], suffix)
}

pub fn format_progress(value: f64) -> String {
    format!("{:5.1}%", value * 100.0)
}

pub fn format_eta(seconds: Option<i64>) -> String {
    match seconds {
        None => "∞".to_string(),
        Some(raw) if raw < 0 => "∞".to_string(),
        Some(raw) => {
            let duration = Duration::from_secs(raw as u64);
            let days = duration.as_secs() / 86_400;
            let hours = (duration.as_secs() % 86_400) / 3_600;
            let minutes = (duration.as_secs() % 3_600) / 60;
            let seconds = duration.as_secs() % 60;
            if days > 0 {
                format!("{}d{}h", days, hours)
            } else if hours > 0 {
                format!("{}h{}m", hours, minutes)
            } else if minutes > 0 {
                format!("{}m", minutes)
            } else {
                format!("{}s", seconds)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_suffix_is_fixed_width() {
        assert_eq!(add_suffix(0, "/s"), "   0B/s");
        assert_eq!(add_suffix(512, "/s"), " 512B/s");
        assert_eq!(add_suffix(2048, "/s"), "   2K/s");
        assert_eq!(add_suffix(5 * 1024 * 1024, ""), "   5M");
        assert_eq!(add_suffix(-7, ""), "   0B");
        for value in [1, 999, 1000, 1023, 1024 * 1000, 900 * (1 << 40)] {
            assert_eq!(add_suffix(value, "/s").chars().count(), 7, "{value}");
        }
    }

    #[test]
    fn eta_formats_largest_units() {
        assert_eq!(format_eta(None), "∞");
        assert_eq!(format_eta(Some(-1)), "∞");
        assert_eq!(format_eta(Some(59)), "59s");
        assert_eq!(format_eta(Some(3_700)), "1h1m");
        assert_eq!(format_eta(Some(90_000)), "1d1h");
    }

    #[test]
    fn job_id_is_lowercased() {
        assert_eq!(JobId::new("ABCDEF").as_str(), "abcdef");
    }

    #[test]
    fn file_progress_handles_empty_files() {
        let file = FileView {
            size: 0,
            ..FileView::default()
        };
        assert_eq!(file.progress_per_mille(), 1000);
        let half = FileView {
            size: 200,
            downloaded: 100,
            ..FileView::default()
        };
        assert_eq!(half.progress_per_mille(), 500);
    }
}
