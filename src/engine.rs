use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crossbeam_channel::Sender;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    ipfilter::IpFilter,
    model::{
        FileView, JobId, JobStatusView, LookupBucket, LookupRequest, PeerInfoView,
        PieceQueueView, SessionStatsView, TrackerView,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOperation {
    Connect,
    Transfer,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    TimedOutNoHandshake,
    Closed,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveFailure {
    NotModified,
    Other(String),
}

/// Notification emitted by the engine. Consumed exactly once by the pump.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Stats(SessionStatsView),
    LookupDiagnostics {
        routing_table: Vec<LookupBucket>,
        active_lookups: Vec<LookupRequest>,
    },
    PeerConnected {
        job: JobId,
        address: String,
    },
    PeerDisconnected {
        job: JobId,
        address: String,
        operation: PeerOperation,
        reason: DisconnectReason,
    },
    MetadataReceived {
        job: JobId,
        name: String,
    },
    JobAdded {
        name: String,
        result: Result<JobId, String>,
    },
    JobFinished {
        job: JobId,
        name: String,
    },
    JobPaused {
        job: JobId,
        name: String,
    },
    RecoverySaved {
        job: JobId,
        blob: Vec<u8>,
    },
    RecoverySaveFailed {
        job: JobId,
        reason: SaveFailure,
    },
    JobList(Vec<JobStatusView>),
    JobRemoved {
        job: JobId,
        name: String,
    },
    TrackerError {
        job: JobId,
        url: String,
        message: String,
    },
    Generic {
        severity: Severity,
        message: String,
    },
}

impl EngineEvent {
    pub fn severity(&self) -> Severity {
        match self {
            EngineEvent::JobAdded { result: Err(_), .. }
            | EngineEvent::RecoverySaveFailed { .. }
            | EngineEvent::TrackerError { .. } => Severity::Error,
            EngineEvent::PeerConnected { .. } | EngineEvent::PeerDisconnected { .. } => {
                Severity::Warning
            }
            EngineEvent::Generic { severity, .. } => *severity,
            _ => Severity::Info,
        }
    }

    pub fn message(&self) -> String {
        match self {
            EngineEvent::Stats(_) => "session stats updated".to_string(),
            EngineEvent::LookupDiagnostics {
                routing_table,
                active_lookups,
            } => format!(
                "lookup diagnostics: {} buckets, {} active lookups",
                routing_table.len(),
                active_lookups.len()
            ),
            EngineEvent::PeerConnected { job, address } => {
                format!("{}: peer connected {address}", short_id(job))
            }
            EngineEvent::PeerDisconnected {
                job,
                address,
                operation,
                reason,
            } => {
                let reason = match reason {
                    DisconnectReason::TimedOutNoHandshake => "timed out waiting for handshake",
                    DisconnectReason::Closed => "connection closed",
                    DisconnectReason::Other(text) => text.as_str(),
                };
                let op = match operation {
                    PeerOperation::Connect => "connect",
                    PeerOperation::Transfer => "transfer",
                    PeerOperation::Other => "other",
                };
                format!(
                    "{}: peer disconnected {address} [{op}] {reason}",
                    short_id(job)
                )
            }
            EngineEvent::MetadataReceived { name, .. } => format!("{name}: metadata received"),
            EngineEvent::JobAdded {
                name,
                result: Ok(_),
            } => format!("{name}: added"),
            EngineEvent::JobAdded {
                name,
                result: Err(err),
            } => format!("failed to add {name}: {err}"),
            EngineEvent::JobFinished { name, .. } => format!("{name}: finished downloading"),
            EngineEvent::JobPaused { name, .. } => format!("{name}: paused"),
            EngineEvent::RecoverySaved { job, blob } => {
                format!("{}: recovery state saved ({} bytes)", short_id(job), blob.len())
            }
            EngineEvent::RecoverySaveFailed { job, reason } => match reason {
                SaveFailure::NotModified => {
                    format!("{}: recovery state not modified", short_id(job))
                }
                SaveFailure::Other(err) => {
                    format!("{}: failed to save recovery state: {err}", short_id(job))
                }
            },
            EngineEvent::JobList(jobs) => format!("job list updated ({} jobs)", jobs.len()),
            EngineEvent::JobRemoved { name, .. } => format!("{name}: removed"),
            EngineEvent::TrackerError { job, url, message } => {
                format!("{}: tracker {url} failed: {message}", short_id(job))
            }
            EngineEvent::Generic { message, .. } => message.clone(),
        }
    }
}

fn short_id(job: &JobId) -> &str {
    let id = job.as_str();
    id.get(..8).unwrap_or(id)
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobSource {
    Magnet(String),
    Metainfo { bytes: Vec<u8>, origin: PathBuf },
    RecoveryState(Vec<u8>),
}

impl JobSource {
    pub fn label(&self) -> String {
        match self {
            JobSource::Magnet(uri) => uri.chars().take(60).collect(),
            JobSource::Metainfo { origin, .. } => origin.display().to_string(),
            JobSource::RecoveryState(_) => "recovery state".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddJobParams {
    pub source: JobSource,
    pub recovery: Option<Vec<u8>>,
    pub save_path: PathBuf,
    pub max_connections: u32,
    pub upload_limit: u32,
    pub download_limit: u32,
    pub needs_save: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobCommand {
    Pause { graceful: bool },
    Resume,
    Recheck,
    Reannounce,
    Scrape,
    SetSequential(bool),
    SetAutoManaged(bool),
    ClearError,
    SaveRecoveryState { only_if_modified: bool },
    Remove { delete_data: bool },
    ConnectPeer(SocketAddr),
    SetPieceDeadlines { pieces: u32 },
    SetMaxConnections(u32),
}

impl JobCommand {
    pub fn name(&self) -> &'static str {
        match self {
            JobCommand::Pause { .. } => "pause",
            JobCommand::Resume => "resume",
            JobCommand::Recheck => "recheck",
            JobCommand::Reannounce => "reannounce",
            JobCommand::Scrape => "scrape",
            JobCommand::SetSequential(_) => "set_sequential",
            JobCommand::SetAutoManaged(_) => "set_auto_managed",
            JobCommand::ClearError => "clear_error",
            JobCommand::SaveRecoveryState { .. } => "save_recovery_state",
            JobCommand::Remove { .. } => "remove",
            JobCommand::ConnectPeer(_) => "connect_peer",
            JobCommand::SetPieceDeadlines { .. } => "set_piece_deadline",
            JobCommand::SetMaxConnections(_) => "set_max_connections",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    AddJob(Box<AddJobParams>),
    PostJobList,
    PostStats,
    PostLookupDiagnostics,
    Job { job: JobId, command: JobCommand },
    PauseSession,
    ResumeSession,
    ApplySettings(Map<String, Value>),
    SetIpFilter(IpFilter),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine command queue is closed")]
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct Commander {
    tx: Sender<EngineCommand>,
}

impl Commander {
    pub fn new(tx: Sender<EngineCommand>) -> Self {
        Self { tx }
    }

    #[cfg(test)]
    pub fn channel() -> (Self, crossbeam_channel::Receiver<EngineCommand>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self::new(tx), rx)
    }

    pub fn submit(&self, command: EngineCommand) -> Result<(), EngineError> {
        self.tx.send(command).map_err(|_| EngineError::Disconnected)
    }

    pub fn job(&self, job: &JobId, command: JobCommand) -> Result<(), EngineError> {
        self.submit(EngineCommand::Job {
            job: job.clone(),
            command,
        })
    }
}

/// The transfer engine as seen by the console.
///
/// Accessors return data that may be one polling interval old.
pub trait Engine {
    fn commander(&self) -> Commander;
    fn pop_events(&self) -> Vec<EngineEvent>;
    fn wait_for_event(&self, timeout: Duration) -> Option<EngineEvent>;
    fn peers(&self, job: &JobId) -> Vec<PeerInfoView>;
    fn files(&self, job: &JobId) -> Vec<FileView>;
    fn trackers(&self, job: &JobId) -> Vec<TrackerView>;
    fn piece_queue(&self, job: &JobId) -> Vec<PieceQueueView>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commander_reports_closed_queue() {
        let (commander, rx) = Commander::channel();
        commander.submit(EngineCommand::PostStats).unwrap();
        assert_eq!(rx.try_recv().unwrap(), EngineCommand::PostStats);
        drop(rx);
        assert!(matches!(
            commander.submit(EngineCommand::PostStats),
            Err(EngineError::Disconnected)
        ));
    }

    #[test]
    fn failures_render_as_errors() {
        let event = EngineEvent::RecoverySaveFailed {
            job: JobId::new("0123456789abcdef"),
            reason: SaveFailure::Other("disk full".to_string()),
        };
        assert_eq!(event.severity(), Severity::Error);
        assert_eq!(
            event.message(),
            "01234567: failed to save recovery state: disk full"
        );
    }
}
