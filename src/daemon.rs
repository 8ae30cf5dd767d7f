use std::{
    collections::{hash_map::DefaultHasher, HashMap, HashSet},
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use time::OffsetDateTime;

use crate::{
    engine::{
        AddJobParams, Commander, DisconnectReason, Engine, EngineCommand, EngineEvent, JobCommand,
        JobSource, PeerOperation, SaveFailure, Severity,
    },
    ipfilter::IpFilter,
    model::{FileView, JobId, JobState, PeerInfoView, PieceQueueView, TrackerView},
    rpc::{RpcResult, TorrentWire, TransmissionClient},
};

const RECOVERY_VERSION: u32 = 1;
const IDLE_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub poll_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

type DetailCache = Arc<Mutex<HashMap<JobId, TorrentWire>>>;

/// Engine backed by a Transmission daemon. A worker thread owns the RPC client.
pub struct TransmissionEngine {
    commander: Commander,
    events: Receiver<EngineEvent>,
    details: DetailCache,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl TransmissionEngine {
    pub fn start(client: TransmissionClient, options: EngineOptions) -> Result<Self> {
        info!("using Transmission RPC at {}", client.endpoint());
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let details: DetailCache = Arc::default();
        let stop = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            client,
            commands: command_rx,
            events: event_tx,
            details: Arc::clone(&details),
            stop: Arc::clone(&stop),
            poll_interval: options.poll_interval,
            memo: HashMap::new(),
            saved: HashMap::new(),
            forced: HashSet::new(),
            origins: HashMap::new(),
            clean_on_sight: HashSet::new(),
            primed: false,
            last_error: None,
        };
        let handle = thread::Builder::new()
            .name("transmission-engine".to_string())
            .spawn(move || worker.run())
            .context("failed to spawn engine worker")?;
        Ok(Self {
            commander: Commander::new(command_tx),
            events: event_rx,
            details,
            stop,
            worker: Some(handle),
        })
    }

    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("engine worker panicked");
            }
        }
    }

    fn with_wire<T: Default>(&self, job: &JobId, f: impl FnOnce(&TorrentWire) -> T) -> T {
        match self.details.lock() {
            Ok(cache) => cache.get(job).map(f).unwrap_or_default(),
            Err(_) => T::default(),
        }
    }
}

impl Drop for TransmissionEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Engine for TransmissionEngine {
    fn commander(&self) -> Commander {
        self.commander.clone()
    }

    fn pop_events(&self) -> Vec<EngineEvent> {
        self.events.try_iter().collect()
    }

    fn wait_for_event(&self, timeout: Duration) -> Option<EngineEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    fn peers(&self, job: &JobId) -> Vec<PeerInfoView> {
        self.with_wire(job, TorrentWire::peer_views)
    }

    fn files(&self, job: &JobId) -> Vec<FileView> {
        self.with_wire(job, TorrentWire::file_views)
    }

    fn trackers(&self, job: &JobId) -> Vec<TrackerView> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.with_wire(job, |wire| wire.tracker_views(now))
    }

    fn piece_queue(&self, _job: &JobId) -> Vec<PieceQueueView> {
        // The daemon does not expose in-flight block requests.
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct JobMemo {
    name: String,
    state: JobState,
    percent_done: f64,
    has_metadata: bool,
    /// Peer endpoint to whether data was flowing at the last snapshot.
    peers: HashMap<String, bool>,
    trackers: HashMap<String, (bool, String)>,
}

impl JobMemo {
    fn from_wire(wire: &TorrentWire) -> Self {
        Self {
            name: wire.name.clone(),
            state: wire.state(),
            percent_done: wire.percent_done,
            has_metadata: wire.has_metadata(),
            peers: wire
                .peers
                .iter()
                .map(|peer| (peer.endpoint(), peer.rate_to_client > 0 || peer.rate_to_peer > 0))
                .collect(),
            trackers: wire
                .tracker_stats
                .iter()
                .map(|tracker| {
                    (
                        tracker.announce.clone(),
                        (
                            tracker.last_announce_succeeded,
                            tracker.last_announce_result.clone(),
                        ),
                    )
                })
                .collect(),
        }
    }
}

pub(crate) fn diff_jobs(before: &HashMap<JobId, JobMemo>, wires: &[TorrentWire]) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    let mut seen = HashSet::new();
    for wire in wires {
        let job = wire.job_id();
        seen.insert(job.clone());
        let Some(prev) = before.get(&job) else {
            continue;
        };
        let now = JobMemo::from_wire(wire);
        if !prev.has_metadata && now.has_metadata {
            events.push(EngineEvent::MetadataReceived {
                job: job.clone(),
                name: now.name.clone(),
            });
        }
        if now.has_metadata && prev.percent_done < 1.0 && now.percent_done >= 1.0 {
            events.push(EngineEvent::JobFinished {
                job: job.clone(),
                name: now.name.clone(),
            });
        }
        if prev.state != JobState::Stopped && now.state == JobState::Stopped {
            events.push(EngineEvent::JobPaused {
                job: job.clone(),
                name: now.name.clone(),
            });
        }
        let mut connected: Vec<_> = now
            .peers
            .keys()
            .filter(|address| !prev.peers.contains_key(*address))
            .collect();
        connected.sort();
        for address in connected {
            events.push(EngineEvent::PeerConnected {
                job: job.clone(),
                address: address.clone(),
            });
        }
        let mut gone: Vec<_> = prev
            .peers
            .iter()
            .filter(|(address, _)| !now.peers.contains_key(*address))
            .collect();
        gone.sort();
        for (address, transferring) in gone {
            let operation = if *transferring {
                PeerOperation::Transfer
            } else {
                PeerOperation::Other
            };
            let reason = if now.state == JobState::Stopped {
                DisconnectReason::Other("job stopped".to_string())
            } else {
                DisconnectReason::Closed
            };
            events.push(EngineEvent::PeerDisconnected {
                job: job.clone(),
                address: address.clone(),
                operation,
                reason,
            });
        }
        for tracker in &wire.tracker_stats {
            if !tracker.has_announced || tracker.last_announce_succeeded {
                continue;
            }
            let current = (false, tracker.last_announce_result.clone());
            if prev.trackers.get(&tracker.announce) != Some(&current) {
                events.push(EngineEvent::TrackerError {
                    job: job.clone(),
                    url: tracker.announce.clone(),
                    message: tracker.last_announce_result.clone(),
                });
            }
        }
    }
    let mut removed: Vec<_> = before.iter().filter(|(job, _)| !seen.contains(*job)).collect();
    removed.sort_by(|a, b| a.0.cmp(b.0));
    for (job, memo) in removed {
        events.push(EngineEvent::JobRemoved {
            job: job.clone(),
            name: memo.name.clone(),
        });
    }
    events
}

/// Hash of everything a recovery blob captures. Equal fingerprints mean nothing to save.
pub(crate) fn fingerprint(wire: &TorrentWire) -> u64 {
    let mut hasher = DefaultHasher::new();
    wire.hash_string.to_ascii_lowercase().hash(&mut hasher);
    (wire.state() == JobState::Stopped).hash(&mut hasher);
    wire.download_dir.hash(&mut hasher);
    wire.sequential_download.hash(&mut hasher);
    wire.has_metadata().hash(&mut hasher);
    wire.pieces.hash(&mut hasher);
    for stat in &wire.file_stats {
        stat.wanted.hash(&mut hasher);
        stat.priority.hash(&mut hasher);
    }
    (wire.upload_limited, wire.upload_limit).hash(&mut hasher);
    (wire.download_limited, wire.download_limit).hash(&mut hasher);
    wire.peer_limit.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryBlob {
    pub version: u32,
    pub info_hash: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metainfo: Option<String>,
    #[serde(default)]
    pub download_dir: String,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub sequential: bool,
    #[serde(default)]
    pub unwanted: Vec<usize>,
    #[serde(default)]
    pub priority_high: Vec<usize>,
    #[serde(default)]
    pub priority_low: Vec<usize>,
    #[serde(default)]
    pub upload_limit: Option<i64>,
    #[serde(default)]
    pub download_limit: Option<i64>,
    #[serde(default)]
    pub peer_limit: Option<i64>,
}

impl RecoveryBlob {
    pub(crate) fn from_wire(wire: &TorrentWire, metainfo: Option<&str>) -> Self {
        let mut blob = RecoveryBlob {
            version: RECOVERY_VERSION,
            info_hash: wire.hash_string.to_ascii_lowercase(),
            name: wire.name.clone(),
            magnet: None,
            metainfo: metainfo.map(str::to_string),
            download_dir: wire.download_dir.clone(),
            paused: wire.state() == JobState::Stopped,
            sequential: wire.sequential_download,
            upload_limit: wire.upload_limited.then_some(wire.upload_limit),
            download_limit: wire.download_limited.then_some(wire.download_limit),
            peer_limit: (wire.peer_limit > 0).then_some(wire.peer_limit),
            ..RecoveryBlob::default()
        };
        if blob.metainfo.is_none() && !wire.magnet_link.is_empty() {
            blob.magnet = Some(wire.magnet_link.clone());
        }
        for (index, stat) in wire.file_stats.iter().enumerate() {
            if !stat.wanted {
                blob.unwanted.push(index);
            }
            match stat.priority {
                p if p > 0 => blob.priority_high.push(index),
                p if p < 0 => blob.priority_low.push(index),
                _ => {}
            }
        }
        blob
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

pub(crate) fn add_arguments(
    params: &AddJobParams,
) -> std::result::Result<(Map<String, Value>, Option<String>, Option<RecoveryBlob>), String> {
    let blob = match &params.recovery {
        Some(bytes) => Some(
            RecoveryBlob::decode(bytes).map_err(|err| format!("malformed recovery state: {err}"))?,
        ),
        None => None,
    };
    let mut args = Map::new();
    let mut metainfo = None;
    match &params.source {
        JobSource::Magnet(uri) => {
            args.insert("filename".to_string(), json!(uri));
        }
        JobSource::Metainfo { bytes, .. } => {
            let encoded = STANDARD.encode(bytes);
            args.insert("metainfo".to_string(), json!(encoded));
            metainfo = Some(encoded);
        }
        JobSource::RecoveryState(bytes) => {
            let state = match &blob {
                Some(blob) => blob.clone(),
                None => RecoveryBlob::decode(bytes)
                    .map_err(|err| format!("malformed recovery state: {err}"))?,
            };
            if let Some(encoded) = state.metainfo {
                args.insert("metainfo".to_string(), json!(encoded));
                metainfo = Some(encoded);
            } else if let Some(uri) = state.magnet {
                args.insert("filename".to_string(), json!(uri));
            } else {
                return Err("recovery state has neither metainfo nor magnet link".to_string());
            }
        }
    }
    let download_dir = blob
        .as_ref()
        .map(|blob| blob.download_dir.clone())
        .filter(|dir| !dir.is_empty())
        .unwrap_or_else(|| params.save_path.display().to_string());
    args.insert("download-dir".to_string(), json!(download_dir));
    if params.max_connections > 0 {
        args.insert("peer-limit".to_string(), json!(params.max_connections));
    }
    if let Some(blob) = &blob {
        args.insert("paused".to_string(), json!(blob.paused));
        if !blob.unwanted.is_empty() {
            args.insert("files-unwanted".to_string(), json!(blob.unwanted));
        }
        if !blob.priority_high.is_empty() {
            args.insert("priority-high".to_string(), json!(blob.priority_high));
        }
        if !blob.priority_low.is_empty() {
            args.insert("priority-low".to_string(), json!(blob.priority_low));
        }
    }
    Ok((args, metainfo, blob))
}

pub(crate) fn post_add_fields(params: &AddJobParams, blob: Option<&RecoveryBlob>) -> Map<String, Value> {
    let mut fields = Map::new();
    let upload = blob
        .and_then(|blob| blob.upload_limit)
        .unwrap_or(i64::from(params.upload_limit));
    let download = blob
        .and_then(|blob| blob.download_limit)
        .unwrap_or(i64::from(params.download_limit));
    if upload > 0 {
        fields.insert("uploadLimit".to_string(), json!(upload));
        fields.insert("uploadLimited".to_string(), json!(true));
    }
    if download > 0 {
        fields.insert("downloadLimit".to_string(), json!(download));
        fields.insert("downloadLimited".to_string(), json!(true));
    }
    if blob.is_some_and(|blob| blob.sequential) {
        fields.insert("sequential_download".to_string(), json!(true));
    }
    fields
}

#[derive(Debug, Default, PartialEq)]
struct Batch {
    commands: Vec<EngineCommand>,
    job_list: bool,
    stats: bool,
    lookup: bool,
}

// Forced jobs bypass the daemon's queue.
fn start_method(forced: bool) -> &'static str {
    if forced {
        "torrent-start-now"
    } else {
        "torrent-start"
    }
}

/// Everything already queued runs in one pass. Snapshots go last and at most once each,
/// so a slow daemon delays them instead of the commands behind them.
fn coalesce(first: EngineCommand, rest: impl Iterator<Item = EngineCommand>) -> Batch {
    let mut batch = Batch::default();
    for command in std::iter::once(first).chain(rest) {
        match command {
            EngineCommand::PostJobList => batch.job_list = true,
            EngineCommand::PostStats => batch.stats = true,
            EngineCommand::PostLookupDiagnostics => batch.lookup = true,
            command => batch.commands.push(command),
        }
    }
    batch
}

struct Worker {
    client: TransmissionClient,
    commands: Receiver<EngineCommand>,
    events: Sender<EngineEvent>,
    details: DetailCache,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
    memo: HashMap<JobId, JobMemo>,
    saved: HashMap<JobId, u64>,
    forced: HashSet<JobId>,
    origins: HashMap<JobId, String>,
    clean_on_sight: HashSet<JobId>,
    primed: bool,
    last_error: Option<String>,
}

impl Worker {
    fn run(mut self) {
        let mut next_refresh = Some(Instant::now());
        while !self.stop.load(Ordering::Relaxed) {
            let wait = next_refresh
                .map_or(IDLE_WAIT, |at| at.saturating_duration_since(Instant::now()))
                .min(IDLE_WAIT);
            match self.commands.recv_timeout(wait) {
                Ok(first) => {
                    let batch = coalesce(first, self.commands.try_iter());
                    for command in batch.commands {
                        self.execute(command);
                    }
                    if batch.job_list {
                        self.post_job_list();
                        next_refresh = Instant::now().checked_add(self.poll_interval);
                    }
                    if batch.stats {
                        self.execute(EngineCommand::PostStats);
                    }
                    if batch.lookup {
                        self.execute(EngineCommand::PostLookupDiagnostics);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if next_refresh.map_or(false, |at| Instant::now() >= at) {
                let _ = self.refresh();
                next_refresh = Instant::now().checked_add(self.poll_interval);
            }
        }
        debug!("engine worker stopped");
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn emit_generic(&self, severity: Severity, message: impl Into<String>) {
        self.emit(EngineEvent::Generic {
            severity,
            message: message.into(),
        });
    }

    fn report_failure(&mut self, what: &str, err: impl std::fmt::Display) {
        let message = format!("{what}: {err}");
        if self.last_error.as_deref() != Some(message.as_str()) {
            warn!("{message}");
            self.emit_generic(Severity::Error, message.clone());
            self.last_error = Some(message);
        }
    }

    fn post_job_list(&mut self) {
        if let Some(wires) = self.refresh() {
            let views = wires
                .iter()
                .map(|wire| {
                    let job = wire.job_id();
                    let needs_save = self.saved.get(&job) != Some(&fingerprint(wire));
                    wire.status_view(needs_save, !self.forced.contains(&job))
                })
                .collect();
            self.emit(EngineEvent::JobList(views));
        }
    }

    fn refresh(&mut self) -> Option<Vec<TorrentWire>> {
        let wires = match self.client.fetch_jobs(None) {
            Ok(wires) => wires,
            Err(err) => {
                self.report_failure("failed to fetch jobs", err);
                return None;
            }
        };
        self.last_error = None;
        if self.primed {
            for event in diff_jobs(&self.memo, &wires) {
                if let EngineEvent::JobRemoved { job, .. } = &event {
                    self.forget(job);
                }
                self.emit(event);
            }
        }
        self.primed = true;
        self.memo = wires
            .iter()
            .map(|wire| (wire.job_id(), JobMemo::from_wire(wire)))
            .collect();
        for wire in &wires {
            let job = wire.job_id();
            if self.clean_on_sight.remove(&job) {
                self.saved.insert(job, fingerprint(wire));
            }
        }
        if let Ok(mut cache) = self.details.lock() {
            *cache = wires
                .iter()
                .map(|wire| (wire.job_id(), wire.clone()))
                .collect();
        }
        Some(wires)
    }

    fn forget(&mut self, job: &JobId) {
        self.saved.remove(job);
        self.forced.remove(job);
        self.origins.remove(job);
        self.clean_on_sight.remove(job);
    }

    fn execute(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::AddJob(params) => self.add_job(*params),
            EngineCommand::PostJobList => self.post_job_list(),
            EngineCommand::PostStats => match self.client.fetch_stats() {
                Ok(stats) => self.emit(EngineEvent::Stats(stats)),
                Err(err) => self.report_failure("failed to fetch session stats", err),
            },
            EngineCommand::PostLookupDiagnostics => self.emit(EngineEvent::LookupDiagnostics {
                routing_table: Vec::new(),
                active_lookups: Vec::new(),
            }),
            EngineCommand::Job { job, command } => self.job_command(job, command),
            EngineCommand::PauseSession => {
                if let Err(err) = self.client.torrent_action("torrent-stop", None) {
                    self.report_failure("failed to pause session", err);
                }
            }
            EngineCommand::ResumeSession => {
                if let Err(err) = self.client.torrent_action("torrent-start", None) {
                    self.report_failure("failed to resume session", err);
                }
            }
            EngineCommand::ApplySettings(settings) => {
                let count = settings.len();
                match self.client.session_set(settings) {
                    Ok(()) => self.emit_generic(Severity::Info, format!("applied {count} settings")),
                    Err(err) => self.report_failure("failed to apply settings", err),
                }
            }
            EngineCommand::SetIpFilter(filter) => self.set_ip_filter(&filter),
        }
    }

    fn set_ip_filter(&mut self, filter: &IpFilter) {
        let mut fields = Map::new();
        fields.insert("blocklist_enabled".to_string(), json!(!filter.is_empty()));
        match self.client.session_set(fields) {
            Ok(()) => self.emit_generic(
                Severity::Info,
                format!(
                    "ip filter: {} ranges ({} blocked); the daemon enforces its own blocklist",
                    filter.rules().len(),
                    filter.blocked_ranges()
                ),
            ),
            Err(err) => self.report_failure("failed to enable ip filter", err),
        }
    }

    fn add_job(&mut self, params: AddJobParams) {
        let label = params.source.label();
        let (args, metainfo, blob) = match add_arguments(&params) {
            Ok(parts) => parts,
            Err(err) => {
                self.emit(EngineEvent::JobAdded {
                    name: label,
                    result: Err(err),
                });
                return;
            }
        };
        let outcome = match self.client.add_torrent(args) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.emit(EngineEvent::JobAdded {
                    name: label,
                    result: Err(err.to_string()),
                });
                return;
            }
        };
        let name = outcome.name.clone().unwrap_or(label);
        let Some(job) = outcome.job else {
            self.emit(EngineEvent::JobAdded {
                name,
                result: Err("daemon did not report the added job".to_string()),
            });
            return;
        };
        if outcome.duplicate {
            debug!("{name} was already known to the daemon");
        }
        if let Some(encoded) = metainfo {
            self.origins.insert(job.clone(), encoded);
        }
        if !params.needs_save {
            self.clean_on_sight.insert(job.clone());
        }
        let fields = post_add_fields(&params, blob.as_ref());
        if let Err(err) = self.client.torrent_set(std::slice::from_ref(&job), fields) {
            self.emit_generic(Severity::Warning, format!("{name}: failed to apply limits: {err}"));
        }
        self.emit(EngineEvent::JobAdded {
            name,
            result: Ok(job),
        });
    }

    fn job_command(&mut self, job: JobId, command: JobCommand) {
        let name = command.name();
        let ids = std::slice::from_ref(&job);
        let result: RpcResult<()> = match command {
            JobCommand::Pause { .. } => self.client.torrent_action("torrent-stop", Some(ids)),
            JobCommand::Resume => {
                let method = start_method(self.forced.contains(&job));
                self.client.torrent_action(method, Some(ids))
            }
            JobCommand::Recheck => self.client.torrent_action("torrent-verify", Some(ids)),
            JobCommand::Reannounce | JobCommand::Scrape => {
                self.client.torrent_action("torrent-reannounce", Some(ids))
            }
            JobCommand::SetSequential(on) => {
                let mut fields = Map::new();
                fields.insert("sequential_download".to_string(), json!(on));
                self.client.torrent_set(ids, fields)
            }
            JobCommand::SetMaxConnections(limit) => {
                let mut fields = Map::new();
                fields.insert("peer-limit".to_string(), json!(limit));
                self.client.torrent_set(ids, fields)
            }
            JobCommand::SetAutoManaged(true) => {
                self.forced.remove(&job);
                self.client.torrent_action("torrent-start", Some(ids))
            }
            JobCommand::SetAutoManaged(false) => {
                self.forced.insert(job.clone());
                let running = self
                    .memo
                    .get(&job)
                    .is_some_and(|memo| memo.state != JobState::Stopped);
                if running {
                    self.client.torrent_action(start_method(true), Some(ids))
                } else {
                    Ok(())
                }
            }
            JobCommand::ClearError => {
                let running = self
                    .memo
                    .get(&job)
                    .is_some_and(|memo| memo.state != JobState::Stopped);
                if running {
                    self.client
                        .torrent_action("torrent-stop", Some(ids))
                        .and_then(|()| self.client.torrent_action("torrent-start", Some(ids)))
                } else {
                    Ok(())
                }
            }
            JobCommand::SaveRecoveryState { only_if_modified } => {
                self.save_recovery(job, only_if_modified);
                return;
            }
            JobCommand::Remove { delete_data } => {
                let result = self.client.remove_torrents(ids, delete_data);
                if result.is_ok() {
                    self.forget(&job);
                }
                result
            }
            JobCommand::ConnectPeer(_) | JobCommand::SetPieceDeadlines { .. } => {
                self.emit_generic(
                    Severity::Warning,
                    format!("{name} is not supported by the transmission daemon"),
                );
                return;
            }
        };
        if let Err(err) = result {
            self.emit_generic(Severity::Error, format!("{name} failed for {job}: {err}"));
        }
    }

    fn save_recovery(&mut self, job: JobId, only_if_modified: bool) {
        let reason = match self.client.fetch_jobs(Some(std::slice::from_ref(&job))) {
            Ok(wires) => match wires.into_iter().find(|wire| wire.job_id() == job) {
                Some(wire) => {
                    let print = fingerprint(&wire);
                    if only_if_modified && self.saved.get(&job) == Some(&print) {
                        SaveFailure::NotModified
                    } else {
                        let blob = RecoveryBlob::from_wire(&wire, self.origins.get(&job).map(String::as_str));
                        match blob.encode() {
                            Ok(bytes) => {
                                self.saved.insert(job.clone(), print);
                                self.emit(EngineEvent::RecoverySaved { job, blob: bytes });
                                return;
                            }
                            Err(err) => SaveFailure::Other(err.to_string()),
                        }
                    }
                }
                None => SaveFailure::Other("job is not known to the daemon".to_string()),
            },
            Err(err) => SaveFailure::Other(err.to_string()),
        };
        self.emit(EngineEvent::RecoverySaveFailed { job, reason });
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn wire(value: Value) -> TorrentWire {
        serde_json::from_value(value).unwrap()
    }

    fn memo_of(wires: &[TorrentWire]) -> HashMap<JobId, JobMemo> {
        wires
            .iter()
            .map(|wire| (wire.job_id(), JobMemo::from_wire(wire)))
            .collect()
    }

    fn params(source: JobSource) -> AddJobParams {
        AddJobParams {
            source,
            recovery: None,
            save_path: PathBuf::from("/srv/data"),
            max_connections: 50,
            upload_limit: 0,
            download_limit: 0,
            needs_save: true,
        }
    }

    #[test]
    fn backlog_of_snapshot_requests_collapses_behind_commands() {
        let save = EngineCommand::Job {
            job: JobId::new("aa"),
            command: JobCommand::SaveRecoveryState {
                only_if_modified: false,
            },
        };
        let mut queued = Vec::new();
        for _ in 0..10 {
            queued.push(EngineCommand::PostJobList);
            queued.push(EngineCommand::PostStats);
            queued.push(EngineCommand::PostLookupDiagnostics);
        }
        queued.push(save.clone());
        let batch = coalesce(EngineCommand::PostJobList, queued.into_iter());
        assert_eq!(
            batch,
            Batch {
                commands: vec![save],
                job_list: true,
                stats: true,
                lookup: true,
            }
        );

        let lone = coalesce(EngineCommand::PauseSession, std::iter::empty());
        assert_eq!(lone.commands, vec![EngineCommand::PauseSession]);
        assert!(!lone.job_list && !lone.stats && !lone.lookup);
    }

    #[test]
    fn forced_jobs_start_past_the_queue() {
        assert_eq!(start_method(true), "torrent-start-now");
        assert_eq!(start_method(false), "torrent-start");
    }

    #[test]
    fn diff_reports_transitions() {
        let before = [wire(json!({
            "hashString": "AA", "name": "a", "status": 4,
            "percentDone": 0.9, "metadataPercentComplete": 0.0,
            "peers": [{"address": "10.0.0.1", "port": 1}]
        }))];
        let after = [wire(json!({
            "hashString": "AA", "name": "a", "status": 0,
            "percentDone": 1.0, "metadataPercentComplete": 1.0,
            "peers": [{"address": "10.0.0.2", "port": 2}],
            "trackerStats": [{"announce": "udp://t", "hasAnnounced": true,
                              "lastAnnounceSucceeded": false, "lastAnnounceResult": "timed out"}]
        }))];
        let events = diff_jobs(&memo_of(&before), &after);
        let job = JobId::new("aa");
        assert_eq!(
            events,
            vec![
                EngineEvent::MetadataReceived { job: job.clone(), name: "a".into() },
                EngineEvent::JobFinished { job: job.clone(), name: "a".into() },
                EngineEvent::JobPaused { job: job.clone(), name: "a".into() },
                EngineEvent::PeerConnected { job: job.clone(), address: "10.0.0.2:2".into() },
                EngineEvent::PeerDisconnected {
                    job: job.clone(),
                    address: "10.0.0.1:1".into(),
                    operation: PeerOperation::Other,
                    reason: DisconnectReason::Other("job stopped".into()),
                },
                EngineEvent::TrackerError {
                    job,
                    url: "udp://t".into(),
                    message: "timed out".into(),
                },
            ]
        );
        assert!(diff_jobs(&memo_of(&after), &after).is_empty());
    }

    #[test]
    fn vanished_peer_reports_what_it_was_doing() {
        let before = [wire(json!({
            "hashString": "AA", "name": "a", "status": 4, "metadataPercentComplete": 1.0,
            "peers": [
                {"address": "10.0.0.1", "port": 1, "rateToClient": 512},
                {"address": "10.0.0.2", "port": 2}
            ]
        }))];
        let after = [wire(json!({
            "hashString": "AA", "name": "a", "status": 4, "metadataPercentComplete": 1.0
        }))];
        let job = JobId::new("aa");
        assert_eq!(
            diff_jobs(&memo_of(&before), &after),
            vec![
                EngineEvent::PeerDisconnected {
                    job: job.clone(),
                    address: "10.0.0.1:1".into(),
                    operation: PeerOperation::Transfer,
                    reason: DisconnectReason::Closed,
                },
                EngineEvent::PeerDisconnected {
                    job,
                    address: "10.0.0.2:2".into(),
                    operation: PeerOperation::Other,
                    reason: DisconnectReason::Closed,
                },
            ]
        );
    }

    #[test]
    fn diff_reports_vanished_jobs() {
        let before = [
            wire(json!({"hashString": "AA", "name": "a"})),
            wire(json!({"hashString": "BB", "name": "b"})),
        ];
        let events = diff_jobs(&memo_of(&before), &before[..1]);
        assert_eq!(
            events,
            vec![EngineEvent::JobRemoved { job: JobId::new("bb"), name: "b".into() }]
        );
    }

    #[test]
    fn fingerprint_tracks_saved_fields() {
        let base = wire(json!({"hashString": "AA", "status": 4, "pieces": "AA=="}));
        let same = wire(json!({"hashString": "AA", "status": 4, "pieces": "AA==", "rateDownload": 99}));
        let paused = wire(json!({"hashString": "AA", "status": 0, "pieces": "AA=="}));
        assert_eq!(fingerprint(&base), fingerprint(&same));
        assert_ne!(fingerprint(&base), fingerprint(&paused));
    }

    #[test]
    fn recovery_blob_captures_selection() {
        let source = wire(json!({
            "hashString": "AA", "name": "a", "status": 0, "downloadDir": "/srv",
            "magnetLink": "magnet:?xt=urn:btih:aa", "sequential_download": true,
            "uploadLimited": true, "uploadLimit": 20,
            "fileStats": [{"wanted": false, "priority": 0}, {"wanted": true, "priority": 1}]
        }));
        let blob = RecoveryBlob::from_wire(&source, None);
        assert!(blob.paused);
        assert!(blob.sequential);
        assert_eq!(blob.magnet.as_deref(), Some("magnet:?xt=urn:btih:aa"));
        assert_eq!(blob.unwanted, vec![0]);
        assert_eq!(blob.priority_high, vec![1]);
        assert_eq!(blob.upload_limit, Some(20));
        assert_eq!(blob.download_limit, None);

        let with_metainfo = RecoveryBlob::from_wire(&source, Some("ZGU="));
        assert_eq!(with_metainfo.magnet, None);
        let decoded = RecoveryBlob::decode(&with_metainfo.encode().unwrap()).unwrap();
        assert_eq!(decoded, with_metainfo);
    }

    #[test]
    fn add_arguments_replay_recovery_state() {
        let blob = RecoveryBlob {
            version: RECOVERY_VERSION,
            metainfo: Some("ZGU=".into()),
            download_dir: "/elsewhere".into(),
            paused: true,
            unwanted: vec![2],
            ..RecoveryBlob::default()
        };
        let bytes = blob.encode().unwrap();
        let mut add = params(JobSource::RecoveryState(bytes.clone()));
        add.recovery = Some(bytes);
        let (args, metainfo, parsed) = add_arguments(&add).unwrap();
        assert_eq!(args["metainfo"], json!("ZGU="));
        assert_eq!(args["download-dir"], json!("/elsewhere"));
        assert_eq!(args["paused"], json!(true));
        assert_eq!(args["files-unwanted"], json!([2]));
        assert_eq!(metainfo.as_deref(), Some("ZGU="));
        assert!(parsed.is_some());
    }

    #[test]
    fn add_arguments_reject_bad_recovery_state() {
        let add = params(JobSource::RecoveryState(b"not json".to_vec()));
        assert!(add_arguments(&add).is_err());
        let empty = RecoveryBlob::default().encode().unwrap();
        let add = params(JobSource::RecoveryState(empty));
        assert!(add_arguments(&add).unwrap_err().contains("neither"));
    }

    #[test]
    fn fresh_adds_use_save_path_and_limits() {
        let mut add = params(JobSource::Metainfo {
            bytes: b"de".to_vec(),
            origin: PathBuf::from("x.torrent"),
        });
        add.upload_limit = 10;
        let (args, metainfo, blob) = add_arguments(&add).unwrap();
        assert_eq!(args["download-dir"], json!("/srv/data"));
        assert_eq!(args["peer-limit"], json!(50));
        assert!(!args.contains_key("paused"));
        assert_eq!(metainfo.as_deref(), Some("ZGU="));
        let fields = post_add_fields(&add, blob.as_ref());
        assert_eq!(fields["uploadLimit"], json!(10));
        assert!(!fields.contains_key("downloadLimit"));
    }
}
