use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{blocking::Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use serde_with::{serde_as, DefaultOnNull};
use thiserror::Error;

use crate::{
    config::RpcConfig,
    model::{
        FileView, JobId, JobState, JobStatusView, PeerInfoView, SessionStatsView, TrackerView,
    },
};

#[derive(Debug, Error)]
pub enum TransmissionError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("authentication failed")]
    Authentication,
    #[error("session negotiation failed")]
    Session,
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("response parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type RpcResult<T> = std::result::Result<T, TransmissionError>;

const JOB_FIELDS: &[&str] = &[
    "id",
    "hashString",
    "name",
    "status",
    "error",
    "errorString",
    "percentDone",
    "metadataPercentComplete",
    "rateDownload",
    "rateUpload",
    "eta",
    "sizeWhenDone",
    "leftUntilDone",
    "downloadedEver",
    "uploadedEver",
    "peersConnected",
    "peersSendingToUs",
    "queuePosition",
    "downloadDir",
    "magnetLink",
    "pieces",
    "pieceCount",
    "sequential_download",
    "uploadLimit",
    "uploadLimited",
    "downloadLimit",
    "downloadLimited",
    "peer-limit",
    "peers",
    "files",
    "fileStats",
    "trackerStats",
];

pub struct TransmissionClient {
    http: Client,
    endpoint: String,
    auth: Option<(String, Option<String>)>,
    session_id: Mutex<Option<String>>,
    counter: AtomicU64,
}

impl TransmissionClient {
    pub fn new(config: RpcConfig) -> Result<Self> {
        let endpoint = config.endpoint();
        let RpcConfig {
            username,
            password,
            timeout,
            verify_ssl,
            user_agent,
            ..
        } = config;
        let mut builder = Client::builder().timeout(timeout).user_agent(user_agent);
        if !verify_ssl {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build()?;
        let auth = username.map(|user| (user, password));
        Ok(Self {
            http,
            endpoint,
            auth,
            session_id: Mutex::new(None),
            counter: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn fetch_jobs(&self, ids: Option<&[JobId]>) -> RpcResult<Vec<TorrentWire>> {
        let mut args = json!({ "fields": JOB_FIELDS });
        if let Some(ids) = ids {
            args["ids"] = json!(id_list(ids));
        }
        let response: TorrentGetResponse = self.call("torrent-get", Some(args))?;
        Ok(response.torrents)
    }

    pub fn fetch_stats(&self) -> RpcResult<SessionStatsView> {
        let stats: SessionStats = self.call("session-stats", None)?;
        let session: SessionInfo = self.call("session-get", Some(json!({"fields": ["version"]})))?;
        let cumulative = stats.cumulative.unwrap_or_default();
        Ok(SessionStatsView {
            version: session.version.unwrap_or_else(|| "unknown".to_string()),
            download_rate: stats.download_speed,
            upload_rate: stats.upload_speed,
            total_download: cumulative.downloaded_bytes,
            total_upload: cumulative.uploaded_bytes,
            active_jobs: stats.active_torrent_count,
            paused_jobs: stats.paused_torrent_count,
            total_jobs: stats.torrent_count,
        })
    }

    pub fn add_torrent(&self, args: Map<String, Value>) -> RpcResult<AddTorrentOutcome> {
        let response: AddTorrentResponse = self.call("torrent-add", Some(Value::Object(args)))?;
        Ok(AddTorrentOutcome::from(response))
    }

    /// Runs a per-torrent action (`torrent-start`, `torrent-stop`, ...). `None` targets all.
    pub fn torrent_action(&self, method: &str, ids: Option<&[JobId]>) -> RpcResult<()> {
        let args = ids.map(|ids| json!({ "ids": id_list(ids) }));
        self.call_raw(method, args)?;
        Ok(())
    }

    pub fn torrent_set(&self, ids: &[JobId], fields: Map<String, Value>) -> RpcResult<()> {
        if ids.is_empty() || fields.is_empty() {
            return Ok(());
        }
        let mut args = fields;
        args.insert("ids".to_string(), json!(id_list(ids)));
        self.call_raw("torrent-set", Some(Value::Object(args)))?;
        Ok(())
    }

    pub fn session_set(&self, fields: Map<String, Value>) -> RpcResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.call_raw("session-set", Some(Value::Object(fields)))?;
        Ok(())
    }

    pub fn remove_torrents(&self, ids: &[JobId], delete_local_data: bool) -> RpcResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let args = json!({
            "ids": id_list(ids),
            "delete-local-data": delete_local_data,
        });
        self.call_raw("torrent-remove", Some(args))?;
        Ok(())
    }

    fn call<T>(&self, method: &str, arguments: Option<Value>) -> RpcResult<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let value = self.call_raw(method, arguments)?;
        serde_json::from_value(value).map_err(TransmissionError::from)
    }

    fn call_raw(&self, method: &str, arguments: Option<Value>) -> RpcResult<Value> {
        let payload = RpcRequest {
            method,
            arguments,
            tag: self.counter.fetch_add(1, Ordering::Relaxed),
        };
        loop {
            let mut request = self
                .http
                .post(&self.endpoint)
                .header("Content-Type", "application/json")
                .json(&payload);
            if let Some((user, pass)) = &self.auth {
                request = request.basic_auth(user, pass.as_ref());
            }
            let session_header = match self.session_id.lock() {
                Ok(guard) => (*guard).clone(),
                Err(_) => None,
            };
            if let Some(session) = session_header {
                request = request.header("X-Transmission-Session-Id", session);
            }
            let response = request.send()?;
            match response.status() {
                StatusCode::CONFLICT => {
                    if let Some(id) = response.headers().get("X-Transmission-Session-Id") {
                        let value = id
                            .to_str()
                            .map_err(|_| TransmissionError::Session)?
                            .to_string();
                        if let Ok(mut guard) = self.session_id.lock() {
                            *guard = Some(value);
                        }
                        continue;
                    }
                    return Err(TransmissionError::Session);
                }
                StatusCode::UNAUTHORIZED => return Err(TransmissionError::Authentication),
                status if !status.is_success() => {
                    return Err(TransmissionError::HttpStatus(status));
                }
                _ => {
                    let body: RpcResponse = response.json()?;
                    if body.result != "success" {
                        return Err(TransmissionError::Rpc(body.result));
                    }
                    return Ok(body.arguments.unwrap_or(Value::Null));
                }
            }
        }
    }
}

fn id_list(ids: &[JobId]) -> Vec<&str> {
    ids.iter().map(JobId::as_str).collect()
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
    tag: u64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    arguments: Option<Value>,
    result: String,
}

#[derive(Debug, Deserialize)]
struct SessionStats {
    #[serde(default, alias = "activeTorrentCount")]
    active_torrent_count: i64,
    #[serde(default, alias = "pausedTorrentCount")]
    paused_torrent_count: i64,
    #[serde(default, alias = "torrentCount")]
    torrent_count: i64,
    #[serde(default, alias = "downloadSpeed")]
    download_speed: i64,
    #[serde(default, alias = "uploadSpeed")]
    upload_speed: i64,
    #[serde(default, rename = "cumulative-stats", alias = "cumulative_stats")]
    cumulative: Option<TransferTotals>,
}

#[derive(Debug, Default, Deserialize)]
struct TransferTotals {
    #[serde(default, alias = "downloadedBytes")]
    downloaded_bytes: i64,
    #[serde(default, alias = "uploadedBytes")]
    uploaded_bytes: i64,
}

#[derive(Debug, Deserialize)]
struct SessionInfo {
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TorrentGetResponse {
    #[serde(default)]
    torrents: Vec<TorrentWire>,
}

#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TorrentWire {
    #[serde(default, alias = "hashString")]
    pub hash_string: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: i64,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default, alias = "errorString")]
    pub error_string: String,
    #[serde(default, alias = "percentDone")]
    pub percent_done: f64,
    #[serde(default, alias = "metadataPercentComplete")]
    pub metadata_percent_complete: f64,
    #[serde(default, alias = "rateDownload")]
    pub rate_download: i64,
    #[serde(default, alias = "rateUpload")]
    pub rate_upload: i64,
    #[serde(default)]
    pub eta: i64,
    #[serde(default, alias = "sizeWhenDone")]
    pub size_when_done: i64,
    #[serde(default, alias = "leftUntilDone")]
    pub left_until_done: i64,
    #[serde(default, alias = "downloadedEver")]
    pub downloaded_ever: i64,
    #[serde(default, alias = "uploadedEver")]
    pub uploaded_ever: i64,
    #[serde(default, alias = "peersConnected")]
    pub peers_connected: i64,
    #[serde(default, alias = "peersSendingToUs")]
    pub peers_sending_to_us: i64,
    #[serde(default, alias = "queuePosition")]
    pub queue_position: i64,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default, alias = "downloadDir")]
    pub download_dir: String,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default, alias = "magnetLink")]
    pub magnet_link: String,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub pieces: String,
    #[serde(default, alias = "pieceCount")]
    pub piece_count: usize,
    #[serde(default, alias = "sequentialDownload")]
    pub sequential_download: bool,
    #[serde(default, alias = "uploadLimit")]
    pub upload_limit: i64,
    #[serde(default, alias = "uploadLimited")]
    pub upload_limited: bool,
    #[serde(default, alias = "downloadLimit")]
    pub download_limit: i64,
    #[serde(default, alias = "downloadLimited")]
    pub download_limited: bool,
    #[serde(default, rename = "peer-limit", alias = "peer_limit")]
    pub peer_limit: i64,
    #[serde(default)]
    pub peers: Vec<PeerWire>,
    #[serde(default)]
    pub files: Vec<FileWire>,
    #[serde(default, alias = "fileStats", alias = "file_stats")]
    pub file_stats: Vec<FileStatWire>,
    #[serde(default, alias = "trackerStats", alias = "tracker_stats")]
    pub tracker_stats: Vec<TrackerStatWire>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerWire {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, alias = "clientName")]
    pub client_name: String,
    #[serde(default)]
    pub progress: f64,
    #[serde(default, alias = "rateToClient")]
    pub rate_to_client: i64,
    #[serde(default, alias = "rateToPeer")]
    pub rate_to_peer: i64,
    #[serde(default, alias = "flagStr")]
    pub flag_str: String,
    #[serde(default, alias = "isEncrypted")]
    pub is_encrypted: bool,
    #[serde(default, alias = "isUTP")]
    pub is_utp: bool,
    #[serde(default, alias = "isIncoming")]
    pub is_incoming: bool,
}

impl PeerWire {
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileWire {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub length: i64,
    #[serde(default, alias = "bytesCompleted")]
    pub bytes_completed: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileStatWire {
    #[serde(default = "default_true")]
    pub wanted: bool,
    #[serde(default)]
    pub priority: i32,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackerStatWire {
    #[serde(default)]
    pub announce: String,
    #[serde(default)]
    pub tier: i64,
    #[serde(default, alias = "lastAnnounceResult")]
    pub last_announce_result: String,
    #[serde(default, alias = "lastAnnounceSucceeded")]
    pub last_announce_succeeded: bool,
    #[serde(default, alias = "hasAnnounced")]
    pub has_announced: bool,
    #[serde(default, alias = "nextAnnounceTime")]
    pub next_announce_time: i64,
    #[serde(default, alias = "seederCount")]
    pub seeder_count: i64,
    #[serde(default, alias = "leecherCount")]
    pub leecher_count: i64,
}

impl TorrentWire {
    pub fn job_id(&self) -> JobId {
        JobId::new(self.hash_string.as_str())
    }

    pub fn state(&self) -> JobState {
        JobState::from_rpc(self.status)
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata_percent_complete >= 1.0
    }

    pub fn status_view(&self, needs_save: bool, auto_managed: bool) -> JobStatusView {
        let state = self.state();
        JobStatusView {
            id: self.job_id(),
            name: self.name.clone(),
            state,
            progress: self.percent_done,
            total_wanted: self.size_when_done,
            total_wanted_done: (self.size_when_done - self.left_until_done).max(0),
            total_download: self.downloaded_ever,
            total_upload: self.uploaded_ever,
            download_rate: self.rate_download,
            upload_rate: self.rate_upload,
            num_peers: self.peers_connected,
            num_seeds: self.peers_sending_to_us,
            queue_position: self.queue_position,
            eta: if self.eta >= 0 { Some(self.eta) } else { None },
            error: if self.error_string.is_empty() {
                None
            } else {
                Some(self.error_string.clone())
            },
            pieces: decode_pieces(&self.pieces, self.piece_count),
            sequential: self.sequential_download,
            auto_managed,
            paused: state == JobState::Stopped,
            needs_save,
            has_metadata: self.has_metadata(),
        }
    }

    pub fn peer_views(&self) -> Vec<PeerInfoView> {
        self.peers
            .iter()
            .map(|peer| PeerInfoView {
                address: peer.endpoint(),
                client: peer.client_name.clone(),
                progress: peer.progress,
                download_rate: peer.rate_to_client,
                upload_rate: peer.rate_to_peer,
                flags: peer.flag_str.clone(),
                utp: peer.is_utp,
                encrypted: peer.is_encrypted,
                incoming: peer.is_incoming,
                connecting: false,
                handshaking: false,
            })
            .collect()
    }

    pub fn file_views(&self) -> Vec<FileView> {
        self.files
            .iter()
            .enumerate()
            .map(|(index, file)| {
                let stat = self.file_stats.get(index).cloned().unwrap_or(FileStatWire {
                    wanted: true,
                    priority: 0,
                });
                FileView {
                    index,
                    name: file.name.clone(),
                    size: file.length,
                    downloaded: file.bytes_completed,
                    priority: stat.priority,
                    wanted: stat.wanted,
                    pad: is_pad_file(&file.name),
                }
            })
            .collect()
    }

    pub fn tracker_views(&self, now: i64) -> Vec<TrackerView> {
        self.tracker_stats
            .iter()
            .map(|tracker| TrackerView {
                tier: tracker.tier,
                url: tracker.announce.clone(),
                last_result: tracker.last_announce_result.clone(),
                succeeded: tracker.last_announce_succeeded,
                announced: tracker.has_announced,
                next_announce: if tracker.next_announce_time > 0 {
                    Some((tracker.next_announce_time - now).max(0))
                } else {
                    None
                },
                seeders: tracker.seeder_count,
                leechers: tracker.leecher_count,
            })
            .collect()
    }
}

fn is_pad_file(name: &str) -> bool {
    name.starts_with(".pad/") || name.contains("/.pad/")
}

/// Expands the daemon's base64 piece bitfield (most significant bit first).
pub fn decode_pieces(encoded: &str, count: usize) -> Vec<bool> {
    if count == 0 {
        return Vec::new();
    }
    let bytes = STANDARD.decode(encoded.trim()).unwrap_or_default();
    (0..count)
        .map(|index| {
            bytes
                .get(index / 8)
                .map(|byte| byte & (0x80 >> (index % 8)) != 0)
                .unwrap_or(false)
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct AddTorrentResponse {
    #[serde(rename = "torrent-added", alias = "torrentAdded", alias = "torrent_added")]
    torrent_added: Option<TorrentRef>,
    #[serde(
        rename = "torrent-duplicate",
        alias = "torrentDuplicate",
        alias = "torrent_duplicate"
    )]
    torrent_duplicate: Option<TorrentRef>,
}

#[derive(Debug, Deserialize)]
struct TorrentRef {
    name: Option<String>,
    #[serde(alias = "hashString")]
    hash_string: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AddTorrentOutcome {
    pub job: Option<JobId>,
    pub name: Option<String>,
    pub duplicate: bool,
}

impl From<AddTorrentResponse> for AddTorrentOutcome {
    fn from(resp: AddTorrentResponse) -> Self {
        if let Some(added) = resp.torrent_added {
            AddTorrentOutcome {
                job: added.hash_string.map(JobId::new),
                name: added.name,
                duplicate: false,
            }
        } else if let Some(dup) = resp.torrent_duplicate {
            AddTorrentOutcome {
                job: dup.hash_string.map(JobId::new),
                name: dup.name,
                duplicate: true,
            }
        } else {
            AddTorrentOutcome {
                job: None,
                name: None,
                duplicate: false,
            }
        }
    }
}
