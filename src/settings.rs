use clap::ValueEnum;
use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Str,
    Bool,
    Int,
    Float,
}

impl SettingKind {
    fn placeholder(self) -> &'static str {
        match self {
            SettingKind::Str => "<string>",
            SettingKind::Bool => "<bool>",
            SettingKind::Int => "<int>",
            SettingKind::Float => "<float>",
        }
    }
}

pub const ENGINE_SETTINGS: &[(&str, SettingKind)] = &[
    ("download_dir", SettingKind::Str),
    ("incomplete_dir", SettingKind::Str),
    ("blocklist_url", SettingKind::Str),
    ("encryption", SettingKind::Str),
    ("script_torrent_done_filename", SettingKind::Str),
    ("start_added_torrents", SettingKind::Bool),
    ("speed_limit_up_enabled", SettingKind::Bool),
    ("speed_limit_down_enabled", SettingKind::Bool),
    ("seed_ratio_limited", SettingKind::Bool),
    ("idle_seeding_limit_enabled", SettingKind::Bool),
    ("alt_speed_enabled", SettingKind::Bool),
    ("pex_enabled", SettingKind::Bool),
    ("dht_enabled", SettingKind::Bool),
    ("lpd_enabled", SettingKind::Bool),
    ("utp_enabled", SettingKind::Bool),
    ("blocklist_enabled", SettingKind::Bool),
    ("incomplete_dir_enabled", SettingKind::Bool),
    ("port_forwarding_enabled", SettingKind::Bool),
    ("rename_partial_files", SettingKind::Bool),
    ("download_queue_enabled", SettingKind::Bool),
    ("seed_queue_enabled", SettingKind::Bool),
    ("speed_limit_up", SettingKind::Int),
    ("speed_limit_down", SettingKind::Int),
    ("alt_speed_up", SettingKind::Int),
    ("alt_speed_down", SettingKind::Int),
    ("idle_seeding_limit", SettingKind::Int),
    ("peer_limit_per_torrent", SettingKind::Int),
    ("peer_limit_global", SettingKind::Int),
    ("peer_port", SettingKind::Int),
    ("download_queue_size", SettingKind::Int),
    ("seed_queue_size", SettingKind::Int),
    ("queue_stalled_minutes", SettingKind::Int),
    ("preallocation", SettingKind::Int),
    ("cache_size_mb", SettingKind::Int),
    ("seed_ratio_limit", SettingKind::Float),
];

pub fn setting_kind(name: &str) -> Option<SettingKind> {
    ENGINE_SETTINGS
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, kind)| *kind)
}

pub fn setting_lines() -> Vec<String> {
    let order = [
        SettingKind::Str,
        SettingKind::Bool,
        SettingKind::Int,
        SettingKind::Float,
    ];
    order
        .iter()
        .flat_map(|kind| {
            ENGINE_SETTINGS
                .iter()
                .filter(move |(_, candidate)| candidate == kind)
                .map(|(name, kind)| format!("{name}={}", kind.placeholder()))
        })
        .collect()
}

pub fn split_assignment(token: &str) -> Option<(&str, &str)> {
    let body = token.strip_prefix("--")?;
    let (name, value) = body.split_once('=')?;
    if name.is_empty() {
        return None;
    }
    Some((name, value))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingError {
    #[error("unknown setting: \"{0}\"")]
    Unknown(String),
    #[error("invalid value for \"{0}\". expected 0 or 1")]
    InvalidBool(String),
    #[error("invalid value for \"{name}\": \"{value}\" is not a number")]
    InvalidNumber { name: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum AllocationMode {
    #[default]
    Sparse,
    Allocate,
}

impl AllocationMode {
    pub fn label(self) -> &'static str {
        match self {
            AllocationMode::Sparse => "sparse",
            AllocationMode::Allocate => "allocate",
        }
    }

    pub fn rpc_value(self) -> i64 {
        match self {
            AllocationMode::Sparse => 0,
            AllocationMode::Allocate => 2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsPack {
    values: Map<String, Value>,
}

impl SettingsPack {
    pub fn set(&mut self, name: &str, raw: &str) -> Result<(), SettingError> {
        let kind = setting_kind(name).ok_or_else(|| SettingError::Unknown(name.to_string()))?;
        let value = match kind {
            SettingKind::Str => Value::String(raw.to_string()),
            SettingKind::Bool => match raw {
                "0" => Value::Bool(false),
                "1" => Value::Bool(true),
                _ => return Err(SettingError::InvalidBool(name.to_string())),
            },
            SettingKind::Int => {
                let parsed: i64 = raw.trim().parse().map_err(|_| SettingError::InvalidNumber {
                    name: name.to_string(),
                    value: raw.to_string(),
                })?;
                json!(parsed)
            }
            SettingKind::Float => {
                let parsed: f64 = raw.trim().parse().map_err(|_| SettingError::InvalidNumber {
                    name: name.to_string(),
                    value: raw.to_string(),
                })?;
                json!(parsed)
            }
        };
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    pub fn set_allocation(&mut self, mode: AllocationMode) {
        self.values
            .insert("preallocation".to_string(), json!(mode.rpc_value()));
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn to_rpc_map(&self) -> Map<String, Value> {
        self.values.clone()
    }
}
