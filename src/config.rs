use std::{
    env,
    ffi::OsString,
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use dirs::config_dir;
use log::LevelFilter;
use serde::Deserialize;

use crate::settings::{split_assignment, AllocationMode};

/// Long options the console owns; any other `--name=value` is an engine setting.
const OWN_LONG_OPTIONS: &[&str] = &["url", "config", "log-level"];

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub rpc: RpcConfig,
    pub console: ConsoleConfig,
    pub log_level: LevelFilter,
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    pub verify_ssl: bool,
    pub user_agent: String,
    pub url: Option<String>,
}

impl RpcConfig {
    pub fn endpoint(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let mut path = self.path.clone();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, path)
    }
}

#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    pub save_path: PathBuf,
    pub monitor_dir: Option<PathBuf>,
    pub monitor_interval: Duration,
    pub refresh_delay: Duration,
    pub poll_interval: Duration,
    pub max_connections: u32,
    pub upload_limit: u32,
    pub download_limit: u32,
    pub ip_filter: Option<PathBuf>,
    pub allocation: Option<AllocationMode>,
    pub disable_disk_io: bool,
    pub peer: Option<SocketAddr>,
    pub shutdown_timeout: Duration,
    pub jobs: Vec<String>,
}

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Operator console for a Transmission daemon", long_about = None)]
pub struct Cli {
    /// Directory jobs download into; recovery state lives in <path>/.resume
    #[arg(short = 's', value_name = "PATH")]
    pub save_path: Option<PathBuf>,
    /// Directory polled for .torrent and .magnet files
    #[arg(short = 'm', value_name = "DIR")]
    pub monitor_dir: Option<PathBuf>,
    /// Seconds between monitor directory scans
    #[arg(short = 't', value_name = "SECS")]
    pub monitor_interval: Option<u64>,
    /// Milliseconds between screen refreshes
    #[arg(short = 'F', value_name = "MS")]
    pub refresh_delay: Option<u64>,
    /// Connection cap per job
    #[arg(short = 'T', value_name = "N")]
    pub max_connections: Option<u32>,
    /// Upload limit per job in kB/s
    #[arg(short = 'U', value_name = "KBPS")]
    pub upload_limit: Option<u32>,
    /// Download limit per job in kB/s
    #[arg(short = 'D', value_name = "KBPS")]
    pub download_limit: Option<u32>,
    /// eMule style IP filter file
    #[arg(short = 'x', value_name = "FILE")]
    pub ip_filter: Option<PathBuf>,
    #[arg(short = 'a', value_enum, value_name = "MODE")]
    pub allocation: Option<AllocationMode>,
    /// Disable disk I/O (not available on the daemon; reported and ignored)
    #[arg(short = '0', action = ArgAction::SetTrue)]
    pub disable_disk_io: bool,
    /// Write the log to FILE
    #[arg(short = 'f', value_name = "FILE")]
    pub log_file: Option<PathBuf>,
    /// Peer to connect every added job to
    #[arg(short = 'r', value_name = "IP:PORT")]
    pub peer: Option<SocketAddr>,
    #[arg(long)]
    pub url: Option<String>,
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub log_level: Option<String>,
    /// Print the engine settings accepted as --name=value and exit
    #[arg(long, action = ArgAction::SetTrue)]
    pub list_settings: bool,
    /// .torrent files or magnet links to add
    #[arg(value_name = "TORRENT")]
    pub jobs: Vec<String>,
    #[arg(skip)]
    pub settings: Vec<(String, String)>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse_from_args(env::args_os())
    }

    pub fn parse_from_args<I>(args: I) -> Self
    where
        I: IntoIterator<Item = OsString>,
    {
        let (rest, settings) = split_args(args);
        let mut cli = Self::parse_from(rest);
        cli.settings = settings;
        cli
    }
}

/// Separates engine `--name=value` settings from the arguments clap should see.
pub fn split_args<I>(args: I) -> (Vec<OsString>, Vec<(String, String)>)
where
    I: IntoIterator<Item = OsString>,
{
    let mut rest = Vec::new();
    let mut settings = Vec::new();
    for arg in args {
        let setting = arg.to_str().and_then(split_assignment).and_then(|(name, value)| {
            (!OWN_LONG_OPTIONS.contains(&name)).then(|| (name.to_string(), value.to_string()))
        });
        match setting {
            Some(pair) => settings.push(pair),
            None => rest.push(arg),
        }
    }
    (rest, settings)
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    rpc: Option<FileRpcConfig>,
    console: Option<FileConsoleConfig>,
    poll_interval: Option<f64>,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct FileRpcConfig {
    url: Option<String>,
    scheme: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    path: Option<String>,
    username: Option<String>,
    password: Option<String>,
    timeout: Option<f64>,
    tls: Option<bool>,
    verify_ssl: Option<bool>,
    user_agent: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConsoleConfig {
    save_path: Option<PathBuf>,
    monitor_dir: Option<PathBuf>,
    monitor_interval: Option<u64>,
    refresh_delay_ms: Option<u64>,
    max_connections: Option<u32>,
    upload_limit: Option<u32>,
    download_limit: Option<u32>,
    ip_filter: Option<PathBuf>,
    shutdown_timeout: Option<f64>,
}

pub fn build_config(cli: &Cli) -> Result<AppConfig> {
    let file_config = load_file_config(cli.config.as_deref())?;
    let rpc_file = file_config.as_ref().and_then(|cfg| cfg.rpc.as_ref());
    let console_file = file_config.as_ref().and_then(|cfg| cfg.console.as_ref());

    let url = cli
        .url
        .clone()
        .or_else(|| env::var("TRANSMISSION_URL").ok())
        .or_else(|| rpc_file.and_then(|cfg| cfg.url.clone()));

    let host = env::var("TRANSMISSION_HOST")
        .ok()
        .or_else(|| rpc_file.and_then(|cfg| cfg.host.clone()))
        .unwrap_or_else(|| "localhost".to_string());

    let port = env_var_parse("TRANSMISSION_PORT")
        .or_else(|| rpc_file.and_then(|cfg| cfg.port))
        .unwrap_or(9091);

    let path = env::var("TRANSMISSION_RPC_PATH")
        .ok()
        .or_else(|| rpc_file.and_then(|cfg| cfg.path.clone()))
        .unwrap_or_else(|| "/transmission/rpc".to_string());

    let username = env::var("TRANSMISSION_USERNAME")
        .ok()
        .or_else(|| rpc_file.and_then(|cfg| cfg.username.clone()));

    let password = env::var("TRANSMISSION_PASSWORD")
        .ok()
        .or_else(|| rpc_file.and_then(|cfg| cfg.password.clone()));

    let timeout_secs = env_float("TRANSMISSION_TIMEOUT")
        .or_else(|| rpc_file.and_then(|cfg| cfg.timeout))
        .unwrap_or(10.0);

    let timeout = seconds("timeout", timeout_secs, false)?;

    let poll_secs = env_float("TRANSMISSION_POLL_INTERVAL")
        .or_else(|| file_config.as_ref().and_then(|cfg| cfg.poll_interval))
        .unwrap_or(1.0);

    let poll_interval = seconds("poll interval", poll_secs, false)?;

    let use_tls = env_bool("TRANSMISSION_TLS")
        .or_else(|| rpc_file.and_then(|cfg| cfg.tls))
        .unwrap_or(false);

    let mut verify_ssl = rpc_file.and_then(|cfg| cfg.verify_ssl).unwrap_or(true);
    if let Some(value) = env_bool("TRANSMISSION_VERIFY_SSL") {
        verify_ssl = value;
    }

    let scheme = rpc_file
        .and_then(|cfg| cfg.scheme.clone())
        .unwrap_or_else(|| if use_tls { "https" } else { "http" }.to_string());

    let user_agent = env::var("TRANSMISSION_USER_AGENT")
        .ok()
        .or_else(|| rpc_file.and_then(|cfg| cfg.user_agent.clone()))
        .unwrap_or_else(|| "transmission-console".to_string());

    let save_path = cli
        .save_path
        .clone()
        .or_else(|| env::var_os("TRANSMISSION_SAVE_PATH").map(PathBuf::from))
        .or_else(|| console_file.and_then(|cfg| cfg.save_path.clone()))
        .unwrap_or_else(|| PathBuf::from("."));

    let monitor_dir = cli
        .monitor_dir
        .clone()
        .or_else(|| env::var_os("TRANSMISSION_MONITOR_DIR").map(PathBuf::from))
        .or_else(|| console_file.and_then(|cfg| cfg.monitor_dir.clone()));

    let monitor_interval = cli
        .monitor_interval
        .or_else(|| console_file.and_then(|cfg| cfg.monitor_interval))
        .unwrap_or(5);

    let refresh_delay = cli
        .refresh_delay
        .or_else(|| console_file.and_then(|cfg| cfg.refresh_delay_ms))
        .unwrap_or(500);

    let max_connections = cli
        .max_connections
        .or_else(|| console_file.and_then(|cfg| cfg.max_connections))
        .unwrap_or(50);

    let upload_limit = cli
        .upload_limit
        .or_else(|| console_file.and_then(|cfg| cfg.upload_limit))
        .unwrap_or(0);

    let download_limit = cli
        .download_limit
        .or_else(|| console_file.and_then(|cfg| cfg.download_limit))
        .unwrap_or(0);

    let ip_filter = cli
        .ip_filter
        .clone()
        .or_else(|| console_file.and_then(|cfg| cfg.ip_filter.clone()));

    let shutdown_secs = env_float("TRANSMISSION_SHUTDOWN_TIMEOUT")
        .or_else(|| console_file.and_then(|cfg| cfg.shutdown_timeout))
        .unwrap_or(60.0);

    let shutdown_timeout = seconds("shutdown timeout", shutdown_secs, true)?;

    let log_file = cli
        .log_file
        .clone()
        .or_else(|| file_config.as_ref().and_then(|cfg| cfg.log_file.clone()));

    let log_level = cli
        .log_level
        .clone()
        .or_else(|| env::var("TRANSMISSION_LOG_LEVEL").ok())
        .or_else(|| file_config.as_ref().and_then(|cfg| cfg.log_level.clone()))
        .and_then(|value| LevelFilter::from_str(&value).ok())
        .unwrap_or_else(|| default_log_level(log_file.is_some()));

    Ok(AppConfig {
        rpc: RpcConfig {
            scheme,
            host,
            port,
            path,
            username,
            password,
            timeout,
            verify_ssl,
            user_agent,
            url,
        },
        console: ConsoleConfig {
            save_path,
            monitor_dir,
            monitor_interval: Duration::from_secs(monitor_interval),
            refresh_delay: Duration::from_millis(refresh_delay),
            poll_interval,
            max_connections,
            upload_limit,
            download_limit,
            ip_filter,
            allocation: cli.allocation,
            disable_disk_io: cli.disable_disk_io,
            peer: cli.peer,
            shutdown_timeout,
            jobs: cli.jobs.clone(),
        },
        log_level,
        log_file,
    })
}

/// Logging to the terminal would garble the full-screen frame, so only errors go there.
pub fn default_log_level(to_file: bool) -> LevelFilter {
    if to_file {
        LevelFilter::Info
    } else {
        LevelFilter::Error
    }
}

fn load_file_config(path: Option<&Path>) -> Result<Option<FileConfig>> {
    if let Some(path) = path {
        return read_file_config(path);
    }

    if let Ok(env_path) = env::var("TRANSMISSION_CONSOLE_CONFIG") {
        return read_file_config(Path::new(&env_path));
    }

    if let Some(dir) = config_dir() {
        let path = dir.join("transmission-console").join("config.toml");
        return read_file_config(&path);
    }

    Ok(None)
}

fn read_file_config(path: &Path) -> Result<Option<FileConfig>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let parsed: FileConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(Some(parsed))
}

fn env_var_parse<T>(name: &str) -> Option<T>
where
    T: FromStr,
{
    env::var(name).ok().and_then(|value| value.parse().ok())
}

fn env_float(name: &str) -> Option<f64> {
    env_var_parse(name)
}

fn seconds(what: &str, secs: f64, allow_zero: bool) -> Result<Duration> {
    let duration = Duration::try_from_secs_f64(secs)
        .map_err(|_| anyhow::anyhow!("{what} must be a finite number of seconds, got {secs}"))?;
    if duration.is_zero() && !allow_zero {
        anyhow::bail!("{what} must be positive");
    }
    Ok(duration)
}

fn env_bool(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .and_then(|value| match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn seconds_reject_nan_infinity_and_negatives() {
        assert!(seconds("shutdown timeout", f64::NAN, true).is_err());
        assert!(seconds("shutdown timeout", f64::INFINITY, true).is_err());
        assert!(seconds("shutdown timeout", -1.0, true).is_err());
        assert!(seconds("timeout", 0.0, false).is_err());
        assert_eq!(
            seconds("shutdown timeout", 0.0, true).unwrap(),
            Duration::ZERO
        );
        assert_eq!(
            seconds("poll interval", 0.5, false).unwrap(),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn settings_are_split_from_own_options() {
        let (rest, settings) = split_args(args(&[
            "console",
            "--peer_port=51413",
            "--url=http://nas:9091/transmission/rpc",
            "-s",
            "/srv",
            "--dht_enabled=0",
        ]));
        assert_eq!(
            settings,
            vec![
                ("peer_port".to_string(), "51413".to_string()),
                ("dht_enabled".to_string(), "0".to_string()),
            ]
        );
        assert_eq!(rest.len(), 4);
    }

    #[test]
    fn parses_short_switches_and_positionals() {
        let cli = Cli::parse_from_args(args(&[
            "console",
            "-s",
            "/srv/data",
            "-T",
            "80",
            "-a",
            "allocate",
            "-0",
            "-r",
            "10.0.0.2:6881",
            "--seed_ratio_limit=2.0",
            "movie.torrent",
            "magnet:?xt=urn:btih:abc",
        ]));
        assert_eq!(cli.save_path, Some(PathBuf::from("/srv/data")));
        assert_eq!(cli.max_connections, Some(80));
        assert_eq!(cli.allocation, Some(AllocationMode::Allocate));
        assert!(cli.disable_disk_io);
        assert_eq!(cli.peer, Some("10.0.0.2:6881".parse().unwrap()));
        assert_eq!(cli.jobs, vec!["movie.torrent", "magnet:?xt=urn:btih:abc"]);
        assert_eq!(cli.settings.len(), 1);
    }

    #[test]
    fn reads_console_section_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "log_level = \"debug\"\n[rpc]\nport = 9092\n[console]\nmonitor_interval = 9\nshutdown_timeout = 5.0\n",
        )
        .unwrap();
        let parsed = read_file_config(&path).unwrap().unwrap();
        assert_eq!(parsed.log_level.as_deref(), Some("debug"));
        assert_eq!(parsed.rpc.unwrap().port, Some(9092));
        let console = parsed.console.unwrap();
        assert_eq!(console.monitor_interval, Some(9));
        assert_eq!(console.shutdown_timeout, Some(5.0));
        assert!(read_file_config(&dir.path().join("absent.toml")).unwrap().is_none());
    }

    #[test]
    fn quiet_terminal_logging_by_default() {
        assert_eq!(default_log_level(false), LevelFilter::Error);
        assert_eq!(default_log_level(true), LevelFilter::Info);
    }

    #[test]
    fn endpoint_prefers_explicit_url() {
        let mut rpc = RpcConfig {
            scheme: "http".into(),
            host: "nas".into(),
            port: 9091,
            path: "transmission/rpc".into(),
            username: None,
            password: None,
            timeout: Duration::from_secs(1),
            verify_ssl: true,
            user_agent: "test".into(),
            url: None,
        };
        assert_eq!(rpc.endpoint(), "http://nas:9091/transmission/rpc");
        rpc.url = Some("https://box/rpc".into());
        assert_eq!(rpc.endpoint(), "https://box/rpc");
    }
}
