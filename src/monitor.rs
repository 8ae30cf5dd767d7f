use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use log::{info, warn};
use thiserror::Error;

use crate::engine::{EngineError, JobSource};

/// Largest metainfo file accepted from disk.
pub const MAX_METAINFO_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("{path}: file is {size} bytes, limit is {MAX_METAINFO_SIZE}")]
    TooLarge { path: String, size: u64 },
    #[error("{0}: not a bencoded dictionary")]
    NotMetainfo(String),
    #[error("{0}: not a magnet link")]
    NotMagnet(String),
    #[error("{0}: unsupported job description")]
    Unsupported(String),
}

pub fn parse_descriptor(path: &Path) -> Result<JobSource, DescriptorError> {
    let shown = path.display().to_string();
    let io_err = |source| DescriptorError::Io {
        path: shown.clone(),
        source,
    };
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("magnet") => {
            let text = fs::read_to_string(path).map_err(io_err)?;
            let uri = text.trim();
            if !uri.starts_with("magnet:") {
                return Err(DescriptorError::NotMagnet(shown));
            }
            Ok(JobSource::Magnet(uri.to_string()))
        }
        Some("torrent") => read_metainfo(path),
        _ => Err(DescriptorError::Unsupported(shown)),
    }
}

pub fn read_metainfo(path: &Path) -> Result<JobSource, DescriptorError> {
    let shown = path.display().to_string();
    let size = fs::metadata(path)
        .map_err(|source| DescriptorError::Io {
            path: shown.clone(),
            source,
        })?
        .len();
    if size > MAX_METAINFO_SIZE {
        return Err(DescriptorError::TooLarge { path: shown, size });
    }
    let bytes = fs::read(path).map_err(|source| DescriptorError::Io {
        path: shown.clone(),
        source,
    })?;
    if bytes.first() != Some(&b'd') {
        return Err(DescriptorError::NotMetainfo(shown));
    }
    Ok(JobSource::Metainfo {
        bytes,
        origin: path.to_path_buf(),
    })
}

fn is_candidate(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    let hidden = path
        .file_name()
        .and_then(|name| name.to_str())
        .map_or(true, |name| name.starts_with('.'));
    if hidden {
        return false;
    }
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("torrent" | "magnet")
    )
}

#[derive(Debug)]
pub struct DirectoryMonitor {
    dir: PathBuf,
    interval: Duration,
    next_scan: Option<Instant>,
    list_failed: bool,
}

impl DirectoryMonitor {
    pub fn new(dir: PathBuf, interval: Duration) -> Self {
        Self {
            dir,
            interval,
            next_scan: Some(Instant::now()),
            list_failed: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn due(&self, now: Instant) -> bool {
        self.next_scan.map_or(false, |at| now >= at)
    }

    pub fn scan(&self) -> io::Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| is_candidate(path))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Scans once the interval has elapsed and submits every description found.
    /// Submitted files are deleted. Returns the lines to log.
    pub fn poll<F>(&mut self, now: Instant, mut submit: F) -> Vec<String>
    where
        F: FnMut(JobSource) -> Result<(), EngineError>,
    {
        if !self.due(now) {
            return Vec::new();
        }
        self.next_scan = now.checked_add(self.interval);
        let files = match self.scan() {
            Ok(files) => {
                self.list_failed = false;
                files
            }
            Err(err) => {
                if self.list_failed {
                    return Vec::new();
                }
                self.list_failed = true;
                let message = format!("failed to list {}: {err}", self.dir.display());
                warn!("{message}");
                return vec![message];
            }
        };
        let mut messages = Vec::new();
        for path in files {
            let outcome = parse_descriptor(&path)
                .map_err(|err| err.to_string())
                .and_then(|source| submit(source).map_err(|err| err.to_string()));
            match outcome {
                Ok(()) => {
                    info!("submitted {}", path.display());
                    if let Err(err) = fs::remove_file(&path) {
                        messages.push(format!("failed to remove {}: {err}", path.display()));
                    }
                }
                Err(err) => {
                    warn!("{err}");
                    messages.push(err);
                }
            }
        }
        messages
    }
}
