use std::{
    fs, io,
    path::{Path, PathBuf},
    thread::{self, JoinHandle},
};

use anyhow::{Context, Result};
use log::{error, info, warn};

use crate::{
    engine::{AddJobParams, Commander, EngineCommand, JobSource},
    model::JobId,
};

pub const RESUME_DIR: &str = ".resume";
pub const RESUME_EXTENSION: &str = "resume";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    Failed,
}

#[derive(Debug, Default)]
pub struct RecoveryTracker {
    outstanding: usize,
}

impl RecoveryTracker {
    pub fn request_save(&mut self) -> usize {
        self.outstanding += 1;
        self.outstanding
    }

    /// Records a save result. Failed saves are never retried.
    pub fn on_result(&mut self, outcome: SaveOutcome) -> usize {
        match self.outstanding.checked_sub(1) {
            Some(next) => self.outstanding = next,
            None => error!("recovery save result {outcome:?} arrived with no save outstanding"),
        }
        self.outstanding
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn is_drained(&self) -> bool {
        self.outstanding == 0
    }
}

pub fn resume_dir(save_path: &Path) -> PathBuf {
    save_path.join(RESUME_DIR)
}

pub fn resume_file(save_path: &Path, job: &JobId) -> PathBuf {
    resume_dir(save_path).join(format!("{}.{RESUME_EXTENSION}", job.as_str()))
}

/// Writes `blob` next to `path` first and renames it into place.
pub fn write_recovery(path: &Path, blob: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, blob).with_context(|| format!("failed to write {}", tmp.display()))?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err).with_context(|| format!("failed to replace {}", path.display()));
    }
    Ok(())
}

pub fn read_recovery(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

pub fn remove_recovery(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

pub fn recovery_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext == RESUME_EXTENSION)
        })
        .collect();
    files.sort();
    Ok(files)
}

pub fn recovery_for_magnet(save_path: &Path, uri: &str) -> Option<Vec<u8>> {
    let job = magnet_info_hash(uri)?;
    let path = resume_file(save_path, &job);
    if !path.is_file() {
        return None;
    }
    match read_recovery(&path) {
        Ok(blob) => Some(blob),
        Err(err) => {
            warn!("{err:#}");
            None
        }
    }
}

pub fn magnet_info_hash(uri: &str) -> Option<JobId> {
    let query = uri.strip_prefix("magnet:?")?;
    query.split('&').find_map(|pair| {
        let hash = pair.strip_prefix("xt=urn:btih:")?;
        (hash.len() == 40 && hash.chars().all(|c| c.is_ascii_hexdigit()))
            .then(|| JobId::new(hash))
    })
}

/// Submits an add for every recovery file in `dir` from a background thread.
/// The handle yields the number of jobs submitted.
pub fn spawn_loader(
    dir: PathBuf,
    commander: Commander,
    template: AddJobParams,
) -> io::Result<JoinHandle<usize>> {
    thread::Builder::new()
        .name("recovery-loader".to_string())
        .spawn(move || load_all(&dir, &commander, &template))
}

pub fn load_all(dir: &Path, commander: &Commander, template: &AddJobParams) -> usize {
    let files = match recovery_files(dir) {
        Ok(files) => files,
        Err(err) => {
            info!("no recovery state loaded: {err:#}");
            return 0;
        }
    };
    let mut submitted = 0;
    for path in files {
        let blob = match read_recovery(&path) {
            Ok(blob) => blob,
            Err(err) => {
                warn!("{err:#}");
                continue;
            }
        };
        let params = AddJobParams {
            source: JobSource::RecoveryState(blob.clone()),
            recovery: Some(blob),
            needs_save: false,
            ..template.clone()
        };
        if commander
            .submit(EngineCommand::AddJob(Box::new(params)))
            .is_err()
        {
            warn!("engine stopped while loading recovery state");
            break;
        }
        submitted += 1;
    }
    info!("submitted {submitted} jobs from {}", dir.display());
    submitted
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tempfile::tempdir;

    use super::*;

    fn template(save_path: &Path) -> AddJobParams {
        AddJobParams {
            source: JobSource::Magnet(String::new()),
            recovery: None,
            save_path: save_path.to_path_buf(),
            max_connections: 50,
            upload_limit: 0,
            download_limit: 0,
            needs_save: true,
        }
    }

    #[test]
    fn three_requests_drain_after_three_results() {
        let mut tracker = RecoveryTracker::default();
        for _ in 0..3 {
            tracker.request_save();
        }
        assert_eq!(tracker.outstanding(), 3);
        tracker.on_result(SaveOutcome::Saved);
        tracker.on_result(SaveOutcome::Saved);
        tracker.on_result(SaveOutcome::Failed);
        assert!(tracker.is_drained());
    }

    #[test]
    fn unmatched_result_keeps_count_at_zero() {
        let mut tracker = RecoveryTracker::default();
        assert_eq!(tracker.on_result(SaveOutcome::Saved), 0);
        assert!(tracker.is_drained());
    }

    #[test]
    fn writes_atomically_and_reads_back() {
        let dir = tempdir().unwrap();
        let job = JobId::new("AB".repeat(20));
        let path = resume_file(dir.path(), &job);
        write_recovery(&path, b"first").unwrap();
        write_recovery(&path, b"second").unwrap();
        assert_eq!(read_recovery(&path).unwrap(), b"second");
        let names: Vec<_> = fs::read_dir(resume_dir(dir.path()))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
        remove_recovery(&path).unwrap();
        remove_recovery(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn loader_submits_one_add_per_file() {
        let dir = tempdir().unwrap();
        let resume = resume_dir(dir.path());
        fs::create_dir_all(&resume).unwrap();
        fs::write(resume.join("a.resume"), b"{}").unwrap();
        fs::write(resume.join("b.resume"), b"{}").unwrap();
        fs::write(resume.join("notes.txt"), b"skip").unwrap();

        let (commander, rx) = Commander::channel();
        let handle = spawn_loader(resume, commander, template(dir.path())).unwrap();
        assert_eq!(handle.join().unwrap(), 2);

        let commands: Vec<_> = rx.try_iter().collect();
        assert_eq!(commands.len(), 2);
        for command in commands {
            let EngineCommand::AddJob(params) = command else {
                panic!("unexpected command");
            };
            assert!(!params.needs_save);
            assert_eq!(params.recovery.as_deref(), Some(&b"{}"[..]));
        }
    }

    #[test]
    fn loader_tolerates_missing_directory() {
        let dir = tempdir().unwrap();
        let (commander, _rx) = Commander::channel();
        assert_eq!(
            load_all(&dir.path().join("absent"), &commander, &template(dir.path())),
            0
        );
    }

    #[test]
    fn finds_recovery_for_magnet() {
        let dir = tempdir().unwrap();
        let hash = "0123456789ABCDEF0123456789ABCDEF01234567";
        let uri = format!("magnet:?xt=urn:btih:{hash}&dn=demo");
        assert_eq!(magnet_info_hash(&uri), Some(JobId::new(hash)));
        assert_eq!(recovery_for_magnet(dir.path(), &uri), None);
        write_recovery(&resume_file(dir.path(), &JobId::new(hash)), b"blob").unwrap();
        assert_eq!(recovery_for_magnet(dir.path(), &uri), Some(b"blob".to_vec()));
        assert_eq!(magnet_info_hash("magnet:?dn=nohash"), None);
    }

    proptest! {
        #[test]
        fn counter_matches_requests_minus_results(ops in proptest::collection::vec(any::<bool>(), 0..200)) {
            let mut tracker = RecoveryTracker::default();
            let mut expected: usize = 0;
            for request in ops {
                if request {
                    tracker.request_save();
                    expected += 1;
                } else {
                    tracker.on_result(SaveOutcome::Saved);
                    expected = expected.saturating_sub(1);
                }
                prop_assert_eq!(tracker.outstanding(), expected);
            }
        }
    }
}
