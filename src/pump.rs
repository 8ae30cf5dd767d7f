use std::net::SocketAddr;

use log::warn;

use crate::{
    engine::{
        Commander, DisconnectReason, EngineEvent, JobCommand, PeerOperation, SaveFailure,
        Severity,
    },
    model::JobId,
    recovery::{resume_file, write_recovery, SaveOutcome},
    view::ConsoleState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Stats,
    Lookup,
    PeerSuppressed,
    SaveRequested,
    AddFailed,
    CapAndSave,
    SaveResult,
    JobList,
    Logged,
}

pub fn pump(events: Vec<EngineEvent>, state: &mut ConsoleState, commander: &Commander) {
    for event in events {
        handle(event, state, commander);
    }
}

/// Consumes one event, following a fixed precedence. Earlier rules win.
pub fn handle(event: EngineEvent, state: &mut ConsoleState, commander: &Commander) -> Disposition {
    let disposition = classify(&event);
    match event {
        EngineEvent::Stats(stats) => state.stats = stats,
        EngineEvent::LookupDiagnostics {
            routing_table,
            active_lookups,
        } => {
            state.lookup.routing_table = routing_table;
            state.lookup.active_lookups = active_lookups;
        }
        EngineEvent::PeerConnected { .. } => {}
        ref event @ EngineEvent::PeerDisconnected { .. } => {
            if disposition == Disposition::Logged {
                state.push_log(event.severity(), event.message());
            }
        }
        EngineEvent::MetadataReceived { job, .. } => {
            request_save(state, commander, &job, false);
        }
        EngineEvent::JobAdded {
            result: Ok(job), ..
        } => {
            request_save(state, commander, &job, true);
            if let Some(peer) = state.peer {
                connect_peer(commander, &job, peer);
            }
        }
        ref event @ EngineEvent::JobAdded { result: Err(_), .. } => {
            state.push_log(event.severity(), event.message());
        }
        EngineEvent::JobFinished { job, .. } => {
            let cap = state.max_connections / 2;
            if commander
                .job(&job, JobCommand::SetMaxConnections(cap))
                .is_err()
            {
                warn!("engine gone; cannot lower connection cap for {job}");
            }
            request_save(state, commander, &job, false);
        }
        EngineEvent::RecoverySaved { job, blob } => {
            state.recovery.on_result(SaveOutcome::Saved);
            let path = resume_file(&state.save_path, &job);
            if let Err(err) = write_recovery(&path, &blob) {
                state.push_log(Severity::Error, format!("{err:#}"));
            }
        }
        ref event @ EngineEvent::RecoverySaveFailed { ref reason, .. } => {
            state.recovery.on_result(SaveOutcome::Failed);
            if *reason != SaveFailure::NotModified {
                state.push_log(event.severity(), event.message());
            }
        }
        EngineEvent::JobPaused { job, .. } => {
            request_save(state, commander, &job, false);
        }
        EngineEvent::JobList(jobs) => state.jobs.replace(jobs),
        ref event @ (EngineEvent::JobRemoved { .. }
        | EngineEvent::TrackerError { .. }
        | EngineEvent::Generic { .. }) => {
            state.push_log(event.severity(), event.message());
        }
    }
    disposition
}

pub fn classify(event: &EngineEvent) -> Disposition {
    match event {
        EngineEvent::Stats(_) => Disposition::Stats,
        EngineEvent::LookupDiagnostics { .. } => Disposition::Lookup,
        EngineEvent::PeerConnected { .. } => Disposition::PeerSuppressed,
        EngineEvent::PeerDisconnected {
            operation, reason, ..
        } => {
            if *reason == DisconnectReason::TimedOutNoHandshake
                || *operation == PeerOperation::Connect
            {
                Disposition::PeerSuppressed
            } else {
                Disposition::Logged
            }
        }
        EngineEvent::MetadataReceived { .. } | EngineEvent::JobAdded { result: Ok(_), .. } => {
            Disposition::SaveRequested
        }
        EngineEvent::JobAdded { result: Err(_), .. } => Disposition::AddFailed,
        EngineEvent::JobFinished { .. } => Disposition::CapAndSave,
        EngineEvent::RecoverySaved { .. } | EngineEvent::RecoverySaveFailed { .. } => {
            Disposition::SaveResult
        }
        EngineEvent::JobPaused { .. } => Disposition::SaveRequested,
        EngineEvent::JobList(_) => Disposition::JobList,
        EngineEvent::JobRemoved { .. }
        | EngineEvent::TrackerError { .. }
        | EngineEvent::Generic { .. } => Disposition::Logged,
    }
}

/// Submits a recovery save. The counter only moves when the engine took the command.
pub fn request_save(
    state: &mut ConsoleState,
    commander: &Commander,
    job: &JobId,
    only_if_modified: bool,
) -> bool {
    let submitted = commander
        .job(job, JobCommand::SaveRecoveryState { only_if_modified })
        .is_ok();
    if submitted {
        state.recovery.request_save();
    } else {
        warn!("engine gone; recovery state for {job} not requested");
    }
    submitted
}

fn connect_peer(commander: &Commander, job: &JobId, peer: SocketAddr) {
    if commander.job(job, JobCommand::ConnectPeer(peer)).is_err() {
        warn!("engine gone; cannot connect {peer} to {job}");
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use proptest::prelude::*;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        engine::EngineCommand,
        model::{JobState, SessionStatsView},
        recovery::read_recovery,
        view::tests::job,
    };

    fn state(save_path: PathBuf) -> ConsoleState {
        ConsoleState::new(save_path, 50)
    }

    fn id(value: &str) -> JobId {
        JobId::new(value)
    }

    #[test]
    fn saves_then_results_drain_counter_and_log_failures_once() {
        let dir = tempdir().unwrap();
        let mut state = state(dir.path().to_path_buf());
        let (commander, rx) = Commander::channel();
        for name in ["aa", "bb", "cc"] {
            request_save(&mut state, &commander, &id(name), false);
        }
        assert_eq!(state.recovery.outstanding(), 3);
        assert_eq!(rx.try_iter().count(), 3);

        pump(
            vec![
                EngineEvent::RecoverySaved { job: id("aa"), blob: b"one".to_vec() },
                EngineEvent::RecoverySaved { job: id("bb"), blob: b"two".to_vec() },
                EngineEvent::RecoverySaveFailed {
                    job: id("cc"),
                    reason: SaveFailure::Other("disk full".to_string()),
                },
            ],
            &mut state,
            &commander,
        );
        assert!(state.recovery.is_drained());
        assert_eq!(state.log.len(), 1);
        assert_eq!(
            read_recovery(&resume_file(dir.path(), &id("bb"))).unwrap(),
            b"two"
        );
    }

    #[test]
    fn not_modified_failure_is_silent() {
        let mut state = state(PathBuf::from("/nonexistent"));
        let (commander, _rx) = Commander::channel();
        request_save(&mut state, &commander, &id("aa"), true);
        let disposition = handle(
            EngineEvent::RecoverySaveFailed { job: id("aa"), reason: SaveFailure::NotModified },
            &mut state,
            &commander,
        );
        assert_eq!(disposition, Disposition::SaveResult);
        assert!(state.log.is_empty());
        assert!(state.recovery.is_drained());
    }

    #[test]
    fn finished_job_halves_cap_then_saves() {
        let mut state = state(PathBuf::from("/tmp"));
        let (commander, rx) = Commander::channel();
        handle(
            EngineEvent::JobFinished { job: id("aa"), name: "a".into() },
            &mut state,
            &commander,
        );
        let commands: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            commands,
            vec![
                EngineCommand::Job { job: id("aa"), command: JobCommand::SetMaxConnections(25) },
                EngineCommand::Job {
                    job: id("aa"),
                    command: JobCommand::SaveRecoveryState { only_if_modified: false },
                },
            ]
        );
        assert_eq!(state.recovery.outstanding(), 1);
    }

    #[test]
    fn only_added_jobs_save_if_modified() {
        let mut state = state(PathBuf::from("/tmp"));
        let (commander, rx) = Commander::channel();
        let events = vec![
            EngineEvent::JobAdded { name: "a".into(), result: Ok(id("aa")) },
            EngineEvent::MetadataReceived { job: id("aa"), name: "a".into() },
            EngineEvent::JobPaused { job: id("aa"), name: "a".into() },
        ];
        pump(events, &mut state, &commander);
        let modes: Vec<bool> = rx
            .try_iter()
            .filter_map(|command| match command {
                EngineCommand::Job {
                    command: JobCommand::SaveRecoveryState { only_if_modified },
                    ..
                } => Some(only_if_modified),
                _ => None,
            })
            .collect();
        assert_eq!(modes, vec![true, false, false]);
        assert_eq!(state.recovery.outstanding(), 3);
    }

    #[test]
    fn successful_add_connects_configured_peer() {
        let mut state = state(PathBuf::from("/tmp"));
        state.peer = Some("10.0.0.9:6881".parse().unwrap());
        let (commander, rx) = Commander::channel();
        handle(
            EngineEvent::JobAdded { name: "a".into(), result: Ok(id("aa")) },
            &mut state,
            &commander,
        );
        let commands: Vec<_> = rx.try_iter().collect();
        assert_eq!(commands.len(), 2);
        assert!(matches!(
            commands[1],
            EngineCommand::Job { command: JobCommand::ConnectPeer(_), .. }
        ));

        let disposition = handle(
            EngineEvent::JobAdded { name: "b".into(), result: Err("bad".into()) },
            &mut state,
            &commander,
        );
        assert_eq!(disposition, Disposition::AddFailed);
        assert_eq!(state.log.len(), 1);
        assert_eq!(state.recovery.outstanding(), 1);
    }

    #[test]
    fn closed_engine_does_not_count_saves() {
        let mut state = state(PathBuf::from("/tmp"));
        let (commander, rx) = Commander::channel();
        drop(rx);
        handle(
            EngineEvent::JobPaused { job: id("aa"), name: "a".into() },
            &mut state,
            &commander,
        );
        assert!(state.recovery.is_drained());
    }

    #[test]
    fn peer_disconnects_are_filtered() {
        let mut state = state(PathBuf::from("/tmp"));
        let (commander, _rx) = Commander::channel();
        let quiet = EngineEvent::PeerDisconnected {
            job: id("aa"),
            address: "1.2.3.4:5".into(),
            operation: PeerOperation::Transfer,
            reason: DisconnectReason::TimedOutNoHandshake,
        };
        let connect = EngineEvent::PeerDisconnected {
            job: id("aa"),
            address: "1.2.3.4:5".into(),
            operation: PeerOperation::Connect,
            reason: DisconnectReason::Closed,
        };
        let loud = EngineEvent::PeerDisconnected {
            job: id("aa"),
            address: "1.2.3.4:5".into(),
            operation: PeerOperation::Transfer,
            reason: DisconnectReason::Closed,
        };
        pump(vec![quiet, connect], &mut state, &commander);
        assert!(state.log.is_empty());
        pump(vec![loud], &mut state, &commander);
        assert_eq!(state.log.len(), 1);
        assert_eq!(state.log.iter().next().unwrap().severity, Severity::Warning);
    }

    #[test]
    fn snapshots_replace_view_state() {
        let mut state = state(PathBuf::from("/tmp"));
        let (commander, _rx) = Commander::channel();
        pump(
            vec![
                EngineEvent::Stats(SessionStatsView { download_rate: 7, ..Default::default() }),
                EngineEvent::JobList(vec![
                    job("aa", JobState::Downloading),
                    job("bb", JobState::Seeding),
                ]),
                EngineEvent::JobList(vec![job("aa", JobState::Downloading)]),
            ],
            &mut state,
            &commander,
        );
        assert_eq!(state.stats.download_rate, 7);
        let ids: Vec<_> = state.jobs.jobs().iter().map(|job| job.id.as_str()).collect();
        assert_eq!(ids, vec!["aa"]);
        assert!(state.log.is_empty());
    }

    fn any_event() -> impl Strategy<Value = EngineEvent> {
        let job = "[a-f0-9]{4}".prop_map(JobId::new);
        prop_oneof![
            Just(EngineEvent::Stats(SessionStatsView::default())),
            job.clone().prop_map(|job| EngineEvent::PeerConnected { job, address: "a".into() }),
            (job.clone(), any::<bool>(), any::<bool>()).prop_map(|(job, connect, timeout)| {
                EngineEvent::PeerDisconnected {
                    job,
                    address: "a".into(),
                    operation: if connect { PeerOperation::Connect } else { PeerOperation::Other },
                    reason: if timeout {
                        DisconnectReason::TimedOutNoHandshake
                    } else {
                        DisconnectReason::Closed
                    },
                }
            }),
            job.clone().prop_map(|job| EngineEvent::MetadataReceived { job, name: "n".into() }),
            job.clone().prop_map(|job| EngineEvent::JobFinished { job, name: "n".into() }),
            job.clone().prop_map(|job| EngineEvent::JobPaused { job, name: "n".into() }),
            job.clone().prop_map(|job| EngineEvent::RecoverySaveFailed {
                job,
                reason: SaveFailure::NotModified,
            }),
            job.clone().prop_map(|job| EngineEvent::TrackerError {
                job,
                url: "u".into(),
                message: "m".into(),
            }),
            "[a-z ]{0,12}".prop_map(|message| EngineEvent::Generic {
                severity: Severity::Info,
                message,
            }),
        ]
    }

    proptest! {
        #[test]
        fn classification_is_deterministic(event in any_event()) {
            let mut first = state(PathBuf::from("/tmp"));
            let mut second = state(PathBuf::from("/tmp"));
            let (commander, rx) = Commander::channel();
            let a = handle(event.clone(), &mut first, &commander);
            let sent_a: Vec<_> = rx.try_iter().collect();
            let b = handle(event.clone(), &mut second, &commander);
            let sent_b: Vec<_> = rx.try_iter().collect();
            prop_assert_eq!(a, b);
            prop_assert_eq!(a, classify(&event));
            prop_assert_eq!(sent_a, sent_b);
            prop_assert_eq!(first.log.len(), second.log.len());
            prop_assert_eq!(first.recovery.outstanding(), second.recovery.outstanding());
        }

        #[test]
        fn log_ring_never_exceeds_capacity(events in proptest::collection::vec(any_event(), 0..80)) {
            let mut state = state(PathBuf::from("/tmp"));
            let (commander, _rx) = Commander::channel();
            pump(events, &mut state, &commander);
            prop_assert!(state.log.len() <= crate::view::LOG_CAPACITY);
        }
    }
}
