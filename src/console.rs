use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use crossterm::event::{KeyCode, KeyEvent};
use log::{info, warn};
use ratatui::text::Line;

use crate::{
    config::{AppConfig, ConsoleConfig},
    daemon::{EngineOptions, TransmissionEngine},
    engine::{
        AddJobParams, Commander, Engine, EngineCommand, JobCommand, JobSource, Severity,
    },
    input::{action_for, is_interrupt, Action, Input},
    ipfilter::IpFilter,
    model::{JobDetail, JobId},
    monitor::{read_metainfo, DirectoryMonitor},
    pump::{self, pump},
    recovery::{recovery_for_magnet, remove_recovery, resume_dir, resume_file, spawn_loader},
    render::{render, Overlay, RenderInput},
    rpc::TransmissionClient,
    settings::SettingsPack,
    terminal::{read_input, TerminalGuard},
    view::ConsoleState,
};

/// Longest single wait for a notification while draining at exit.
const DRAIN_WAIT: Duration = Duration::from_secs(10);
/// Pieces given a deadline by the `o` key.
const DEADLINE_PIECES: u32 = 300;

pub fn run(config: AppConfig, settings: SettingsPack) -> Result<()> {
    let client = TransmissionClient::new(config.rpc.clone())
        .context("failed to construct Transmission RPC client")?;
    let options = EngineOptions {
        poll_interval: config.console.poll_interval,
    };
    let mut engine = TransmissionEngine::start(client, options)?;
    let commander = engine.commander();

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
        .context("failed to install signal handler")?;

    let mut console = Console::from_config(&config.console);
    console.startup(&config.console, settings, &commander)?;

    let loader = spawn_loader(
        resume_dir(&config.console.save_path),
        commander.clone(),
        console.template.clone(),
    )
    .context("failed to spawn recovery loader")?;

    let loop_result = {
        let mut terminal = TerminalGuard::enter()?;
        console.run_loop(&engine, &mut terminal, &interrupted)
    };

    match loader.join() {
        Ok(count) => info!("recovery loader submitted {count} jobs"),
        Err(_) => warn!("recovery loader panicked"),
    }

    println!("saving recovery state...");
    let outstanding = console.shutdown_drain(&engine, config.console.shutdown_timeout);
    if outstanding > 0 {
        println!("gave up waiting for {outstanding} recovery saves");
        warn!("exiting with {outstanding} recovery saves outstanding");
    }
    engine.shutdown();

    loop_result
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum InputMode {
    Normal,
    Prompt { buffer: String },
    Confirm { job: JobId, question: String },
    Help,
}

enum PromptAction {
    None,
    Submit(String),
    Cancel,
}

enum ConfirmAction {
    None,
    Accept,
    Cancel,
}

pub struct Console {
    state: ConsoleState,
    mode: InputMode,
    quit: bool,
    session_paused: bool,
    tick: u64,
    refresh_delay: Duration,
    template: AddJobParams,
    monitor: Option<DirectoryMonitor>,
}

impl Console {
    pub fn new(state: ConsoleState, template: AddJobParams, refresh_delay: Duration) -> Self {
        Self {
            state,
            mode: InputMode::Normal,
            quit: false,
            session_paused: false,
            tick: 0,
            refresh_delay,
            template,
            monitor: None,
        }
    }

    fn from_config(config: &ConsoleConfig) -> Self {
        let mut state = ConsoleState::new(config.save_path.clone(), config.max_connections);
        state.peer = config.peer;
        let template = AddJobParams {
            source: JobSource::Magnet(String::new()),
            recovery: None,
            save_path: config.save_path.clone(),
            max_connections: config.max_connections,
            upload_limit: config.upload_limit,
            download_limit: config.download_limit,
            needs_save: true,
        };
        let mut console = Self::new(state, template, config.refresh_delay);
        console.monitor = config
            .monitor_dir
            .clone()
            .map(|dir| DirectoryMonitor::new(dir, config.monitor_interval));
        console
    }

    pub fn should_quit(&self) -> bool {
        self.quit
    }

    fn startup(
        &mut self,
        config: &ConsoleConfig,
        mut settings: SettingsPack,
        commander: &Commander,
    ) -> Result<()> {
        if let Some(mode) = config.allocation {
            info!("allocation mode: {}", mode.label());
            settings.set_allocation(mode);
        }
        if !settings.is_empty() {
            info!("applying {} engine settings", settings.len());
            commander.submit(EngineCommand::ApplySettings(settings.to_rpc_map()))?;
        }
        if config.disable_disk_io {
            self.state.push_log(
                Severity::Warning,
                "disabled disk I/O is not supported by the daemon; ignoring -0",
            );
        }
        if let Some(path) = &config.ip_filter {
            match IpFilter::load(path) {
                Ok(filter) => {
                    self.state.push_log(
                        Severity::Info,
                        format!("loaded ip filter with {} blocked ranges", filter.blocked_ranges()),
                    );
                    commander.submit(EngineCommand::SetIpFilter(filter))?;
                }
                Err(err) => self.state.push_log(Severity::Error, format!("{err:#}")),
            }
        }
        let dir = resume_dir(&config.save_path);
        if let Err(err) = std::fs::create_dir_all(&dir) {
            self.state.push_log(
                Severity::Error,
                format!("failed to create {}: {err}", dir.display()),
            );
        }
        for job in &config.jobs {
            self.add_from_argument(job, commander);
        }
        if let Some(monitor) = &self.monitor {
            info!("monitoring {}", monitor.dir().display());
        }
        Ok(())
    }

    fn add_from_argument(&mut self, arg: &str, commander: &Commander) {
        let params = if arg.starts_with("magnet:") {
            self.magnet_params(arg)
        } else {
            match read_metainfo(Path::new(arg)) {
                Ok(source) => AddJobParams {
                    source,
                    ..self.template.clone()
                },
                Err(err) => {
                    self.state.push_log(Severity::Error, err.to_string());
                    return;
                }
            }
        };
        self.submit_add(params, commander);
    }

    fn magnet_params(&self, uri: &str) -> AddJobParams {
        AddJobParams {
            source: JobSource::Magnet(uri.to_string()),
            recovery: recovery_for_magnet(&self.state.save_path, uri),
            ..self.template.clone()
        }
    }

    fn submit_add(&mut self, params: AddJobParams, commander: &Commander) {
        let label = params.source.label();
        if commander
            .submit(EngineCommand::AddJob(Box::new(params)))
            .is_err()
        {
            self.state
                .push_log(Severity::Error, format!("engine gone; cannot add {label}"));
        }
    }

    fn run_loop<E: Engine>(
        &mut self,
        engine: &E,
        terminal: &mut TerminalGuard,
        interrupted: &AtomicBool,
    ) -> Result<()> {
        loop {
            if interrupted.load(Ordering::Relaxed) {
                info!("termination signal received");
                self.quit = true;
            }
            if self.should_quit() {
                return Ok(());
            }
            self.tick(engine, terminal)?;
        }
    }

    fn tick<E: Engine>(&mut self, engine: &E, terminal: &mut TerminalGuard) -> Result<()> {
        let commander = engine.commander();
        post_snapshots(&commander)?;

        let (width, height) = terminal.size()?;
        self.state.jobs.set_height(height / 3);

        if let Some(input) = read_input(self.refresh_delay)? {
            self.dispatch(input, &commander);
            while !self.quit {
                match read_input(Duration::ZERO)? {
                    Some(input) => self.dispatch(input, &commander),
                    None => break,
                }
            }
        }

        pump(engine.pop_events(), &mut self.state, &commander);
        let detail = self.pull_detail(engine);
        terminal.draw(self.frame(&detail, width, height))?;
        self.tick = self.tick.wrapping_add(1);

        self.poll_monitor(&commander, Instant::now());
        Ok(())
    }

    pub fn pull_detail<E: Engine>(&self, engine: &E) -> JobDetail {
        let Some(job) = self.state.jobs.active() else {
            return JobDetail::default();
        };
        let flags = self.state.flags;
        JobDetail {
            peers: if flags.peers { engine.peers(&job.id) } else { Vec::new() },
            files: if flags.files { engine.files(&job.id) } else { Vec::new() },
            trackers: if flags.trackers {
                engine.trackers(&job.id)
            } else {
                Vec::new()
            },
            queue: if flags.piece_queue {
                engine.piece_queue(&job.id)
            } else {
                Vec::new()
            },
        }
    }

    pub fn frame(&self, detail: &JobDetail, width: u16, height: u16) -> Vec<Line<'static>> {
        let input = RenderInput {
            state: &self.state,
            detail,
            overlay: self.overlay(),
            tick: self.tick,
        };
        render(&input, width, height)
    }

    fn overlay(&self) -> Overlay<'_> {
        match &self.mode {
            InputMode::Normal => Overlay::None,
            InputMode::Prompt { buffer } => Overlay::Prompt {
                label: "magnet link",
                buffer,
            },
            InputMode::Confirm { question, .. } => Overlay::Confirm(question),
            InputMode::Help => Overlay::Help,
        }
    }

    fn poll_monitor(&mut self, commander: &Commander, now: Instant) {
        let Some(monitor) = self.monitor.as_mut() else {
            return;
        };
        let template = &self.template;
        let messages = monitor.poll(now, |source| {
            commander.submit(EngineCommand::AddJob(Box::new(AddJobParams {
                source,
                ..template.clone()
            })))
        });
        for message in messages {
            self.state.push_log(Severity::Error, message);
        }
    }

    pub fn dispatch(&mut self, input: Input, commander: &Commander) {
        match input {
            Input::Key(key) => self.handle_key(key, commander),
            Input::Paste(text) => self.handle_paste(text),
        }
    }

    fn handle_paste(&mut self, text: String) {
        match &mut self.mode {
            InputMode::Prompt { buffer } => buffer.push_str(text.trim()),
            InputMode::Normal => {
                self.mode = InputMode::Prompt {
                    buffer: text.trim().to_string(),
                }
            }
            _ => {}
        }
    }

    fn handle_key(&mut self, key: KeyEvent, commander: &Commander) {
        if is_interrupt(&key) {
            self.quit = true;
            return;
        }
        if self.mode == InputMode::Normal {
            if let Some(action) = action_for(&key) {
                self.apply(action, commander);
            }
            return;
        }
        match &mut self.mode {
            InputMode::Normal => {}
            InputMode::Prompt { buffer } => {
                let mut action = PromptAction::None;
                match key.code {
                    KeyCode::Enter => {
                        let value = buffer.trim().to_string();
                        action = if value.is_empty() {
                            PromptAction::Cancel
                        } else {
                            PromptAction::Submit(value)
                        };
                    }
                    KeyCode::Esc => action = PromptAction::Cancel,
                    KeyCode::Backspace => {
                        buffer.pop();
                    }
                    KeyCode::Char(c) => buffer.push(c),
                    _ => {}
                }
                match action {
                    PromptAction::Submit(value) => {
                        self.mode = InputMode::Normal;
                        self.submit_magnet(&value, commander);
                    }
                    PromptAction::Cancel => self.mode = InputMode::Normal,
                    PromptAction::None => {}
                }
            }
            InputMode::Confirm { job, .. } => {
                let job = job.clone();
                let action = match key.code {
                    KeyCode::Char('y') | KeyCode::Enter => ConfirmAction::Accept,
                    KeyCode::Char('n') | KeyCode::Esc => ConfirmAction::Cancel,
                    _ => ConfirmAction::None,
                };
                match action {
                    ConfirmAction::Accept => {
                        self.mode = InputMode::Normal;
                        self.delete_job(&job, commander);
                    }
                    ConfirmAction::Cancel => self.mode = InputMode::Normal,
                    ConfirmAction::None => {}
                }
            }
            InputMode::Help => self.mode = InputMode::Normal,
        }
    }

    fn submit_magnet(&mut self, uri: &str, commander: &Commander) {
        if !uri.starts_with("magnet:") {
            self.state
                .push_log(Severity::Error, format!("not a magnet link: {uri}"));
            return;
        }
        let params = self.magnet_params(uri);
        self.submit_add(params, commander);
    }

    fn delete_job(&mut self, job: &JobId, commander: &Commander) {
        let path = resume_file(&self.state.save_path, job);
        if let Err(err) = remove_recovery(&path) {
            self.state.push_log(Severity::Error, format!("{err:#}"));
        }
        self.send(commander, job, JobCommand::Remove { delete_data: true });
    }

    fn apply(&mut self, action: Action, commander: &Commander) {
        match action {
            Action::Quit => self.quit = true,
            Action::PrevFilter => {
                self.state.jobs.prev_filter();
            }
            Action::NextFilter => {
                self.state.jobs.next_filter();
            }
            Action::CursorUp => self.state.jobs.arrow_up(),
            Action::CursorDown => self.state.jobs.arrow_down(),
            Action::ToggleSession => {
                let command = if self.session_paused {
                    EngineCommand::ResumeSession
                } else {
                    EngineCommand::PauseSession
                };
                if commander.submit(command).is_ok() {
                    self.session_paused = !self.session_paused;
                    let word = if self.session_paused { "paused" } else { "resumed" };
                    self.state.push_log(Severity::Info, format!("session {word}"));
                }
            }
            Action::PromptMagnet => {
                self.mode = InputMode::Prompt {
                    buffer: String::new(),
                }
            }
            Action::SaveAll => {
                let dirty: Vec<JobId> = self
                    .state
                    .jobs
                    .needing_save()
                    .map(|job| job.id.clone())
                    .collect();
                for job in &dirty {
                    pump::request_save(&mut self.state, commander, job, false);
                }
            }
            Action::Toggle(toggle) => self.state.flags.toggle(toggle),
            Action::Help => self.mode = InputMode::Help,
            job_action => self.apply_to_active(job_action, commander),
        }
    }

    fn apply_to_active(&mut self, action: Action, commander: &Commander) {
        let Some(job) = self.state.jobs.active() else {
            return;
        };
        let id = job.id.clone();
        let (paused, auto_managed, sequential) = (job.paused, job.auto_managed, job.sequential);
        match action {
            Action::TogglePause => {
                if paused && !auto_managed {
                    self.send(commander, &id, JobCommand::SetAutoManaged(true));
                } else {
                    self.send(commander, &id, JobCommand::SetAutoManaged(false));
                    self.send(commander, &id, JobCommand::Pause { graceful: true });
                }
            }
            Action::ToggleForceStart => {
                self.send(commander, &id, JobCommand::SetAutoManaged(!auto_managed));
                if paused && auto_managed {
                    self.send(commander, &id, JobCommand::Resume);
                }
            }
            Action::Recheck => self.send(commander, &id, JobCommand::Recheck),
            Action::Reannounce => self.send(commander, &id, JobCommand::Reannounce),
            Action::Scrape => self.send(commander, &id, JobCommand::Scrape),
            Action::ToggleSequential => {
                self.send(commander, &id, JobCommand::SetSequential(!sequential))
            }
            Action::ClearError => self.send(commander, &id, JobCommand::ClearError),
            Action::PieceDeadlines => self.send(
                commander,
                &id,
                JobCommand::SetPieceDeadlines {
                    pieces: DEADLINE_PIECES,
                },
            ),
            Action::DeleteJob => {
                let name = self
                    .state
                    .jobs
                    .get(&id)
                    .map(|job| job.name.clone())
                    .unwrap_or_default();
                self.mode = InputMode::Confirm {
                    job: id,
                    question: format!("delete \"{name}\" and its data? (y/n)"),
                };
            }
            _ => {}
        }
    }

    fn send(&mut self, commander: &Commander, job: &JobId, command: JobCommand) {
        let name = command.name();
        if commander.job(job, command).is_err() {
            self.state
                .push_log(Severity::Error, format!("engine gone; {name} not sent"));
        }
    }

    /// Saves every dirty job and waits for the results, at most `timeout` in total.
    /// Returns the number of saves still outstanding.
    pub fn shutdown_drain<E: Engine>(&mut self, engine: &E, timeout: Duration) -> usize {
        let commander = engine.commander();
        pump(engine.pop_events(), &mut self.state, &commander);

        let dirty: Vec<JobId> = self
            .state
            .jobs
            .jobs()
            .iter()
            .filter(|job| job.has_metadata && job.needs_save)
            .map(|job| job.id.clone())
            .collect();
        for job in &dirty {
            pump::request_save(&mut self.state, &commander, job, false);
        }

        // A timeout beyond the clock range means no deadline.
        let deadline = Instant::now().checked_add(timeout);
        while !self.state.recovery.is_drained() {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => DRAIN_WAIT,
            };
            if remaining.is_zero() {
                break;
            }
            info!(
                "waiting for {} recovery saves",
                self.state.recovery.outstanding()
            );
            if let Some(event) = engine.wait_for_event(remaining.min(DRAIN_WAIT)) {
                pump::handle(event, &mut self.state, &commander);
                pump(engine.pop_events(), &mut self.state, &commander);
            }
        }
        self.state.recovery.outstanding()
    }
}

fn post_snapshots(commander: &Commander) -> Result<()> {
    commander.submit(EngineCommand::PostJobList)?;
    commander.submit(EngineCommand::PostStats)?;
    commander.submit(EngineCommand::PostLookupDiagnostics)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, fs, path::PathBuf, sync::Mutex};

    use crossbeam_channel::Receiver;
    use crossterm::event::KeyModifiers;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        engine::EngineEvent,
        model::{FileView, JobState, PeerInfoView, PieceQueueView, TrackerView},
        recovery::{read_recovery, write_recovery},
        view::{tests::job, JobFilter},
    };

    const MAGNET: &str = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567";

    struct StubEngine {
        commander: Commander,
        events: Mutex<VecDeque<EngineEvent>>,
        replies: Mutex<VecDeque<EngineEvent>>,
        peers: Vec<PeerInfoView>,
        queries: Mutex<Vec<&'static str>>,
    }

    impl StubEngine {
        fn new(commander: Commander) -> Self {
            Self {
                commander,
                events: Mutex::new(VecDeque::new()),
                replies: Mutex::new(VecDeque::new()),
                peers: vec![PeerInfoView::default()],
                queries: Mutex::new(Vec::new()),
            }
        }

        fn reply(&self, event: EngineEvent) {
            self.replies.lock().unwrap().push_back(event);
        }

        fn record(&self, name: &'static str) {
            self.queries.lock().unwrap().push(name);
        }
    }

    impl Engine for StubEngine {
        fn commander(&self) -> Commander {
            self.commander.clone()
        }

        fn pop_events(&self) -> Vec<EngineEvent> {
            self.events.lock().unwrap().drain(..).collect()
        }

        fn wait_for_event(&self, _timeout: Duration) -> Option<EngineEvent> {
            self.replies.lock().unwrap().pop_front()
        }

        fn peers(&self, _job: &JobId) -> Vec<PeerInfoView> {
            self.record("peers");
            self.peers.clone()
        }

        fn files(&self, _job: &JobId) -> Vec<FileView> {
            self.record("files");
            Vec::new()
        }

        fn trackers(&self, _job: &JobId) -> Vec<TrackerView> {
            self.record("trackers");
            Vec::new()
        }

        fn piece_queue(&self, _job: &JobId) -> Vec<PieceQueueView> {
            self.record("piece_queue");
            Vec::new()
        }
    }

    fn console(save_path: PathBuf) -> Console {
        let template = AddJobParams {
            source: JobSource::Magnet(String::new()),
            recovery: None,
            save_path: save_path.clone(),
            max_connections: 50,
            upload_limit: 0,
            download_limit: 0,
            needs_save: true,
        };
        Console::new(
            ConsoleState::new(save_path, 50),
            template,
            Duration::from_millis(500),
        )
    }

    fn key(code: KeyCode) -> Input {
        Input::Key(KeyEvent::new(code, KeyModifiers::NONE))
    }

    fn char_key(c: char) -> Input {
        key(KeyCode::Char(c))
    }

    fn drain(rx: &Receiver<EngineCommand>) -> Vec<EngineCommand> {
        rx.try_iter().collect()
    }

    fn job_commands(rx: &Receiver<EngineCommand>) -> Vec<JobCommand> {
        drain(rx)
            .into_iter()
            .filter_map(|command| match command {
                EngineCommand::Job { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn right_arrow_advances_filter_until_last() {
        let (commander, _rx) = Commander::channel();
        let mut console = console(PathBuf::from("."));
        console.dispatch(key(KeyCode::Right), &commander);
        assert_eq!(console.state.jobs.filter(), 1);

        let last = JobFilter::ALL.len() - 1;
        console.state.jobs.set_filter(last);
        console.dispatch(key(KeyCode::Right), &commander);
        assert_eq!(console.state.jobs.filter(), last);
    }

    #[test]
    fn pause_key_depends_on_auto_management() {
        let (commander, rx) = Commander::channel();
        let mut console = console(PathBuf::from("."));

        let mut stopped = job("aa", JobState::Stopped);
        stopped.auto_managed = false;
        console.state.jobs.replace(vec![stopped]);
        console.dispatch(char_key('p'), &commander);
        assert_eq!(job_commands(&rx), vec![JobCommand::SetAutoManaged(true)]);

        console
            .state
            .jobs
            .replace(vec![job("aa", JobState::Downloading)]);
        console.dispatch(char_key('p'), &commander);
        assert_eq!(
            job_commands(&rx),
            vec![
                JobCommand::SetAutoManaged(false),
                JobCommand::Pause { graceful: true }
            ]
        );
    }

    #[test]
    fn force_start_resumes_paused_auto_managed_job() {
        let (commander, rx) = Commander::channel();
        let mut console = console(PathBuf::from("."));
        console.state.jobs.replace(vec![job("aa", JobState::Stopped)]);
        console.dispatch(char_key('k'), &commander);
        assert_eq!(
            job_commands(&rx),
            vec![JobCommand::SetAutoManaged(false), JobCommand::Resume]
        );
    }

    #[test]
    fn job_keys_without_selection_are_ignored() {
        let (commander, rx) = Commander::channel();
        let mut console = console(PathBuf::from("."));
        for c in ['p', 'k', 'j', 'r', 'v', 's', 'c', 'o', 'D'] {
            console.dispatch(char_key(c), &commander);
        }
        assert!(drain(&rx).is_empty());
        assert_eq!(console.overlay(), Overlay::None);
    }

    #[test]
    fn delete_requires_confirmation_and_drops_recovery_file() {
        let dir = tempdir().unwrap();
        let (commander, rx) = Commander::channel();
        let mut console = console(dir.path().to_path_buf());
        console
            .state
            .jobs
            .replace(vec![job("aa", JobState::Seeding)]);
        let path = resume_file(dir.path(), &JobId::new("aa"));
        write_recovery(&path, b"blob").unwrap();

        console.dispatch(char_key('D'), &commander);
        assert!(matches!(console.overlay(), Overlay::Confirm(_)));
        console.dispatch(char_key('n'), &commander);
        assert!(drain(&rx).is_empty());
        assert!(path.exists());

        console.dispatch(char_key('D'), &commander);
        console.dispatch(char_key('y'), &commander);
        assert_eq!(
            job_commands(&rx),
            vec![JobCommand::Remove { delete_data: true }]
        );
        assert!(!path.exists());
        assert_eq!(console.overlay(), Overlay::None);
    }

    #[test]
    fn magnet_prompt_attaches_saved_recovery_state() {
        let dir = tempdir().unwrap();
        let (commander, rx) = Commander::channel();
        let mut console = console(dir.path().to_path_buf());
        let hash = JobId::new("0123456789abcdef0123456789abcdef01234567");
        write_recovery(&resume_file(dir.path(), &hash), b"saved").unwrap();

        console.dispatch(char_key('m'), &commander);
        console.dispatch(Input::Paste(format!("{MAGNET}\n")), &commander);
        console.dispatch(key(KeyCode::Enter), &commander);

        let commands = drain(&rx);
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            EngineCommand::AddJob(params) => {
                assert_eq!(params.source, JobSource::Magnet(MAGNET.to_string()));
                assert_eq!(params.recovery.as_deref(), Some(&b"saved"[..]));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn prompt_rejects_non_magnet_text() {
        let (commander, rx) = Commander::channel();
        let mut console = console(PathBuf::from("."));
        console.dispatch(char_key('m'), &commander);
        for c in "hello".chars() {
            console.dispatch(char_key(c), &commander);
        }
        console.dispatch(key(KeyCode::Enter), &commander);
        assert!(drain(&rx).is_empty());
        assert_eq!(console.state.log.len(), 1);
    }

    #[test]
    fn save_all_requests_dirty_jobs_only() {
        let (commander, rx) = Commander::channel();
        let mut console = console(PathBuf::from("."));
        let mut dirty = job("aa", JobState::Downloading);
        dirty.needs_save = true;
        console
            .state
            .jobs
            .replace(vec![dirty, job("bb", JobState::Downloading)]);
        console.dispatch(char_key('R'), &commander);
        assert_eq!(
            job_commands(&rx),
            vec![JobCommand::SaveRecoveryState {
                only_if_modified: false
            }]
        );
        assert_eq!(console.state.recovery.outstanding(), 1);
    }

    #[test]
    fn help_closes_on_any_key_and_ctrl_c_always_quits() {
        let (commander, _rx) = Commander::channel();
        let mut console = console(PathBuf::from("."));
        console.dispatch(char_key('h'), &commander);
        assert_eq!(console.overlay(), Overlay::Help);
        console.dispatch(char_key('x'), &commander);
        assert_eq!(console.overlay(), Overlay::None);

        console.dispatch(char_key('m'), &commander);
        console.dispatch(
            Input::Key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            &commander,
        );
        assert!(console.should_quit());
    }

    #[test]
    fn session_toggle_alternates() {
        let (commander, rx) = Commander::channel();
        let mut console = console(PathBuf::from("."));
        console.dispatch(char_key(' '), &commander);
        console.dispatch(char_key(' '), &commander);
        assert_eq!(
            drain(&rx),
            vec![EngineCommand::PauseSession, EngineCommand::ResumeSession]
        );
    }

    #[test]
    fn details_are_pulled_only_for_enabled_sections() {
        let (commander, _rx) = Commander::channel();
        let engine = StubEngine::new(commander);
        let mut console = console(PathBuf::from("."));
        assert_eq!(console.pull_detail(&engine).peers.len(), 0);

        console
            .state
            .jobs
            .replace(vec![job("aa", JobState::Downloading)]);
        console.state.flags.peers = true;
        let detail = console.pull_detail(&engine);
        assert_eq!(detail.peers.len(), 1);
        assert_eq!(*engine.queries.lock().unwrap(), vec!["peers"]);
    }

    #[test]
    fn shutdown_drain_waits_for_every_save() {
        let dir = tempdir().unwrap();
        let (commander, rx) = Commander::channel();
        let engine = StubEngine::new(commander);
        let mut console = console(dir.path().to_path_buf());
        let mut dirty = job("aa", JobState::Seeding);
        dirty.needs_save = true;
        let mut no_metadata = job("bb", JobState::Downloading);
        no_metadata.needs_save = true;
        no_metadata.has_metadata = false;
        console.state.jobs.replace(vec![dirty, no_metadata]);

        engine.reply(EngineEvent::RecoverySaved {
            job: JobId::new("aa"),
            blob: b"state".to_vec(),
        });
        assert_eq!(console.shutdown_drain(&engine, Duration::from_secs(5)), 0);
        assert_eq!(job_commands(&rx).len(), 1);
        assert_eq!(
            read_recovery(&resume_file(dir.path(), &JobId::new("aa"))).unwrap(),
            b"state"
        );
    }

    #[test]
    fn shutdown_drain_gives_up_at_deadline() {
        let (commander, _rx) = Commander::channel();
        let engine = StubEngine::new(commander);
        let mut console = console(PathBuf::from("."));
        let mut dirty = job("aa", JobState::Seeding);
        dirty.needs_save = true;
        console.state.jobs.replace(vec![dirty]);
        assert_eq!(console.shutdown_drain(&engine, Duration::ZERO), 1);
    }

    #[test]
    fn shutdown_drain_accepts_an_unbounded_timeout() {
        let dir = tempdir().unwrap();
        let (commander, _rx) = Commander::channel();
        let engine = StubEngine::new(commander);
        let mut console = console(dir.path().to_path_buf());
        let mut dirty = job("aa", JobState::Seeding);
        dirty.needs_save = true;
        console.state.jobs.replace(vec![dirty]);

        engine.reply(EngineEvent::RecoverySaved {
            job: JobId::new("aa"),
            blob: b"state".to_vec(),
        });
        assert_eq!(console.shutdown_drain(&engine, Duration::MAX), 0);
    }

    #[test]
    fn monitor_submissions_use_the_template() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("x.magnet"), MAGNET).unwrap();
        let (commander, rx) = Commander::channel();
        let mut console = console(PathBuf::from("/srv"));
        console.monitor = Some(DirectoryMonitor::new(
            dir.path().to_path_buf(),
            Duration::from_secs(5),
        ));
        console.poll_monitor(&commander, Instant::now());
        match drain(&rx).as_slice() {
            [EngineCommand::AddJob(params)] => {
                assert_eq!(params.save_path, PathBuf::from("/srv"));
                assert!(params.needs_save);
            }
            other => panic!("unexpected commands {other:?}"),
        }
        assert!(!dir.path().join("x.magnet").exists());
    }
}
