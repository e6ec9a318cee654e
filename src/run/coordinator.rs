use crate::backup::backup_inputs;
use crate::registry::PluginDefinition;
use crate::run::engine::{EngineEvent, ExecutionEngine, RunHandle, RunOutcome, RunRequest};
use crate::schema::{env_overlay, ParameterValue, ParameterValues};
use crate::settings::Settings;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::info;

/// Lifecycle of a task's current run. Terminal values are transient:
/// the coordinator settles back to Idle once the terminal event has
/// been surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Recoverable refusals surfaced to the operator as warnings; none of
/// them mutate the coordinator's state.
#[derive(Debug, Error)]
pub enum StartRefused {
    #[error("a run is already in progress for this task")]
    AlreadyRunning,
    #[error("task '{0}' has no executable script")]
    NoScript(String),
    #[error("no input files were provided")]
    NoInputFiles,
    #[error("backup failed: {0}")]
    BackupFailed(String),
}

#[derive(Debug, Error)]
#[error("no run is in progress")]
pub struct NotRunning;

/// What the coordinator relays to the presentation layer: child output
/// verbatim and in order, coordinator notices, then the terminal result.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Line(String),
    Notice(String),
    Finished(RunOutcome),
}

/// Per-task controller binding schema values, discovered inputs and the
/// execution engine into one run at a time. Independent tasks get
/// independent coordinators and run concurrently without shared state.
pub struct TaskCoordinator {
    plugin: PluginDefinition,
    values: ParameterValues,
    interpreter: String,
    output_dir: PathBuf,
    backup_enabled: bool,
    backup_root: Option<PathBuf>,
    engine: ExecutionEngine,
    state: Arc<Mutex<RunState>>,
    active: Arc<Mutex<Option<RunHandle>>>,
    events_tx: Mutex<Option<UnboundedSender<RunEvent>>>,
}

impl TaskCoordinator {
    /// Build a coordinator for one discovered task, seeding parameter
    /// values from the schema defaults and resolving preferences from the
    /// injected settings service.
    pub fn new(plugin: PluginDefinition, settings: &Settings) -> Self {
        let values = plugin.schema().default_values();
        Self {
            values,
            interpreter: settings.interpreter.clone(),
            output_dir: settings.output_dir_for(&plugin.name),
            backup_enabled: settings.backup_enabled,
            backup_root: settings.backup_dir.clone(),
            engine: ExecutionEngine::new(),
            state: Arc::new(Mutex::new(RunState::Idle)),
            active: Arc::new(Mutex::new(None)),
            events_tx: Mutex::new(None),
            plugin,
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn plugin(&self) -> &PluginDefinition {
        &self.plugin
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    pub fn values(&self) -> &ParameterValues {
        &self.values
    }

    /// Direct operator input; values are never persisted automatically.
    pub fn set_value(&mut self, name: &str, value: ParameterValue) {
        self.values.insert(name.to_string(), value);
    }

    /// Start one run of this task.
    ///
    /// An empty input set is refused unless the caller confirms it with
    /// `allow_empty`. A request while a run is in progress is refused
    /// without touching state. With backups enabled, the archive is
    /// written before launch and a backup failure aborts the start.
    pub fn run(
        &self,
        input_files: Vec<PathBuf>,
        allow_empty: bool,
    ) -> Result<UnboundedReceiver<RunEvent>, StartRefused> {
        let script = self
            .plugin
            .script
            .clone()
            .ok_or_else(|| StartRefused::NoScript(self.plugin.name.clone()))?;
        if input_files.is_empty() && !allow_empty {
            return Err(StartRefused::NoInputFiles);
        }

        // The lock spans backup and launch so a second start request
        // cannot slip in between the check and the transition.
        let mut state = self.state.lock().unwrap();
        if *state == RunState::Running {
            return Err(StartRefused::AlreadyRunning);
        }

        let mut notices = Vec::new();
        if self.backup_enabled {
            let records = backup_inputs(
                &input_files,
                &self.plugin.name,
                &self.output_dir,
                self.backup_root.as_deref(),
            )
            .map_err(|e| StartRefused::BackupFailed(format!("{:#}", e)))?;
            for record in &records {
                notices.push(format!(
                    "Backed up: {} -> {}",
                    record.source.display(),
                    record.dest.display()
                ));
            }
        }

        let request = RunRequest {
            interpreter: self.interpreter.clone(),
            script,
            input_files,
            working_dir: self.plugin.dir.clone(),
            output_dir: self.output_dir.clone(),
            env_overlay: env_overlay(&self.values),
        };

        *state = RunState::Running;
        info!(task = %self.plugin.name, "starting run");

        let (handle, engine_rx) = self.engine.start(request);
        *self.active.lock().unwrap() = Some(handle);

        let (tx, rx) = mpsc::unbounded_channel();
        for notice in notices {
            let _ = tx.send(RunEvent::Notice(notice));
        }
        *self.events_tx.lock().unwrap() = Some(tx.clone());

        let state_slot = Arc::clone(&self.state);
        let active_slot = Arc::clone(&self.active);
        let task_name = self.plugin.name.clone();
        tokio::spawn(relay(engine_rx, tx, state_slot, active_slot, task_name));

        Ok(rx)
    }

    /// Operator cancellation; valid only while a run is in progress.
    /// The notice lands in the output log immediately; the engine's own
    /// Cancelled terminal remains authoritative for the state transition.
    pub fn cancel(&self) -> Result<(), NotRunning> {
        if !self.is_running() {
            return Err(NotRunning);
        }
        let handle = self.active.lock().unwrap().clone();
        let handle = handle.ok_or(NotRunning)?;

        if let Some(tx) = self.events_tx.lock().unwrap().as_ref() {
            let _ = tx.send(RunEvent::Notice("Run stopped by operator".to_string()));
        }
        handle.stop();
        Ok(())
    }
}

/// Forward engine events verbatim and in order; on the terminal event,
/// record the matching terminal state, surface the result, then settle
/// back to Idle. Keeps draining even if the consumer went away, so the
/// state machine always resets.
async fn relay(
    mut engine_rx: UnboundedReceiver<EngineEvent>,
    tx: UnboundedSender<RunEvent>,
    state: Arc<Mutex<RunState>>,
    active: Arc<Mutex<Option<RunHandle>>>,
    task_name: String,
) {
    while let Some(event) = engine_rx.recv().await {
        match event {
            EngineEvent::Line(line) => {
                let _ = tx.send(RunEvent::Line(line));
            }
            EngineEvent::Terminated(outcome) => {
                *state.lock().unwrap() = match outcome {
                    RunOutcome::Success => RunState::Succeeded,
                    RunOutcome::Failed { .. } => RunState::Failed,
                    RunOutcome::Cancelled => RunState::Cancelled,
                };
                info!(task = %task_name, "run finished: {}", outcome.message());
                *active.lock().unwrap() = None;
                // Settle before surfacing, so a consumer reacting to the
                // terminal event already sees an idle coordinator.
                *state.lock().unwrap() = RunState::Idle;
                let _ = tx.send(RunEvent::Finished(outcome));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PluginRegistry;
    use crate::schema::{save_parameters, ParameterSchema, ParameterSpec};
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn shell_settings() -> Settings {
        Settings {
            interpreter: "sh".to_string(),
            script_extension: ".sh".to_string(),
            ..Settings::default()
        }
    }

    fn make_task(root: &Path, name: &str, body: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("run.sh"), body).unwrap();
    }

    fn coordinator_for(root: &Path, name: &str, settings: &Settings) -> TaskCoordinator {
        let plugins = PluginRegistry::new(root).with_extension(".sh").discover();
        let plugin = plugins.into_iter().find(|p| p.name == name).unwrap();
        TaskCoordinator::new(plugin, settings).with_output_dir(root.join("out"))
    }

    async fn drain(mut rx: UnboundedReceiver<RunEvent>) -> (Vec<RunEvent>, RunOutcome) {
        let mut events = Vec::new();
        loop {
            match timeout(Duration::from_secs(10), rx.recv()).await {
                Ok(Some(RunEvent::Finished(outcome))) => return (events, outcome),
                Ok(Some(event)) => events.push(event),
                Ok(None) => panic!("channel closed without a terminal event"),
                Err(_) => panic!("timed out waiting for events"),
            }
        }
    }

    #[tokio::test]
    async fn run_relays_lines_and_settles_back_to_idle() {
        let temp = TempDir::new().unwrap();
        make_task(temp.path(), "hello", "echo one\necho two\n");
        let coordinator = coordinator_for(temp.path(), "hello", &shell_settings());

        assert_eq!(coordinator.state(), RunState::Idle);
        let rx = coordinator.run(Vec::new(), true).unwrap();
        let (events, outcome) = drain(rx).await;

        assert_eq!(outcome, RunOutcome::Success);
        assert_eq!(
            events,
            vec![
                RunEvent::Line("one".to_string()),
                RunEvent::Line("two".to_string()),
            ]
        );
        // Terminal event observed; the state machine has settled.
        assert_eq!(coordinator.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn second_start_is_refused_without_mutating_state() {
        let temp = TempDir::new().unwrap();
        make_task(temp.path(), "slow", "echo up\nsleep 30\n");
        let coordinator = coordinator_for(temp.path(), "slow", &shell_settings());

        let mut rx = coordinator.run(Vec::new(), true).unwrap();
        // Wait until the child proves it is running.
        match timeout(Duration::from_secs(10), rx.recv()).await.unwrap() {
            Some(RunEvent::Line(line)) => assert_eq!(line, "up"),
            other => panic!("expected first line, got {:?}", other),
        }

        assert!(matches!(
            coordinator.run(Vec::new(), true),
            Err(StartRefused::AlreadyRunning)
        ));
        assert_eq!(coordinator.state(), RunState::Running);

        coordinator.cancel().unwrap();
        let (_events, outcome) = drain(rx).await;
        assert_eq!(outcome, RunOutcome::Cancelled);
    }

    #[tokio::test]
    async fn empty_inputs_need_confirmation() {
        let temp = TempDir::new().unwrap();
        make_task(temp.path(), "needy", "echo ok\n");
        let coordinator = coordinator_for(temp.path(), "needy", &shell_settings());

        assert!(matches!(
            coordinator.run(Vec::new(), false),
            Err(StartRefused::NoInputFiles)
        ));
        assert_eq!(coordinator.state(), RunState::Idle);

        // Confirmed empty start proceeds.
        let rx = coordinator.run(Vec::new(), true).unwrap();
        let (_events, outcome) = drain(rx).await;
        assert_eq!(outcome, RunOutcome::Success);
    }

    #[tokio::test]
    async fn inert_plugin_is_refused() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("empty")).unwrap();
        let coordinator = coordinator_for(temp.path(), "empty", &shell_settings());

        assert!(matches!(
            coordinator.run(Vec::new(), true),
            Err(StartRefused::NoScript(_))
        ));
    }

    #[tokio::test]
    async fn failure_outcome_carries_exit_code() {
        let temp = TempDir::new().unwrap();
        make_task(temp.path(), "broken", "exit 7\n");
        let coordinator = coordinator_for(temp.path(), "broken", &shell_settings());

        let rx = coordinator.run(Vec::new(), true).unwrap();
        let (_events, outcome) = drain(rx).await;
        match outcome {
            RunOutcome::Failed { code, .. } => assert_eq!(code, Some(7)),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(coordinator.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn cancel_notice_precedes_engine_terminal() {
        let temp = TempDir::new().unwrap();
        make_task(temp.path(), "slow", "echo up\nsleep 30\n");
        let coordinator = coordinator_for(temp.path(), "slow", &shell_settings());

        let mut rx = coordinator.run(Vec::new(), true).unwrap();
        match timeout(Duration::from_secs(10), rx.recv()).await.unwrap() {
            Some(RunEvent::Line(line)) => assert_eq!(line, "up"),
            other => panic!("expected first line, got {:?}", other),
        }
        coordinator.cancel().unwrap();

        let (events, outcome) = drain(rx).await;
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert!(events.contains(&RunEvent::Notice("Run stopped by operator".to_string())));
        assert_eq!(coordinator.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn cancel_with_live_subprocess_settles_promptly() {
        let temp = TempDir::new().unwrap();
        // The background sleep keeps the output pipe open after the script
        // itself is gone; the terminal event must not wait it out.
        make_task(temp.path(), "forker", "sleep 30 &\necho up\nsleep 30\n");
        let coordinator = coordinator_for(temp.path(), "forker", &shell_settings());

        let mut rx = coordinator.run(Vec::new(), true).unwrap();
        match timeout(Duration::from_secs(10), rx.recv()).await.unwrap() {
            Some(RunEvent::Line(line)) => assert_eq!(line, "up"),
            other => panic!("expected first line, got {:?}", other),
        }

        let stopped_at = std::time::Instant::now();
        coordinator.cancel().unwrap();
        let (_events, outcome) = drain(rx).await;

        assert_eq!(outcome, RunOutcome::Cancelled);
        assert!(
            stopped_at.elapsed() < Duration::from_secs(5),
            "terminal event was withheld for {:?}",
            stopped_at.elapsed()
        );
        assert_eq!(coordinator.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn cancel_while_idle_is_refused() {
        let temp = TempDir::new().unwrap();
        make_task(temp.path(), "calm", "echo ok\n");
        let coordinator = coordinator_for(temp.path(), "calm", &shell_settings());
        assert!(coordinator.cancel().is_err());
    }

    #[tokio::test]
    async fn enabled_backups_run_before_launch_and_are_noticed() {
        let temp = TempDir::new().unwrap();
        make_task(temp.path(), "archiver", "echo done\n");
        let input = temp.path().join("data.csv");
        std::fs::write(&input, "1,2,3").unwrap();

        let mut settings = shell_settings();
        settings.backup_enabled = true;
        let coordinator = coordinator_for(temp.path(), "archiver", &settings);

        let rx = coordinator.run(vec![input.clone()], false).unwrap();
        let (events, outcome) = drain(rx).await;
        assert_eq!(outcome, RunOutcome::Success);

        // The backup notice arrives before any child output.
        assert!(matches!(events.first(), Some(RunEvent::Notice(n)) if n.starts_with("Backed up:")));
        let backups = temp.path().join("out").join("backups").join("archiver");
        assert!(backups.is_dir());
    }

    #[tokio::test]
    async fn backup_failure_aborts_the_start() {
        let temp = TempDir::new().unwrap();
        make_task(temp.path(), "blocked", "echo never\n");
        let input = temp.path().join("data.csv");
        std::fs::write(&input, "x").unwrap();

        // Point the backup root below a plain file so directory creation fails.
        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let mut settings = shell_settings();
        settings.backup_enabled = true;
        settings.backup_dir = Some(blocker.join("sub"));
        let coordinator = coordinator_for(temp.path(), "blocked", &settings);

        assert!(matches!(
            coordinator.run(vec![input], false),
            Err(StartRefused::BackupFailed(_))
        ));
        assert_eq!(coordinator.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn parameter_values_reach_the_child_environment() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("param_task");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("run.sh"),
            "echo region=$REGION\necho verbose=$VERBOSE\n",
        )
        .unwrap();

        let mut specs = BTreeMap::new();
        specs.insert(
            "region".to_string(),
            ParameterSpec::Choice {
                label: "Region".to_string(),
                default: "north".to_string(),
                options: vec!["north".to_string(), "south".to_string()],
            },
        );
        specs.insert(
            "verbose".to_string(),
            ParameterSpec::Boolean {
                label: "Verbose".to_string(),
                default: false,
            },
        );
        save_parameters(&dir, &ParameterSchema { specs }).unwrap();

        let mut coordinator = coordinator_for(temp.path(), "param_task", &shell_settings());
        coordinator.set_value("verbose", ParameterValue::Boolean(true));

        let rx = coordinator.run(Vec::new(), true).unwrap();
        let (events, outcome) = drain(rx).await;
        assert_eq!(outcome, RunOutcome::Success);
        assert!(events.contains(&RunEvent::Line("region=north".to_string())));
        assert!(events.contains(&RunEvent::Line("verbose=1".to_string())));
    }

    #[tokio::test]
    async fn independent_tasks_run_concurrently_with_separate_streams() {
        let temp = TempDir::new().unwrap();
        make_task(temp.path(), "alpha", "for i in 1 2 3; do echo alpha-$i; done\n");
        make_task(temp.path(), "beta", "for i in 1 2 3; do echo beta-$i; done\n");
        let settings = shell_settings();

        let a = coordinator_for(temp.path(), "alpha", &settings);
        let b = coordinator_for(temp.path(), "beta", &settings);

        let rx_a = a.run(Vec::new(), true).unwrap();
        let rx_b = b.run(Vec::new(), true).unwrap();
        let ((events_a, outcome_a), (events_b, outcome_b)) =
            tokio::join!(drain(rx_a), drain(rx_b));

        assert_eq!(outcome_a, RunOutcome::Success);
        assert_eq!(outcome_b, RunOutcome::Success);
        assert!(events_a
            .iter()
            .all(|e| matches!(e, RunEvent::Line(l) if l.starts_with("alpha-"))));
        assert!(events_b
            .iter()
            .all(|e| matches!(e, RunEvent::Line(l) if l.starts_with("beta-"))));
    }
}
