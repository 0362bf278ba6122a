use crate::db::ConfigStore;
use crate::env_builder::{missing_required_arguments, EnvironmentBuilder};
use crate::errors::{AppError, AppResult};
use crate::models::{
    InvocationRequest, OutputLine, OutputOrigin, RunEventEnvelope, RunPhase, RunSnapshot, Session,
    SessionGroup, ToolDefinition,
};
use crate::run_state::{RunStateHandle, StateSink};
use crate::runner::{ProcessRunner, RunHandle, RunSink};
use crate::secrets::SecretBridge;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

const EVENT_BUFFER: usize = 1024;

/// Launch parameters of the last fresh run, kept so follow-up input can be
/// sent to the same executable with the same environment.
#[derive(Debug, Clone)]
struct ContinuationTarget {
    request: InvocationRequest,
    arguments: Vec<String>,
}

/// Owns the live run state of every session and the one-run-at-a-time rule.
#[derive(Clone)]
pub struct SessionController {
    store: Arc<dyn ConfigStore>,
    secrets: SecretBridge,
    runner: ProcessRunner,
    builder: EnvironmentBuilder,
    output_line_cap: usize,
    states: Arc<Mutex<HashMap<String, RunStateHandle>>>,
    continuations: Arc<Mutex<HashMap<String, ContinuationTarget>>>,
    events: broadcast::Sender<RunEventEnvelope>,
}

impl SessionController {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        secrets: SecretBridge,
        runner: ProcessRunner,
        builder: EnvironmentBuilder,
        output_line_cap: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            store,
            secrets,
            runner,
            builder,
            output_line_cap,
            states: Arc::new(Mutex::new(HashMap::new())),
            continuations: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEventEnvelope> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    /// Run state of `session_id`, created empty on first use.
    pub async fn run_state(&self, session_id: &str) -> RunStateHandle {
        let mut states = self.states.lock().await;
        states.entry(session_id.to_string()).or_default().clone()
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<RunSnapshot> {
        let states = self.states.lock().await;
        states.get(session_id).map(RunStateHandle::snapshot)
    }

    pub async fn is_running(&self, session_id: &str) -> bool {
        let states = self.states.lock().await;
        states
            .get(session_id)
            .map(RunStateHandle::is_running)
            .unwrap_or(false)
    }

    /// Replays the persisted output of `session` into its run state unless
    /// that state already holds something.
    pub async fn open_session(&self, session: &Session) -> RunSnapshot {
        let handle = self.run_state(&session.id).await;
        {
            let mut state = handle.write();
            if !state.is_running() && state.lines().is_empty() && state.exit_code().is_none() {
                state.load_persisted(&session.output_lines, session.exit_code);
            }
        }
        handle.snapshot()
    }

    /// Loads every finished session's output, as done once at start-up.
    pub async fn restore_persisted(&self, sessions: &[Session]) -> usize {
        let mut restored = 0;
        for session in sessions {
            if session.exit_code.is_none() && session.output_lines.is_empty() {
                continue;
            }
            self.open_session(session).await;
            restored += 1;
        }
        restored
    }

    pub async fn create_session(&self, tool: &ToolDefinition) -> AppResult<Session> {
        let session = self.store.create_session(tool)?;
        tracing::info!(session_id = %session.id, tool = %tool.name, "session created");
        Ok(session)
    }

    /// Starts a fresh run with the form values carried by `session`.
    pub async fn run_fresh(&self, session: &Session, tool: &ToolDefinition) -> AppResult<RunHandle> {
        let missing = missing_required_arguments(tool, &session.argument_values);
        if !missing.is_empty() {
            return Err(AppError::Cli(format!(
                "Missing required arguments: {}",
                missing.join(", ")
            )));
        }

        let mut states = self.states.lock().await;
        let handle = states.entry(session.id.clone()).or_default().clone();
        if handle.is_running() {
            return Err(AppError::Busy(format!(
                "Session {} already has a run in progress",
                session.id
            )));
        }

        self.remember_form_values(session)?;

        let secrets = self.secrets.clone();
        let request = self.builder.build(
            tool,
            &session.argument_values,
            &session.flag_values,
            std::env::vars(),
            |tool_name, var_name| secrets.resolve(tool_name, var_name),
        );

        handle.write().reset();

        {
            let mut continuations = self.continuations.lock().await;
            match tool.continuation.as_ref() {
                Some(continuation) => {
                    continuations.insert(
                        session.id.clone(),
                        ContinuationTarget {
                            request: request.clone(),
                            arguments: continuation.arguments.clone(),
                        },
                    );
                }
                None => {
                    continuations.remove(&session.id);
                }
            }
        }

        let run = self.launch(&session.id, &handle, &request);
        drop(states);
        Ok(run)
    }

    /// Sends `input` as a follow-up to the session's last fresh run. Output
    /// is appended after an echo of the input.
    pub async fn run_continuation(&self, session_id: &str, input: &str) -> AppResult<RunHandle> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AppError::Cli("Follow-up input is empty".to_string()));
        }

        let target = {
            let continuations = self.continuations.lock().await;
            continuations.get(session_id).cloned().ok_or_else(|| {
                AppError::NotFound(format!("Session {} has nothing to continue", session_id))
            })?
        };

        let mut states = self.states.lock().await;
        let handle = states.entry(session_id.to_string()).or_default().clone();
        if handle.is_running() {
            return Err(AppError::Busy(format!(
                "Session {} already has a run in progress",
                session_id
            )));
        }
        handle
            .write()
            .append(&format!("> {}", input), OutputOrigin::Stdout);

        let mut request = target.request;
        request.arguments = target
            .arguments
            .into_iter()
            .chain(std::iter::once(input.to_string()))
            .collect();

        let run = self.launch(session_id, &handle, &request);
        drop(states);
        Ok(run)
    }

    /// Empties the session's output. A run still in flight keeps going but
    /// none of its later output or its exit code is recorded.
    pub async fn clear(&self, session_id: &str) -> AppResult<()> {
        let handle = self.run_state(session_id).await;
        handle.write().reset();
        self.continuations.lock().await.remove(session_id);

        if let Some(mut session) = self.store.get_session(session_id)? {
            session.output_lines.clear();
            session.exit_code = None;
            self.store.save_session(&session)?;
        }
        tracing::info!(session_id = %session_id, "session output cleared");
        Ok(())
    }

    /// Persists the form values of `session` together with its captured
    /// output and returns what was written. A stored `last_run_at` is never
    /// replaced.
    pub async fn save(&self, session: &Session) -> AppResult<Session> {
        let stored_last_run = self
            .store
            .get_session(&session.id)?
            .and_then(|stored| stored.last_run_at);

        let mut record = session.clone();
        record.last_run_at = stored_last_run.or(session.last_run_at);
        match self.snapshot(&session.id).await {
            Some(snapshot) => {
                record.output_lines = cap_output_lines(&snapshot.lines, self.output_line_cap);
                if !snapshot.running {
                    record.exit_code = snapshot.exit_code;
                }
            }
            None => {
                record.output_lines = cap_output_lines(&session.output_lines, self.output_line_cap);
            }
        }
        self.store.save_session(&record)?;
        Ok(record)
    }

    pub async fn delete_session(&self, session_id: &str) -> AppResult<bool> {
        if let Some(handle) = self.states.lock().await.remove(session_id) {
            handle.write().reset();
        }
        self.continuations.lock().await.remove(session_id);
        let deleted = self.store.delete_session(session_id)?;
        if deleted {
            tracing::info!(session_id = %session_id, "session deleted");
        }
        Ok(deleted)
    }

    fn remember_form_values(&self, session: &Session) -> AppResult<()> {
        let mut record = self
            .store
            .get_session(&session.id)?
            .unwrap_or_else(|| session.clone());
        record.argument_values = session.argument_values.clone();
        record.flag_values = session.flag_values.clone();
        self.store.save_session(&record)
    }

    fn launch(&self, session_id: &str, handle: &RunStateHandle, request: &InvocationRequest) -> RunHandle {
        let run_id = Uuid::new_v4().to_string();
        let sink = PersistingSink {
            state: handle.sink(),
            session_id: session_id.to_string(),
            run_id: run_id.clone(),
            store: self.store.clone(),
            output_line_cap: self.output_line_cap,
            events: self.events.clone(),
        };
        self.runner.start_with_id(run_id, request, sink)
    }
}

/// Writes into the run state, publishes envelopes, and persists the session
/// once the run terminates. Everything stops once the state is reset.
struct PersistingSink {
    state: StateSink,
    session_id: String,
    run_id: String,
    store: Arc<dyn ConfigStore>,
    output_line_cap: usize,
    events: broadcast::Sender<RunEventEnvelope>,
}

impl PersistingSink {
    fn publish(&self, event_type: &str, payload: serde_json::Value) {
        // No subscribers is fine.
        let _ = self.events.send(RunEventEnvelope {
            session_id: self.session_id.clone(),
            run_id: self.run_id.clone(),
            r#type: event_type.to_string(),
            payload,
            timestamp: Utc::now(),
        });
    }

    fn persist(&self, snapshot: &RunSnapshot) -> AppResult<()> {
        let Some(mut session) = self.store.get_session(&self.session_id)? else {
            return Ok(());
        };
        session.output_lines = cap_output_lines(&snapshot.lines, self.output_line_cap);
        session.exit_code = snapshot.exit_code;
        if session.last_run_at.is_none() {
            session.last_run_at = Some(Utc::now());
        }
        self.store.save_session(&session)
    }
}

impl RunSink for PersistingSink {
    fn on_phase(&mut self, phase: RunPhase) {
        self.state.on_phase(phase);
        if self.state.is_current() {
            self.publish("run.phase", json!({ "phase": phase }));
        }
    }

    fn on_chunk(&mut self, origin: OutputOrigin, text: &str) {
        self.state.on_chunk(origin, text);
        if self.state.is_current() {
            self.publish("run.output", json!({ "origin": origin, "text": text }));
        }
    }

    fn on_terminated(&mut self, exit_code: i32) {
        let Some(snapshot) = self.state.finish(exit_code) else {
            tracing::debug!(session_id = %self.session_id, exit_code, "dropping exit code for a cleared run");
            return;
        };
        if let Err(error) = self.persist(&snapshot) {
            tracing::warn!(
                session_id = %self.session_id,
                run_id = %self.run_id,
                error = %error,
                "failed to persist session after run"
            );
        }
        self.publish("run.exited", json!({ "exitCode": exit_code }));
    }
}

/// Keeps at most `cap` lines: a marker line followed by the newest
/// `cap - 1`. A cap of zero disables truncation.
pub fn cap_output_lines(lines: &[OutputLine], cap: usize) -> Vec<OutputLine> {
    if cap == 0 || lines.len() <= cap {
        return lines.to_vec();
    }
    let kept = cap - 1;
    let marker = OutputLine::new(
        format!(
            "--- Output truncated (showing last {} of {} lines) ---",
            kept,
            lines.len()
        ),
        OutputOrigin::Stdout,
    );
    std::iter::once(marker)
        .chain(lines[lines.len() - kept..].iter().cloned())
        .collect()
}

/// Buckets sessions by creation date relative to `now`, newest first inside
/// each bucket. Weeks start on Monday. Empty buckets are left out.
pub fn group_sessions<Tz: TimeZone>(
    sessions: &[Session],
    now: &DateTime<Tz>,
) -> Vec<(SessionGroup, Vec<Session>)> {
    let today = now.date_naive();
    let yesterday = today - Duration::days(1);
    let week_start = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));

    let mut ordered: Vec<&Session> = sessions.iter().collect();
    ordered.sort_by(|left, right| right.created_at.cmp(&left.created_at));

    let mut groups: Vec<(SessionGroup, Vec<Session>)> = [
        SessionGroup::Today,
        SessionGroup::Yesterday,
        SessionGroup::ThisWeek,
        SessionGroup::Older,
    ]
    .into_iter()
    .map(|group| (group, Vec::new()))
    .collect();

    for session in ordered {
        let created = session.created_at.with_timezone(&now.timezone()).date_naive();
        let slot = if created >= today {
            0
        } else if created == yesterday {
            1
        } else if created >= week_start {
            2
        } else {
            3
        };
        groups[slot].1.push(session.clone());
    }

    groups.retain(|(_, members)| !members.is_empty());
    groups
}

#[cfg(test)]
mod tests {
    use super::{cap_output_lines, group_sessions, SessionController};
    use crate::db::{ConfigStore, Database};
    use crate::env_builder::EnvironmentBuilder;
    use crate::errors::AppError;
    use crate::models::{OutputLine, OutputOrigin, Session, SessionGroup, ToolDefinition};
    use crate::runner::ProcessRunner;
    use crate::secrets::{MemorySecretStore, SecretBridge};
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;

    fn controller(dir: &std::path::Path) -> SessionController {
        let db = Database::new(&dir.join("state.sqlite")).expect("db");
        SessionController::new(
            Arc::new(db),
            SecretBridge::new(Arc::new(MemorySecretStore::new())),
            ProcessRunner::default(),
            EnvironmentBuilder::new(Vec::new()),
            5_000,
        )
    }

    fn tool(value: serde_json::Value) -> ToolDefinition {
        serde_json::from_value(value).expect("tool")
    }

    #[test]
    fn caps_long_output_with_marker() {
        let lines: Vec<_> = (1..=5_001)
            .map(|index| OutputLine::new(format!("line {}", index), OutputOrigin::Stdout))
            .collect();
        let capped = cap_output_lines(&lines, 5_000);

        assert_eq!(capped.len(), 5_000);
        assert!(capped[0].text.contains("4999"));
        assert!(capped[0].text.contains("5001"));
        assert_eq!(capped[1].text, "line 3");
        assert_eq!(capped[4_999].text, "line 5001");
    }

    #[test]
    fn short_output_is_untouched() {
        let lines = vec![OutputLine::new("only", OutputOrigin::Stderr)];
        assert_eq!(cap_output_lines(&lines, 5_000), lines);
        assert_eq!(cap_output_lines(&lines, 0), lines);
    }

    #[test]
    fn groups_sessions_by_creation_day() {
        // Wednesday.
        let now = Utc.with_ymd_and_hms(2026, 10, 14, 15, 0, 0).single().expect("now");
        let tool = tool(serde_json::json!({"name": "t", "command": "/bin/true"}));
        let at = |offset: Duration| {
            let mut session = Session::from_tool(&tool);
            session.created_at = now - offset;
            session
        };
        let sessions = vec![
            at(Duration::days(30)),
            at(Duration::hours(1)),
            at(Duration::days(1)),
            at(Duration::days(2)),
            at(Duration::minutes(5)),
        ];

        let groups = group_sessions(&sessions, &now);
        let shape: Vec<_> = groups.iter().map(|(group, members)| (*group, members.len())).collect();
        assert_eq!(
            shape,
            vec![
                (SessionGroup::Today, 2),
                (SessionGroup::Yesterday, 1),
                (SessionGroup::ThisWeek, 1),
                (SessionGroup::Older, 1),
            ]
        );
        assert!(groups[0].1[0].created_at > groups[0].1[1].created_at);
    }

    #[tokio::test]
    async fn refuses_run_with_missing_required_argument() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = controller(dir.path());
        let tool = tool(serde_json::json!({
            "name": "needs-path",
            "command": "/bin/ls",
            "arguments": [{"name": "path", "label": "Path", "type": "directory", "required": true}]
        }));
        let session = controller.create_session(&tool).await.expect("session");

        let result = controller.run_fresh(&session, &tool).await;
        assert!(matches!(result, Err(AppError::Cli(_))));
        assert!(!controller.is_running(&session.id).await);
    }

    #[tokio::test]
    async fn continuation_requires_input_and_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = controller(dir.path());

        assert!(matches!(
            controller.run_continuation("missing", "   ").await,
            Err(AppError::Cli(_))
        ));
        assert!(matches!(
            controller.run_continuation("missing", "hello").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn open_session_replays_persisted_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = controller(dir.path());
        let tool = tool(serde_json::json!({"name": "t", "command": "/bin/true"}));
        let mut session = controller.create_session(&tool).await.expect("session");
        session.output_lines = vec![OutputLine::new("kept", OutputOrigin::Stdout)];
        session.exit_code = Some(0);
        controller.store().save_session(&session).expect("save");

        let restored = controller
            .restore_persisted(&controller.store().list_sessions().expect("list"))
            .await;
        assert_eq!(restored, 1);
        let snapshot = controller.snapshot(&session.id).await.expect("state");
        assert_eq!(snapshot.lines, session.output_lines);
        assert_eq!(snapshot.exit_code, Some(0));
        assert!(!snapshot.running);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_fresh_run_is_busy_until_cleared() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = controller(dir.path());
        let tool = tool(serde_json::json!({
            "name": "sleeper",
            "command": "/bin/sleep",
            "arguments": [{"name": "seconds", "label": "Seconds", "type": "string", "default": "2"}]
        }));
        let session = controller.create_session(&tool).await.expect("session");

        let _first = controller.run_fresh(&session, &tool).await.expect("first run");
        assert!(controller.is_running(&session.id).await);
        assert!(matches!(
            controller.run_fresh(&session, &tool).await,
            Err(AppError::Busy(_))
        ));

        controller.clear(&session.id).await.expect("clear");
        assert!(!controller.is_running(&session.id).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn finished_run_is_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = controller(dir.path());
        let tool = tool(serde_json::json!({
            "name": "greeter",
            "command": "/bin/echo",
            "arguments": [{"name": "who", "label": "Who", "type": "string"}]
        }));
        let mut session = controller.create_session(&tool).await.expect("session");
        session.argument_values.insert("who".to_string(), "world".to_string());

        let run = controller.run_fresh(&session, &tool).await.expect("run");
        assert_eq!(run.wait().await, 0);

        let stored = controller
            .store()
            .get_session(&session.id)
            .expect("get")
            .expect("stored");
        assert_eq!(stored.output_lines, vec![OutputLine::new("world", OutputOrigin::Stdout)]);
        assert_eq!(stored.exit_code, Some(0));
        assert!(stored.last_run_at.is_some());
        assert_eq!(stored.argument_values.get("who").map(String::as_str), Some("world"));
    }

    #[tokio::test]
    async fn save_caps_output_without_live_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = controller(dir.path());
        let tool = tool(serde_json::json!({"name": "t", "command": "/bin/true"}));
        let mut session = controller.create_session(&tool).await.expect("session");
        session.output_lines = (1..=6_000)
            .map(|index| OutputLine::new(format!("line {}", index), OutputOrigin::Stdout))
            .collect();

        let saved = controller.save(&session).await.expect("save");
        assert_eq!(saved.output_lines.len(), 5_000);

        let stored = controller
            .store()
            .get_session(&session.id)
            .expect("get")
            .expect("stored");
        assert_eq!(stored.output_lines.len(), 5_000);
        assert!(stored.output_lines[0].text.contains("4999"));
        assert!(stored.output_lines[0].text.contains("6000"));
        assert_eq!(stored.output_lines[4_999].text, "line 6000");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn save_keeps_first_completion_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = controller(dir.path());
        let tool = tool(serde_json::json!({"name": "true", "command": "/bin/true"}));
        let before_run = controller.create_session(&tool).await.expect("session");

        controller.run_fresh(&before_run, &tool).await.expect("run").wait().await;
        let first = controller
            .store()
            .get_session(&before_run.id)
            .expect("get")
            .expect("stored")
            .last_run_at
            .expect("last run recorded");

        let saved = controller.save(&before_run).await.expect("save");
        assert_eq!(saved.last_run_at, Some(first));

        controller.run_fresh(&before_run, &tool).await.expect("rerun").wait().await;
        let stored = controller
            .store()
            .get_session(&before_run.id)
            .expect("get")
            .expect("stored");
        assert_eq!(stored.last_run_at, Some(first));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn busy_rejection_leaves_stored_values_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = controller(dir.path());
        let tool = tool(serde_json::json!({
            "name": "sleeper",
            "command": "/bin/sleep",
            "arguments": [{"name": "n", "label": "Seconds", "type": "string", "default": "1"}]
        }));
        let session = controller.create_session(&tool).await.expect("session");
        let _running = controller.run_fresh(&session, &tool).await.expect("first run");

        let mut edited = session.clone();
        edited.argument_values.insert("n".to_string(), "99".to_string());
        assert!(matches!(
            controller.run_fresh(&edited, &tool).await,
            Err(AppError::Busy(_))
        ));

        let stored = controller
            .store()
            .get_session(&session.id)
            .expect("get")
            .expect("stored");
        assert_eq!(stored.argument_values.get("n").map(String::as_str), Some("1"));
    }
}

