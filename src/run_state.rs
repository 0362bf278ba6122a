use crate::models::{OutputLine, OutputOrigin, RunPhase, RunSnapshot};
use crate::runner::RunSink;
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Observable output and status of the current (or last) run of one session.
///
/// `running` and `exit_code` are never both set. Every `reset` bumps the
/// generation so writes from a run started before the reset can be told
/// apart and discarded.
#[derive(Debug, Default)]
pub struct RunState {
    lines: Vec<OutputLine>,
    running: bool,
    exit_code: Option<i32>,
    started_at: Option<DateTime<Utc>>,
    generation: u64,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits `text` on newlines and appends every non-empty segment.
    pub fn append(&mut self, text: &str, origin: OutputOrigin) -> usize {
        let before = self.lines.len();
        self.lines.extend(
            text.split('\n')
                .filter(|segment| !segment.is_empty())
                .map(|segment| OutputLine::new(segment, origin)),
        );
        self.lines.len() - before
    }

    pub fn reset(&mut self) -> u64 {
        self.lines.clear();
        self.running = false;
        self.exit_code = None;
        self.started_at = None;
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    pub fn mark_started(&mut self, at: DateTime<Utc>) {
        self.running = true;
        self.exit_code = None;
        self.started_at = Some(at);
    }

    /// Records the terminal exit code. Returns false if no run was in flight.
    pub fn finish(&mut self, exit_code: i32) -> bool {
        if !self.running {
            return false;
        }
        self.running = false;
        self.exit_code = Some(exit_code);
        true
    }

    /// Rebuilds the state from persisted output without re-running anything.
    pub fn load_persisted(&mut self, lines: &[OutputLine], exit_code: Option<i32>) {
        self.lines = lines.to_vec();
        self.exit_code = exit_code;
        self.running = false;
    }

    pub fn lines(&self) -> &[OutputLine] {
        &self.lines
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            lines: self.lines.clone(),
            running: self.running,
            exit_code: self.exit_code,
            started_at: self.started_at,
        }
    }
}

/// Shared handle to a [`RunState`]. Readers always see a whole update.
#[derive(Debug, Clone, Default)]
pub struct RunStateHandle(Arc<RwLock<RunState>>);

impl RunStateHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, RunState> {
        self.0.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, RunState> {
        self.0.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.read().snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.read().is_running()
    }

    /// Sink that writes one run's events into this state, as long as the
    /// state has not been reset since the sink was created.
    pub fn sink(&self) -> StateSink {
        StateSink {
            state: self.clone(),
            generation: self.read().generation(),
        }
    }
}

pub struct StateSink {
    state: RunStateHandle,
    generation: u64,
}

impl StateSink {
    /// False once the state was reset after this sink was handed out.
    pub fn is_current(&self) -> bool {
        self.state.read().generation() == self.generation
    }

    /// Records the exit code and returns the resulting state in one step.
    /// `None` when the state was reset after this sink was handed out.
    pub fn finish(&self, exit_code: i32) -> Option<RunSnapshot> {
        let mut state = self.state.write();
        if state.generation() != self.generation {
            return None;
        }
        state.finish(exit_code);
        Some(state.snapshot())
    }

    fn with_current<F: FnOnce(&mut RunState)>(&self, apply: F) -> bool {
        let mut state = self.state.write();
        if state.generation() != self.generation {
            return false;
        }
        apply(&mut state);
        true
    }
}

impl RunSink for StateSink {
    fn on_phase(&mut self, phase: RunPhase) {
        if phase == RunPhase::Launching {
            let now = Utc::now();
            self.with_current(|state| state.mark_started(now));
        }
    }

    fn on_chunk(&mut self, origin: OutputOrigin, text: &str) {
        if !self.with_current(|state| {
            state.append(text, origin);
        }) {
            tracing::debug!(origin = origin.as_str(), "dropping output for a cleared run");
        }
    }

    fn on_terminated(&mut self, exit_code: i32) {
        if self.finish(exit_code).is_none() {
            tracing::debug!(exit_code, "dropping exit code for a cleared run");
        }
    }
}
