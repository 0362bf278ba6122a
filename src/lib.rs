pub mod db;
pub mod env_builder;
pub mod errors;
pub mod harness;
pub mod models;
pub mod run_state;
pub mod runner;
pub mod secrets;
pub mod session;
pub mod tool_catalog;

use crate::db::{ConfigStore, Database};
use crate::env_builder::EnvironmentBuilder;
use crate::errors::{AppError, AppResult};
use crate::models::{
    AppSettings, RunEventEnvelope, RunSnapshot, Session, SessionGroup, ToolDefinition,
};
use crate::runner::{ProcessRunner, RunHandle, RunnerConfig};
use crate::secrets::{KeyringSecretStore, SecretBridge, SecretStore};
use crate::session::{group_sessions, SessionController};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Everything a front-end needs: tool catalog, sessions, runs and secrets.
/// Settings are read once at construction.
pub struct ToolboxCore {
    db: Arc<Database>,
    secrets: SecretBridge,
    controller: SessionController,
    settings: AppSettings,
    app_data_dir: PathBuf,
}

impl ToolboxCore {
    /// Opens `state.sqlite` under `app_data_dir` and keeps secrets in the OS
    /// keyring.
    pub async fn new(app_data_dir: PathBuf) -> AppResult<Self> {
        let db = open_database(&app_data_dir)?;
        let settings = db.get_settings()?;
        let store = Arc::new(KeyringSecretStore::new(settings.keyring_service.clone(), db.clone()));
        Self::assemble(app_data_dir, db, settings, store).await
    }

    pub async fn with_secret_store(
        app_data_dir: PathBuf,
        store: Arc<dyn SecretStore>,
    ) -> AppResult<Self> {
        let db = open_database(&app_data_dir)?;
        let settings = db.get_settings()?;
        Self::assemble(app_data_dir, db, settings, store).await
    }

    async fn assemble(
        app_data_dir: PathBuf,
        db: Arc<Database>,
        settings: AppSettings,
        store: Arc<dyn SecretStore>,
    ) -> AppResult<Self> {
        let secrets = SecretBridge::new(store);
        let runner = ProcessRunner::new(RunnerConfig {
            drain_timeout: std::time::Duration::from_millis(settings.drain_timeout_ms),
        });
        let controller = SessionController::new(
            db.clone(),
            secrets.clone(),
            runner,
            EnvironmentBuilder::new(settings.extra_path_entries.clone()),
            settings.output_line_cap,
        );

        let core = Self {
            db,
            secrets,
            controller,
            settings,
            app_data_dir,
        };

        let imported = core.import_tools(&core.tools_dir())?;
        let restored = core
            .controller
            .restore_persisted(&core.db.list_sessions()?)
            .await;
        tracing::info!(
            app_data_dir = %core.app_data_dir.display(),
            db = %core.db.path().display(),
            imported,
            restored,
            "toolbox core ready"
        );
        Ok(core)
    }

    pub fn app_data_dir(&self) -> &Path {
        &self.app_data_dir
    }

    /// Directory scanned for tool definition files at start-up.
    pub fn tools_dir(&self) -> PathBuf {
        self.app_data_dir.join("tools")
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    /// Merges `update` into the stored settings. Takes effect on the next
    /// start.
    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<AppSettings> {
        self.db.update_settings(update)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEventEnvelope> {
        self.controller.subscribe()
    }

    /// Adds or replaces every valid definition found in `dir`.
    pub fn import_tools(&self, dir: &Path) -> AppResult<usize> {
        let tools = tool_catalog::load_tool_definitions(dir)?;
        for tool in &tools {
            self.db.upsert_tool(tool)?;
        }
        Ok(tools.len())
    }

    pub fn list_tools(&self) -> AppResult<Vec<ToolDefinition>> {
        self.db.list_tools()
    }

    pub fn get_tool(&self, name: &str) -> AppResult<ToolDefinition> {
        self.db
            .get_tool(name)?
            .ok_or_else(|| AppError::NotFound(format!("Tool {} not found", name)))
    }

    pub fn remove_tool(&self, name: &str) -> AppResult<bool> {
        self.db.delete_tool(name)
    }

    pub async fn create_session(&self, tool_name: &str) -> AppResult<Session> {
        let tool = self.get_tool(tool_name)?;
        self.controller.create_session(&tool).await
    }

    pub fn list_sessions(&self) -> AppResult<Vec<Session>> {
        self.db.list_sessions()
    }

    pub fn grouped_sessions(&self) -> AppResult<Vec<(SessionGroup, Vec<Session>)>> {
        Ok(group_sessions(&self.db.list_sessions()?, &chrono::Local::now()))
    }

    pub fn get_session(&self, session_id: &str) -> AppResult<Session> {
        self.db
            .get_session(session_id)?
            .ok_or_else(|| AppError::NotFound(format!("Session {} not found", session_id)))
    }

    pub async fn open_session(&self, session_id: &str) -> AppResult<RunSnapshot> {
        let session = self.get_session(session_id)?;
        Ok(self.controller.open_session(&session).await)
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<RunSnapshot> {
        self.controller.snapshot(session_id).await
    }

    /// Starts a fresh run of the session's tool with the form values in
    /// `session`.
    pub async fn run(&self, session: &Session) -> AppResult<RunHandle> {
        let tool = self.get_tool(&session.tool_name)?;
        self.controller.run_fresh(session, &tool).await
    }

    pub async fn continue_run(&self, session_id: &str, input: &str) -> AppResult<RunHandle> {
        self.controller.run_continuation(session_id, input).await
    }

    pub async fn clear(&self, session_id: &str) -> AppResult<()> {
        self.controller.clear(session_id).await
    }

    pub async fn save_session(&self, session: &Session) -> AppResult<Session> {
        self.controller.save(session).await
    }

    pub async fn delete_session(&self, session_id: &str) -> AppResult<bool> {
        self.controller.delete_session(session_id).await
    }

    pub fn secret_values(&self, tool_name: &str) -> AppResult<BTreeMap<String, String>> {
        let tool = self.get_tool(tool_name)?;
        Ok(self.secrets.values_for(&tool))
    }

    pub fn save_secret(&self, tool_name: &str, var_name: &str, value: &str) -> AppResult<()> {
        self.secrets.save(tool_name, var_name, value)
    }

    pub fn delete_secret(&self, tool_name: &str, var_name: &str) -> AppResult<()> {
        self.secrets.delete(tool_name, var_name)
    }

    pub fn stored_secret_keys(&self) -> AppResult<Vec<(String, String)>> {
        self.secrets.stored_keys()
    }
}

fn open_database(app_data_dir: &Path) -> AppResult<Arc<Database>> {
    std::fs::create_dir_all(app_data_dir)?;
    Ok(Arc::new(Database::new(&app_data_dir.join("state.sqlite"))?))
}

/// JSON logs to `<app_data_dir>/logs/toolbox.log`, rotated daily. Filter
/// comes from `RUST_LOG`, defaulting to `info`.
pub fn init_tracing(app_data_dir: &Path) -> Result<(), String> {
    let log_dir = app_data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "toolbox.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
