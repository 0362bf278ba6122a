use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputOrigin {
    Stdout,
    Stderr,
}

impl OutputOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputLine {
    pub text: String,
    pub origin: OutputOrigin,
}

impl OutputLine {
    pub fn new(text: impl Into<String>, origin: OutputOrigin) -> Self {
        Self {
            text: text.into(),
            origin,
        }
    }

    pub fn is_error(&self) -> bool {
        self.origin == OutputOrigin::Stderr
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgumentKind {
    String,
    Directory,
    File,
    Bool,
}

impl ArgumentKind {
    pub fn is_path(self) -> bool {
        matches!(self, Self::Directory | Self::File)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgumentSpec {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type")]
    pub kind: ArgumentKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlagKind {
    Bool,
    String,
}

/// Default value of a flag as written in a tool file. Variants are tried in
/// declaration order, so `true` decodes as `Bool` and `"true"` as `Text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagDefault {
    Bool(bool),
    Text(String),
}

impl FlagDefault {
    pub fn as_bool(&self) -> bool {
        match self {
            Self::Bool(value) => *value,
            Self::Text(_) => false,
        }
    }

    pub fn as_text(&self) -> &str {
        match self {
            Self::Bool(_) => "",
            Self::Text(value) => value,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagSpec {
    pub name: String,
    #[serde(rename = "flag")]
    pub token: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type")]
    pub kind: FlagKind,
    #[serde(default)]
    pub default: Option<FlagDefault>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentVarSpec {
    pub name: String,
    #[serde(default)]
    pub label: String,
}

/// How a conversational helper is re-invoked with follow-up input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationSpec {
    #[serde(default)]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<ArgumentSpec>,
    #[serde(default)]
    pub flags: Vec<FlagSpec>,
    #[serde(default)]
    pub environment: Vec<EnvironmentVarSpec>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub continuation: Option<ContinuationSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunPhase {
    Idle,
    Launching,
    Streaming,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub lines: Vec<OutputLine>,
    pub running: bool,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub tool_name: String,
    pub tool_icon: String,
    pub tool_description: String,
    pub argument_values: BTreeMap<String, String>,
    pub flag_values: BTreeMap<String, bool>,
    pub output_lines: Vec<OutputLine>,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn from_tool(tool: &ToolDefinition) -> Self {
        let argument_values = tool
            .arguments
            .iter()
            .map(|argument| {
                (
                    argument.name.clone(),
                    argument.default.clone().unwrap_or_default(),
                )
            })
            .collect();
        let flag_values = tool
            .flags
            .iter()
            .map(|flag| {
                (
                    flag.name.clone(),
                    flag.default.as_ref().map(FlagDefault::as_bool).unwrap_or(false),
                )
            })
            .collect();

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool_name: tool.name.clone(),
            tool_icon: tool.icon.clone(),
            tool_description: tool.description.clone(),
            argument_values,
            flag_values,
            output_lines: Vec::new(),
            exit_code: None,
            created_at: Utc::now(),
            last_run_at: None,
        }
    }
}

/// Fully resolved launch parameters. Rebuilt before every run, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRequest {
    pub executable_path: PathBuf,
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub working_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub output_line_cap: usize,
    pub extra_path_entries: Vec<String>,
    pub drain_timeout_ms: u64,
    pub keyring_service: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            output_line_cap: 5_000,
            extra_path_entries: vec!["/opt/homebrew/bin".to_string(), "/usr/local/bin".to_string()],
            drain_timeout_ms: 5_000,
            keyring_service: "local-toolbox".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEventEnvelope {
    pub session_id: String,
    pub run_id: String,
    pub r#type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionGroup {
    Today,
    Yesterday,
    ThisWeek,
    Older,
}

impl SessionGroup {
    pub fn label(self) -> &'static str {
        match self {
            Self::Today => "Today",
            Self::Yesterday => "Yesterday",
            Self::ThisWeek => "This Week",
            Self::Older => "Older",
        }
    }
}
