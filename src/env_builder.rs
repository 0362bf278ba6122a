use crate::models::{ArgumentSpec, FlagKind, InvocationRequest, ToolDefinition};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[cfg(windows)]
const PATH_SEPARATOR: &str = ";";
#[cfg(not(windows))]
const PATH_SEPARATOR: &str = ":";

const FALLBACK_PATH: &str = "/usr/bin:/bin";

/// Turns a tool definition plus the user's form values into the argv and
/// environment of one launch.
#[derive(Debug, Clone)]
pub struct EnvironmentBuilder {
    extra_path_entries: Vec<String>,
    home_dir: Option<PathBuf>,
}

impl EnvironmentBuilder {
    pub fn new(extra_path_entries: Vec<String>) -> Self {
        Self {
            extra_path_entries,
            home_dir: dirs::home_dir(),
        }
    }

    pub fn with_home_dir(mut self, home_dir: Option<PathBuf>) -> Self {
        self.home_dir = home_dir;
        self
    }

    /// Enabled boolean flags first, then non-empty arguments, both in
    /// definition order.
    pub fn build_arguments(
        &self,
        tool: &ToolDefinition,
        argument_values: &BTreeMap<String, String>,
        flag_values: &BTreeMap<String, bool>,
    ) -> Vec<String> {
        let mut args = Vec::new();

        for flag in &tool.flags {
            let enabled = flag_values
                .get(&flag.name)
                .copied()
                .or_else(|| flag.default.as_ref().map(|value| value.as_bool()))
                .unwrap_or(false);
            if enabled && flag.kind == FlagKind::Bool {
                args.push(flag.token.clone());
            }
        }

        for argument in &tool.arguments {
            let value = effective_argument_value(argument, argument_values);
            if value.is_empty() {
                continue;
            }
            if argument.kind.is_path() {
                args.push(expand_home(value, self.home_dir.as_deref()));
            } else {
                args.push(value.to_string());
            }
        }

        args
    }

    pub fn build_environment<I, F>(
        &self,
        tool: &ToolDefinition,
        ambient: I,
        secret_lookup: F,
    ) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
        F: Fn(&str, &str) -> Option<String>,
    {
        let mut env: BTreeMap<String, String> = ambient.into_iter().collect();

        let current_path = env
            .get("PATH")
            .cloned()
            .unwrap_or_else(|| FALLBACK_PATH.to_string());
        let path = self
            .extra_path_entries
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(current_path.as_str()))
            .collect::<Vec<_>>()
            .join(PATH_SEPARATOR);
        env.insert("PATH".to_string(), path);

        for var in &tool.environment {
            if let Some(value) = secret_lookup(&tool.name, &var.name) {
                env.insert(var.name.clone(), value);
            }
        }

        env
    }

    pub fn build<I, F>(
        &self,
        tool: &ToolDefinition,
        argument_values: &BTreeMap<String, String>,
        flag_values: &BTreeMap<String, bool>,
        ambient: I,
        secret_lookup: F,
    ) -> InvocationRequest
    where
        I: IntoIterator<Item = (String, String)>,
        F: Fn(&str, &str) -> Option<String>,
    {
        let home = self.home_dir.as_deref();
        InvocationRequest {
            executable_path: PathBuf::from(expand_home(&tool.command, home)),
            arguments: self.build_arguments(tool, argument_values, flag_values),
            environment: self.build_environment(tool, ambient, secret_lookup),
            working_directory: tool
                .working_directory
                .as_deref()
                .filter(|dir| !dir.trim().is_empty())
                .map(|dir| PathBuf::from(expand_home(dir, home))),
        }
    }
}

fn effective_argument_value<'a>(
    argument: &'a ArgumentSpec,
    argument_values: &'a BTreeMap<String, String>,
) -> &'a str {
    argument_values
        .get(&argument.name)
        .map(String::as_str)
        .or(argument.default.as_deref())
        .unwrap_or("")
}

/// Names of required arguments that would be left out of the command line.
pub fn missing_required_arguments(
    tool: &ToolDefinition,
    argument_values: &BTreeMap<String, String>,
) -> Vec<String> {
    tool.arguments
        .iter()
        .filter(|argument| argument.required)
        .filter(|argument| effective_argument_value(argument, argument_values).is_empty())
        .map(|argument| argument.name.clone())
        .collect()
}

/// Expands a leading `~` or `~/` to the home directory.
pub fn expand_home(value: &str, home: Option<&Path>) -> String {
    let Some(home) = home else {
        return value.to_string();
    };
    if value == "~" {
        return home.to_string_lossy().to_string();
    }
    match value.strip_prefix("~/") {
        Some(rest) => home.join(rest).to_string_lossy().to_string(),
        None => value.to_string(),
    }
}
