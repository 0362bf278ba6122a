use crate::errors::AppResult;
use crate::models::ToolDefinition;
use anyhow::Context;
use std::collections::BTreeSet;
use std::path::Path;

/// Reads every tool definition file (`.json`, `.yaml`, `.yml`) in `dir`.
/// Files that fail to parse are skipped; when two files declare the same
/// tool name the one whose file name sorts first wins. A missing directory
/// yields an empty catalog.
pub fn load_tool_definitions(dir: &Path) -> AppResult<Vec<ToolDefinition>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && definition_format(&path).is_some() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut seen = BTreeSet::new();
    let mut tools = Vec::new();
    for path in paths {
        let tool = match read_tool_definition(&path) {
            Ok(tool) => tool,
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %format!("{:#}", error), "skipping tool definition");
                continue;
            }
        };
        if !seen.insert(tool.name.clone()) {
            tracing::warn!(path = %path.display(), tool = %tool.name, "duplicate tool name, keeping the first definition");
            continue;
        }
        tools.push(tool);
    }

    tools.sort_by(|left, right| left.name.cmp(&right.name));
    Ok(tools)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DefinitionFormat {
    Json,
    Yaml,
}

fn definition_format(path: &Path) -> Option<DefinitionFormat> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "json" => Some(DefinitionFormat::Json),
        "yaml" | "yml" => Some(DefinitionFormat::Yaml),
        _ => None,
    }
}

pub fn read_tool_definition(path: &Path) -> anyhow::Result<ToolDefinition> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let tool: ToolDefinition = match definition_format(path) {
        Some(DefinitionFormat::Yaml) => serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?,
        _ => serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?,
    };
    anyhow::ensure!(!tool.name.trim().is_empty(), "{} has an empty tool name", path.display());
    anyhow::ensure!(!tool.command.trim().is_empty(), "{} has an empty command", path.display());
    Ok(tool)
}
