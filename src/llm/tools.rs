//! Read-only repository tools exposed to the model.
//!
//! Every tool answers with text. Failures (bad arguments, missing paths, API
//! errors) are reported back to the model as text too, so a bad call costs a
//! turn instead of ending the analysis.

use super::client::ToolCallMessage;
use crate::gateway::{GatewayError, RepositoryGateway};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Upper bound on a single tool answer, in bytes.
const MAX_OUTPUT_SIZE: usize = 20_000;

// ═══════════════════════════════════════════════════════════════════════════
//  TOOL DEFINITIONS
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: &'static str,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: serde_json::Value,
}

/// Result of executing a tool
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            tool_type: "function",
            function: FunctionDefinition {
                name: "read_file",
                description: "Read a file from the repository. Each line is prefixed with its 1-indexed line number and a │ separator; the prefix is not part of the file.",
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "File path relative to the repository root"
                        }
                    },
                    "required": ["path"]
                }),
            },
        },
        ToolDefinition {
            tool_type: "function",
            function: FunctionDefinition {
                name: "list_files",
                description: "List files and directories at one level of the repository. Start here.",
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "Directory path (default: repository root)"
                        }
                    }
                }),
            },
        },
        ToolDefinition {
            tool_type: "function",
            function: FunctionDefinition {
                name: "analyze_structure",
                description: "Summarize a directory as JSON with separate lists of subdirectories and files, to understand the project layout.",
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "Directory path (default: repository root)"
                        }
                    }
                }),
            },
        },
    ]
}

pub async fn execute_tool(gateway: &dyn RepositoryGateway, call: &ToolCallMessage) -> ToolResult {
    let args = call.function.arguments.as_str();
    debug!(tool = %call.function.name, arguments = %args, "executing tool");

    let content = match call.function.name.as_str() {
        "read_file" => read_file(gateway, args).await,
        "list_files" => list_files(gateway, args).await,
        "analyze_structure" => analyze_structure(gateway, args).await,
        other => format!("Unknown tool: {}", other),
    };

    ToolResult {
        tool_call_id: call.id.clone(),
        content: truncate_output(content),
    }
}

#[derive(Deserialize, Default)]
struct PathArgs {
    #[serde(default)]
    path: Option<String>,
}

/// Empty or missing arguments mean the repository root.
fn parse_path_args(args: &str) -> Result<String, String> {
    if args.trim().is_empty() {
        return Ok(String::new());
    }
    let parsed: PathArgs =
        serde_json::from_str(args).map_err(|e| format!("Invalid arguments: {}", e))?;
    Ok(normalize_path(parsed.path.as_deref().unwrap_or("")))
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_start_matches("./").trim_matches('/');
    if trimmed == "." {
        String::new()
    } else {
        trimmed.to_string()
    }
}

fn display_dir(path: &str) -> &str {
    if path.is_empty() {
        "root"
    } else {
        path
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  READ
// ═══════════════════════════════════════════════════════════════════════════

async fn read_file(gateway: &dyn RepositoryGateway, args: &str) -> String {
    let path = match parse_path_args(args) {
        Ok(p) if p.is_empty() => return "Invalid arguments: path is required".to_string(),
        Ok(p) => p,
        Err(e) => return e,
    };

    match gateway.read_file(&path).await {
        Ok(file) => {
            let mut output = format!("File: {}\nContent:\n", path);
            for (i, line) in file.content.lines().enumerate() {
                output.push_str(&format!("{:>4}│ {}\n", i + 1, line));
            }
            output
        }
        Err(GatewayError::NotFound { .. }) => format!("File not found: {}", path),
        Err(e) => format!("Error reading {}: {}", path, e),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  LIST
// ═══════════════════════════════════════════════════════════════════════════

async fn list_files(gateway: &dyn RepositoryGateway, args: &str) -> String {
    let path = match parse_path_args(args) {
        Ok(p) => p,
        Err(e) => return e,
    };

    match gateway.list_directory(&path).await {
        Ok(entries) => {
            let lines: Vec<String> = entries
                .iter()
                .map(|e| format!("{} {}", if e.is_dir { "📁" } else { "📄" }, e.path))
                .collect();
            format!("Files in {}:\n{}", display_dir(&path), lines.join("\n"))
        }
        Err(e) => format!("Error listing files in {}: {}", display_dir(&path), e),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  STRUCTURE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
struct Structure<'a> {
    directories: Vec<&'a str>,
    files: Vec<&'a str>,
}

async fn analyze_structure(gateway: &dyn RepositoryGateway, args: &str) -> String {
    let path = match parse_path_args(args) {
        Ok(p) => p,
        Err(e) => return e,
    };

    let entries = match gateway.list_directory(&path).await {
        Ok(entries) => entries,
        Err(e) => return format!("Error analyzing structure in {}: {}", display_dir(&path), e),
    };

    let (dirs, files): (Vec<_>, Vec<_>) = entries.iter().partition(|e| e.is_dir);
    let structure = Structure {
        directories: dirs.iter().map(|e| e.path.as_str()).collect(),
        files: files.iter().map(|e| e.path.as_str()).collect(),
    };

    match serde_json::to_string_pretty(&structure) {
        Ok(json) => format!(
            "Repository structure analysis for {}:\n{}",
            display_dir(&path),
            json
        ),
        Err(e) => format!("Error analyzing structure in {}: {}", display_dir(&path), e),
    }
}

fn truncate_output(result: String) -> String {
    if result.len() <= MAX_OUTPUT_SIZE {
        return result;
    }
    let mut end = MAX_OUTPUT_SIZE;
    while !result.is_char_boundary(end) {
        end -= 1;
    }
    let truncate_at = result[..end].rfind('\n').unwrap_or(end);
    format!("{}\n\n... (truncated)", &result[..truncate_at])
}
