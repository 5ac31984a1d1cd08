//! Functions the model may call, and the default executor that runs them
//! against files under a workspace root.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use ignore::WalkBuilder;
use scribe_types::ToolSchema;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::fs;

pub const READ_REGION_CONTENT: &str = "read_region_content";
pub const GET_WORKING_DIRECTORY_CONTENT: &str = "get_working_directory_content";
pub const REPLACE_TEXT_WITH_ANOTHER_TEXT: &str = "replace_text_with_another_text";
pub const REPLACE_TEXT_FOR_WHOLE_FILE: &str = "replace_text_for_whole_file";

const MAX_LISTED_ENTRIES: usize = 2_000;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Called function doesn't exist: {0}")]
    UnknownFunction(String),
    #[error("Wrong attributes passed: {0}")]
    InvalidArguments(String),
    #[error("Path not allowed: {0}")]
    PathDenied(String),
    #[error("File under path not found: {0}")]
    NotFound(String),
    #[error("Text not found: {0}")]
    TextNotFound(String),
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runs a named function with already-parsed arguments.
///
/// An `Err` is not fatal to a session; its text becomes the tool message the
/// model sees.
#[async_trait]
pub trait FunctionExecutor: Send + Sync {
    fn declarations(&self) -> Vec<ToolSchema>;
    async fn execute(&self, name: &str, args: &Map<String, Value>) -> Result<String, ToolError>;
}

/// The fixed declaration array attached to tool-enabled requests.
pub fn builtin_declarations() -> Vec<ToolSchema> {
    let region = |what: &str| {
        json!({
            "type": "object",
            "description": format!("The region in the file to {what}, as character offsets"),
            "properties": {
                "a": {"type": "integer", "description": "Start of the region, -1 for the start of the file"},
                "b": {"type": "integer", "description": "End of the region, -1 for the end of the file"},
            },
            "required": ["a", "b"],
            "additionalProperties": false,
        })
    };
    let file_path = json!({
        "type": "string",
        "description": "Path of the file, relative to the working directory",
    });
    vec![
        ToolSchema {
            name: READ_REGION_CONTENT.to_string(),
            description: "Read the content of the particular region".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"file_path": file_path, "region": region("read")},
                "required": ["file_path", "region"],
                "additionalProperties": false,
            }),
        },
        ToolSchema {
            name: GET_WORKING_DIRECTORY_CONTENT.to_string(),
            description: "Get complete structure of directories and files within the working directory, `.` is the project root".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "directory_path": {"type": "string", "description": "Directory to list, relative to the working directory"},
                },
                "required": ["directory_path"],
                "additionalProperties": false,
            }),
        },
        ToolSchema {
            name: REPLACE_TEXT_WITH_ANOTHER_TEXT.to_string(),
            description: "Replace the first occurrence of a text in a file with another text".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "file_path": file_path,
                    "old_content": {"type": "string", "description": "Exact text to search for"},
                    "new_content": {"type": "string", "description": "Text to put in its place"},
                },
                "required": ["file_path", "old_content", "new_content"],
                "additionalProperties": false,
            }),
        },
        ToolSchema {
            name: REPLACE_TEXT_FOR_WHOLE_FILE.to_string(),
            description: "Replace the whole content of a file with the content provided".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "file_path": file_path,
                    "create": {"type": "boolean", "description": "Create the file when it does not exist yet"},
                    "content": {"type": "string", "description": "The new content of the file"},
                },
                "required": ["file_path", "content"],
                "additionalProperties": false,
            }),
        },
    ]
}

/// Executes the builtin functions on real files below `root`.
#[derive(Debug, Clone)]
pub struct WorkspaceTools {
    root: PathBuf,
}

impl WorkspaceTools {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        if !is_path_allowed(path) {
            return Err(ToolError::PathDenied(path.to_string()));
        }
        Ok(self.root.join(path))
    }

    async fn read_existing(&self, path: &str) -> Result<(PathBuf, String), ToolError> {
        let full = self.resolve(path)?;
        match fs::read_to_string(&full).await {
            Ok(text) => Ok((full, text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ToolError::NotFound(path.to_string()))
            }
            Err(source) => Err(ToolError::Io {
                path: path.to_string(),
                source,
            }),
        }
    }

    async fn read_region_content(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let path = str_arg(args, "file_path")?;
        let (a, b) = region_arg(args)?;
        let (_, text) = self.read_existing(path).await?;
        let total = text.chars().count();
        let start = if a < 0 { 0 } else { (a as usize).min(total) };
        let end = if b < 0 { total } else { (b as usize).min(total) };
        let region: String = text
            .chars()
            .skip(start)
            .take(end.saturating_sub(start))
            .collect();
        Ok(json!({ "content": region }).to_string())
    }

    async fn get_working_directory_content(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let path = str_arg(args, "directory_path")?;
        let dir = self.resolve(path)?;
        if !dir.is_dir() {
            return Err(ToolError::NotFound(path.to_string()));
        }
        let mut lines = Vec::new();
        for entry in WalkBuilder::new(&dir)
            .sort_by_file_name(|a, b| a.cmp(b))
            .build()
            .flatten()
        {
            if entry.depth() == 0 {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
            let indent = "  ".repeat(entry.depth() - 1);
            lines.push(format!("{indent}{name}{}", if is_dir { "/" } else { "" }));
            if lines.len() >= MAX_LISTED_ENTRIES {
                lines.push(format!("{indent}..."));
                break;
            }
        }
        Ok(json!({ "content": lines.join("\n") }).to_string())
    }

    async fn replace_text_with_another_text(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let path = str_arg(args, "file_path")?;
        let old_content = str_arg(args, "old_content")?;
        let new_content = args
            .get("new_content")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments(format!("new_content for {path}")))?;
        let (full, text) = self.read_existing(path).await?;
        let Some(byte_start) = text.find(old_content) else {
            return Err(ToolError::TextNotFound(old_content.to_string()));
        };
        let a = text[..byte_start].chars().count();
        let b = a + old_content.chars().count();
        let updated = text.replacen(old_content, new_content, 1);
        write_file(&full, path, &updated).await?;
        Ok(json!({ "a": a, "b": b }).to_string())
    }

    async fn replace_text_for_whole_file(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let path = str_arg(args, "file_path")?;
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments(format!("content for {path}")))?;
        let create = args.get("create").and_then(Value::as_bool).unwrap_or(false);
        let full = self.resolve(path)?;
        if !create && !full.is_file() {
            return Err(ToolError::NotFound(path.to_string()));
        }
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| ToolError::Io {
                    path: path.to_string(),
                    source,
                })?;
        }
        write_file(&full, path, content).await?;
        Ok(json!({ "result": content }).to_string())
    }
}

#[async_trait]
impl FunctionExecutor for WorkspaceTools {
    fn declarations(&self) -> Vec<ToolSchema> {
        builtin_declarations()
    }

    async fn execute(&self, name: &str, args: &Map<String, Value>) -> Result<String, ToolError> {
        tracing::debug!(function = name, "executing function call");
        match name {
            READ_REGION_CONTENT => self.read_region_content(args).await,
            GET_WORKING_DIRECTORY_CONTENT => self.get_working_directory_content(args).await,
            REPLACE_TEXT_WITH_ANOTHER_TEXT => self.replace_text_with_another_text(args).await,
            REPLACE_TEXT_FOR_WHOLE_FILE => self.replace_text_for_whole_file(args).await,
            other => Err(ToolError::UnknownFunction(other.to_string())),
        }
    }
}

fn is_path_allowed(path: &str) -> bool {
    let raw = Path::new(path);
    if raw.is_absolute() {
        return false;
    }
    !raw.components().any(|c| matches!(c, Component::ParentDir))
}

fn str_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing `{key}`")))
}

fn region_arg(args: &Map<String, Value>) -> Result<(i64, i64), ToolError> {
    let region = args
        .get("region")
        .and_then(Value::as_object)
        .ok_or_else(|| ToolError::InvalidArguments("missing `region`".to_string()))?;
    let bound = |key: &str| {
        region
            .get(key)
            .and_then(Value::as_i64)
            .ok_or_else(|| ToolError::InvalidArguments(format!("region.{key} must be an integer")))
    };
    Ok((bound("a")?, bound("b")?))
}

async fn write_file(full: &Path, display: &str, content: &str) -> Result<(), ToolError> {
    fs::write(full, content).await.map_err(|source| ToolError::Io {
        path: display.to_string(),
        source,
    })
}
