//! `file` — filesystem operations.
//!
//! Operations: `read`, `write`, `append`, `mkdir`, `rm`, `list`, `exists`,
//! `copy`, `move`, `stat`. With a root configured, relative paths resolve
//! under it and nothing outside it can be touched.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use cortex_core::error::ToolError;
use cortex_core::tool::Tool;
use tracing::debug;

pub const NAME: &str = "file";

#[derive(Default)]
pub struct FileTool {
    root: Option<PathBuf>,
}

impl FileTool {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    fn resolve(&self, raw: &str) -> Result<PathBuf, ToolError> {
        if raw.is_empty() {
            return Err(ToolError::InvalidArguments("Empty path".into()));
        }
        let path = Path::new(raw);
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(denied(format!("Path traversal in '{raw}'")));
        }
        let Some(root) = &self.root else {
            return Ok(path.to_path_buf());
        };
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };
        if !joined.starts_with(root) {
            return Err(denied(format!("'{raw}' is outside {}", root.display())));
        }
        Ok(joined)
    }
}

fn denied(reason: String) -> ToolError {
    ToolError::PermissionDenied {
        tool_name: NAME.into(),
        reason,
    }
}

fn io_err(op: &str, path: &Path, e: std::io::Error) -> ToolError {
    ToolError::ExecutionFailed {
        tool_name: NAME.into(),
        reason: format!("{op} {}: {e}", path.display()),
    }
}

fn required<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolError> {
    args[key]
        .as_str()
        .ok_or_else(|| ToolError::InvalidArguments(format!("Missing '{key}' argument")))
}

#[async_trait]
impl Tool for FileTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Work with files and directories: read, write, append, mkdir, rm, list, exists, copy, move, stat."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "operation": {
                    "type": "string",
                    "enum": ["read", "write", "append", "mkdir", "rm", "list", "exists", "copy", "move", "stat"]
                },
                "path": { "type": "string", "description": "Target path" },
                "content": { "type": "string", "description": "Text for write/append" },
                "destination": { "type": "string", "description": "Target of copy/move" },
                "recursive": { "type": "boolean", "description": "mkdir -p / rm -r" }
            },
            "required": ["operation", "path"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let op = required(&arguments, "operation")?;
        let path = self.resolve(required(&arguments, "path")?)?;
        let recursive = arguments["recursive"].as_bool().unwrap_or(false);
        debug!(operation = op, path = %path.display(), "File operation");

        match op {
            "read" => {
                let content = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| io_err("read", &path, e))?;
                Ok(serde_json::json!({ "content": content }))
            }
            "write" | "append" => {
                let content = required(&arguments, "content")?;
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| io_err("mkdir", parent, e))?;
                }
                if op == "write" {
                    tokio::fs::write(&path, content)
                        .await
                        .map_err(|e| io_err("write", &path, e))?;
                } else {
                    use tokio::io::AsyncWriteExt;
                    let mut file = tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .await
                        .map_err(|e| io_err("open", &path, e))?;
                    file.write_all(content.as_bytes())
                        .await
                        .map_err(|e| io_err("append", &path, e))?;
                }
                Ok(serde_json::json!({ "path": path.display().to_string(), "bytes": content.len() }))
            }
            "mkdir" => {
                let result = if recursive {
                    tokio::fs::create_dir_all(&path).await
                } else {
                    tokio::fs::create_dir(&path).await
                };
                result.map_err(|e| io_err("mkdir", &path, e))?;
                Ok(serde_json::json!({ "path": path.display().to_string(), "created": true }))
            }
            "rm" => {
                let meta = tokio::fs::metadata(&path)
                    .await
                    .map_err(|e| io_err("stat", &path, e))?;
                let result = if meta.is_dir() {
                    if recursive {
                        tokio::fs::remove_dir_all(&path).await
                    } else {
                        tokio::fs::remove_dir(&path).await
                    }
                } else {
                    tokio::fs::remove_file(&path).await
                };
                result.map_err(|e| io_err("rm", &path, e))?;
                Ok(serde_json::json!({ "path": path.display().to_string(), "removed": true }))
            }
            "list" => {
                let mut dir = tokio::fs::read_dir(&path)
                    .await
                    .map_err(|e| io_err("list", &path, e))?;
                let mut entries = Vec::new();
                while let Some(entry) = dir.next_entry().await.map_err(|e| io_err("list", &path, e))? {
                    let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                    entries.push(serde_json::json!({
                        "name": entry.file_name().to_string_lossy(),
                        "is_dir": is_dir,
                    }));
                }
                entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
                Ok(serde_json::json!({ "entries": entries }))
            }
            "exists" => Ok(serde_json::json!({
                "exists": tokio::fs::try_exists(&path).await.unwrap_or(false)
            })),
            "copy" | "move" => {
                let dest = self.resolve(required(&arguments, "destination")?)?;
                if op == "copy" {
                    tokio::fs::copy(&path, &dest)
                        .await
                        .map_err(|e| io_err("copy", &path, e))?;
                } else {
                    tokio::fs::rename(&path, &dest)
                        .await
                        .map_err(|e| io_err("move", &path, e))?;
                }
                Ok(serde_json::json!({
                    "from": path.display().to_string(),
                    "to": dest.display().to_string(),
                }))
            }
            "stat" => {
                let meta = tokio::fs::metadata(&path)
                    .await
                    .map_err(|e| io_err("stat", &path, e))?;
                let modified = meta
                    .modified()
                    .ok()
                    .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339());
                Ok(serde_json::json!({
                    "size": meta.len(),
                    "is_dir": meta.is_dir(),
                    "is_file": meta.is_file(),
                    "readonly": meta.permissions().readonly(),
                    "modified": modified,
                }))
            }
            other => Err(ToolError::InvalidArguments(format!("Unknown operation: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_append_read_stat_rm() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FileTool::new(Some(dir.path().to_path_buf()));

        tool.execute(serde_json::json!({"operation": "write", "path": "notes/a.txt", "content": "one"}))
            .await
            .unwrap();
        tool.execute(serde_json::json!({"operation": "append", "path": "notes/a.txt", "content": "two"}))
            .await
            .unwrap();
        let read = tool
            .execute(serde_json::json!({"operation": "read", "path": "notes/a.txt"}))
            .await
            .unwrap();
        assert_eq!(read["content"], "onetwo");

        let stat = tool
            .execute(serde_json::json!({"operation": "stat", "path": "notes/a.txt"}))
            .await
            .unwrap();
        assert_eq!(stat["size"], 6);
        assert_eq!(stat["is_file"], true);

        tool.execute(serde_json::json!({"operation": "copy", "path": "notes/a.txt", "destination": "b.txt"}))
            .await
            .unwrap();
        let list = tool
            .execute(serde_json::json!({"operation": "list", "path": "."}))
            .await
            .unwrap();
        let names: Vec<&str> = list["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["b.txt", "notes"]);

        tool.execute(serde_json::json!({"operation": "rm", "path": "notes", "recursive": true}))
            .await
            .unwrap();
        let exists = tool
            .execute(serde_json::json!({"operation": "exists", "path": "notes/a.txt"}))
            .await
            .unwrap();
        assert_eq!(exists["exists"], false);
    }

    #[tokio::test]
    async fn root_confines_paths() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FileTool::new(Some(dir.path().to_path_buf()));
        let traversal = tool
            .execute(serde_json::json!({"operation": "read", "path": "../../etc/passwd"}))
            .await;
        assert!(matches!(traversal, Err(ToolError::PermissionDenied { .. })));
        let outside = tool
            .execute(serde_json::json!({"operation": "read", "path": "/etc/hostname"}))
            .await;
        assert!(matches!(outside, Err(ToolError::PermissionDenied { .. })));
    }

    #[tokio::test]
    async fn bad_arguments() {
        let tool = FileTool::default();
        assert!(matches!(
            tool.execute(serde_json::json!({"operation": "read"})).await,
            Err(ToolError::InvalidArguments(_))
        ));
        assert!(matches!(
            tool.execute(serde_json::json!({"operation": "chmod", "path": "/tmp"})).await,
            Err(ToolError::InvalidArguments(_))
        ));
        assert!(matches!(
            tool.execute(serde_json::json!({"operation": "read", "path": "/nonexistent/cortex/x"})).await,
            Err(ToolError::ExecutionFailed { .. })
        ));
    }
}
