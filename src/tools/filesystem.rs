//! 沙箱文件系统工具
//!
//! SafeFs 绑定工作区根目录，所有路径经 resolve / resolve_for_write 校验必须在根下（禁止 ../ 与绝对路径逃逸）；
//! ReadFileTool / WriteFileTool / AppendFileTool / ListFilesTool 基于 SafeFs 提供文件能力。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

use crate::core::AgentError;
use crate::tools::{Capability, Tool, ToolOutput};

const LIST_MAX_DEPTH: usize = 3;
const LIST_MAX_ENTRIES: usize = 200;

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 已存在路径：规范化后检查是否在沙箱内（可识别符号链接逃逸）
    pub fn resolve(&self, path: &str) -> Result<PathBuf, AgentError> {
        let relative = self.check_relative(path)?;
        let full = self.root_dir.join(relative);
        let canonical = full
            .canonicalize()
            .map_err(|_| AgentError::NotFound(format!("Path not found: {path}")))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(AgentError::PathEscape(path.to_string()))
        }
    }

    /// 写入目标可能尚不存在：按组件检查，只允许普通组件
    pub fn resolve_for_write(&self, path: &str) -> Result<PathBuf, AgentError> {
        let relative = self.check_relative(path)?;
        if relative.as_os_str().is_empty() {
            return Err(AgentError::Tool("Missing path".into()));
        }
        Ok(self.root_dir.join(relative))
    }

    fn check_relative<'a>(&self, path: &'a str) -> Result<&'a Path, AgentError> {
        let trimmed = path.trim().trim_start_matches("./");
        let relative = Path::new(trimmed);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(AgentError::PathEscape(path.to_string())); // 如 ../../etc/passwd
        }
        Ok(relative)
    }

    pub async fn read_file(&self, path: &str) -> Result<String, AgentError> {
        let resolved = self.resolve(path)?;
        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| AgentError::Tool(format!("Read failed: {e}")))
    }

    pub async fn write_file(&self, path: &str, content: &str, append: bool) -> Result<usize, AgentError> {
        let target = self.resolve_for_write(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&target)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(content.len())
    }

    pub fn list(&self, path: &str) -> Result<Vec<String>, AgentError> {
        let base = if path.trim().is_empty() || path.trim() == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut entries = Vec::new();
        for entry in WalkDir::new(&base)
            .min_depth(1)
            .max_depth(LIST_MAX_DEPTH)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .filter_map(|e| e.ok())
        {
            let rel = entry
                .path()
                .strip_prefix(&self.root_dir)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            let suffix = if entry.file_type().is_dir() { "/" } else { "" };
            entries.push(format!("{rel}{suffix}"));
            if entries.len() >= LIST_MAX_ENTRIES {
                break;
            }
        }
        Ok(entries)
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> &'a str {
    args.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn capability(&self) -> Capability {
        Capability::ReadFile
    }

    fn description(&self) -> &str {
        "Read a workspace file. Args: {\"path\": \"relative path\"}"
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, AgentError> {
        let path = str_arg(&args, "path");
        tracing::info!(path = %path, "read_file tool execute");
        Ok(ToolOutput::text(self.fs.read_file(path).await?))
    }
}

/// 覆盖写入；AppendFileTool 共用实现
pub struct WriteFileTool {
    fs: SafeFs,
}

impl WriteFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn capability(&self) -> Capability {
        Capability::WriteFile
    }

    fn description(&self) -> &str {
        "Create or overwrite a workspace file. Args: {\"path\": \"relative path\", \"content\": \"text\"}"
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, AgentError> {
        write_with(&self.fs, &args, false).await
    }
}

pub struct AppendFileTool {
    fs: SafeFs,
}

impl AppendFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for AppendFileTool {
    fn capability(&self) -> Capability {
        Capability::AppendFile
    }

    fn description(&self) -> &str {
        "Append text to a workspace file. Args: {\"path\": \"relative path\", \"content\": \"text\"}"
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, AgentError> {
        write_with(&self.fs, &args, true).await
    }
}

async fn write_with(fs: &SafeFs, args: &Value, append: bool) -> Result<ToolOutput, AgentError> {
    let path = str_arg(args, "path").trim().to_string();
    let content = str_arg(args, "content");
    tracing::info!(path = %path, append, bytes = content.len(), "write tool execute");
    let bytes = fs.write_file(&path, content, append).await?;
    let verb = if append { "Appended" } else { "Wrote" };
    Ok(ToolOutput {
        artifact: format!("{verb} {bytes} bytes to {path}"),
        cost: 0.0,
        written: Some(path),
    })
}

pub struct ListFilesTool {
    fs: SafeFs,
}

impl ListFilesTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn capability(&self) -> Capability {
        Capability::ListFiles
    }

    fn description(&self) -> &str {
        "List workspace files recursively. Args: {\"path\": \"directory, default '.'\"}"
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, AgentError> {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        tracing::info!(path = %path, "list_files tool execute");
        let entries = self.fs.list(path)?;
        if entries.is_empty() {
            return Ok(ToolOutput::text("(empty)"));
        }
        Ok(ToolOutput::text(entries.join("\n")))
    }
}
