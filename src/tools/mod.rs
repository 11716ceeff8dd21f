//! 工具能力：按能力查表分发的文件、检索、命令工具

pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod search;
pub mod shell;

use std::path::Path;

pub use executor::ToolExecutor;
pub use filesystem::{AppendFileTool, ListFilesTool, ReadFileTool, SafeFs, WriteFileTool};
pub use registry::{Capability, Tool, ToolOutput, ToolRegistry};
pub use search::{FetchTool, WebSearchTool};
pub use shell::CommandTool;

use crate::config::ToolsSection;

/// 按配置注册全部内置工具，文件与命令工具绑定到工作区
pub fn default_registry(workspace: &Path, cfg: &ToolsSection) -> ToolRegistry {
    let fs = SafeFs::new(workspace);
    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool::new(fs.clone()));
    registry.register(WriteFileTool::new(fs.clone()));
    registry.register(AppendFileTool::new(fs.clone()));
    registry.register(ListFilesTool::new(fs.clone()));
    registry.register(CommandTool::new(
        cfg.shell.allowed_commands.clone(),
        fs.root().to_path_buf(),
        cfg.tool_timeout_secs,
    ));
    registry.register(WebSearchTool::new(&cfg.search, cfg.tool_timeout_secs));
    registry.register(FetchTool::new(&cfg.search, cfg.tool_timeout_secs));
    registry
}
