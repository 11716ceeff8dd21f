//! Hive - Rust 个人自主智能体运行时
//!
//! 入口：`hive run [config.toml]` 启动空闲调度器与标准输入上的操作员控制台；
//! `hive init-config` 打印默认配置（TOML）。

use std::path::PathBuf;

use anyhow::Context;
use hive::config::{load_config, render_toml, AppConfig};
use hive::goals::DEFAULT_PRIORITY;
use hive::{observability, Runtime};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

const HELP: &str = "Commands:
  <text>                      chat
  /goal [priority] <text>     create a goal (priority 1-10)
  /goals                      list goals with progress
  /tasks <goal_id>            list tasks of a goal
  /decompose <goal_id>        decompose a goal now
  /status                     scheduler, budget, circuits, alerts
  /cycles                     recent idle cycles
  /quit                       exit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_else(|| "run".to_string());
    let config_path = args.next().map(PathBuf::from);

    match command.as_str() {
        "init-config" => {
            let text = render_toml(&AppConfig::default()).context("Failed to render config")?;
            println!("{text}");
            Ok(())
        }
        "run" => run(config_path).await,
        other => anyhow::bail!("unknown command '{other}', expected 'run' or 'init-config'"),
    }
}

async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    observability::init();
    let config = load_config(config_path).context("Failed to load config")?;
    let runtime = Runtime::build(config).context("Failed to build runtime")?;
    runtime.recover().context("Startup recovery failed")?;

    let shutdown = CancellationToken::new();
    let scheduler = runtime.spawn_scheduler(shutdown.clone());
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("ctrl-c received, shutting down");
                shutdown.cancel();
            }
        });
    }

    println!("hive ready. Type /help for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        match handle_line(&runtime, line).await {
            Ok(out) => println!("{out}"),
            Err(e) => println!("error: {e:#}"),
        }
    }

    shutdown.cancel();
    scheduler.await.context("Scheduler task panicked")?;
    Ok(())
}

async fn handle_line(runtime: &Runtime, line: &str) -> anyhow::Result<String> {
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((c, r)) => (c, r.trim()),
        None => (line, ""),
    };
    let out = match cmd {
        "/help" => HELP.to_string(),
        "/goal" => {
            let (priority, text) = match rest.split_once(char::is_whitespace) {
                Some((p, t)) if p.parse::<i64>().is_ok() => (p.parse::<i64>()?, t.trim()),
                _ => (i64::from(DEFAULT_PRIORITY), rest),
            };
            anyhow::ensure!(!text.is_empty(), "usage: /goal [priority] <text>");
            let id = runtime.create_goal(text, priority)?;
            format!("created {id}")
        }
        "/goals" => {
            let goals = runtime.list_goals(None)?;
            if goals.is_empty() {
                "no goals".to_string()
            } else {
                goals
                    .iter()
                    .map(|(g, p)| {
                        let review = if g.needs_review { " [needs review]" } else { "" };
                        format!(
                            "{} p{} {} {}/{} done{}  {}",
                            g.id, g.priority, g.status, p.completed, p.total, review, g.description
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        "/tasks" => {
            anyhow::ensure!(!rest.is_empty(), "usage: /tasks <goal_id>");
            runtime
                .list_tasks(rest)?
                .iter()
                .map(|t| format!("{} #{} {} {}", t.id, t.ordinal, t.status, t.description))
                .collect::<Vec<_>>()
                .join("\n")
        }
        "/decompose" => {
            anyhow::ensure!(!rest.is_empty(), "usage: /decompose <goal_id>");
            let tasks = runtime.decompose(rest).await?;
            format!("{} tasks", tasks.len())
        }
        "/status" => serde_json::to_string_pretty(&runtime.status()?)?,
        "/cycles" => serde_json::to_string_pretty(&runtime.recent_cycles(10)?)?,
        c if c.starts_with('/') => format!("unknown command {c}\n{HELP}"),
        _ => runtime.chat(line, "console").await,
    };
    Ok(out)
}
