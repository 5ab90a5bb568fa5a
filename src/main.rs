//! DeskPilot 命令行入口
//!
//! 用法：`deskpilot [--yes] [--config <path>] <instruction...>`
//! 进度事件逐行输出为 JSON，最后输出 TaskResult。敏感步骤在终端询问确认，`--yes` 时自动同意。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use serde_json::Map;
use tokio::io::{AsyncBufReadExt, BufReader};

use deskpilot::agent::Agent;
use deskpilot::config::{load_config, AppConfig};
use deskpilot::observability;
use deskpilot::runtime::ProgressEvent;

struct CliArgs {
    auto_confirm: bool,
    config: Option<PathBuf>,
    instruction: String,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut auto_confirm = false;
    let mut config = None;
    let mut words = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-y" | "--yes" => auto_confirm = true,
            "-c" | "--config" => {
                config = Some(PathBuf::from(args.next().context("--config needs a path")?));
            }
            "-h" | "--help" => {
                println!("usage: deskpilot [--yes] [--config <path>] <instruction...>");
                std::process::exit(0);
            }
            _ => words.push(arg),
        }
    }
    let instruction = words.join(" ");
    if instruction.trim().is_empty() {
        bail!("no instruction given (usage: deskpilot [--yes] [--config <path>] <instruction...>)");
    }
    Ok(CliArgs {
        auto_confirm,
        config,
        instruction,
    })
}

async fn ask(description: &str) -> bool {
    eprint!("Allow sensitive step \"{description}\"? [y/N] ");
    let mut line = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    match stdin.read_line(&mut line).await {
        Ok(_) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
        Err(_) => false,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let args = parse_args()?;

    let cfg = load_config(args.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let agent = Arc::new(Agent::builder(cfg).build());

    let mut run = agent.start(&args.instruction, Map::new());
    while let Some(event) = run.events.recv().await {
        println!("{}", event.to_json());
        if let ProgressEvent::SensitiveOperationDetected {
            step_id,
            description,
            ..
        } = &event
        {
            let approved = args.auto_confirm || ask(description).await;
            run.handle.confirm(step_id, approved);
        }
    }

    let result = run.join.await.context("task run panicked")?;
    agent.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
