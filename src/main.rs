//! Companion 命令行入口
//!
//! 从标准输入读取用户消息并运行对话轮次，展示的台词打印到标准输出，后台运行任务心跳与空闲看门狗。
//!
//! 参数:
//! - `--config <path>`: 额外的配置文件（覆盖 config/default.toml）
//! - `--offline`: 使用本地 Mock 模型（回显输入），无需 API Key
//!
//! 命令: `/tasks`、`/schedule <秒> <内容>`、`/cancel <id>`、`/next`、`/skip`、`/auto on|off`、
//! `/status`、`/forget`、`/quit`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use companion::config::load_config_or_default;
use companion::core::{
    Companion, CompanionBuilder, SchedulerEvent, ShutdownCoordinator, ShutdownManager, ShutdownReason,
    StageCleanup, TaskBookCleanup,
};
use companion::llm::MockStreamClient;
use companion::playback::StageEvent;
use companion::prompt::emotion_name;
use tokio::io::{AsyncBufReadExt, BufReader};

struct Args {
    config: Option<PathBuf>,
    offline: bool,
}

fn parse_args() -> Args {
    let mut args = Args {
        config: None,
        offline: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--offline" => args.offline = true,
            "--config" => args.config = iter.next().map(PathBuf::from),
            other => eprintln!("忽略未知参数: {other}"),
        }
    }
    args
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    companion::observability::init();

    let args = parse_args();
    let config = load_config_or_default(args.config);

    let mut builder = CompanionBuilder::new(config);
    if args.offline {
        tracing::info!("Offline mode: using mock model");
        builder = builder.with_llm(Arc::new(MockStreamClient::default()));
    }
    let companion = builder.build().context("Failed to build companion runtime")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let mut handles = companion.start(shutdown.token());
    handles.push(spawn_printer(&companion));

    println!("输入消息开始聊天；/tasks 查看任务，/schedule <秒> <内容> 添加任务，/next 下一句，/status 查看状态，/quit 退出");
    run_repl(&companion, &shutdown).await;

    if !shutdown.is_shutdown() {
        shutdown.shutdown(ShutdownReason::UserInitiated);
    }
    for h in handles {
        h.abort();
    }

    let mut coordinator = ShutdownCoordinator::new();
    coordinator.register(StageCleanup(companion.queue.clone()));
    coordinator.register(TaskBookCleanup(Arc::clone(&companion.book)));
    coordinator.run_cleanup().await;
    Ok(())
}

/// 打印舞台与后台任务事件
fn spawn_printer(companion: &Companion) -> tokio::task::JoinHandle<()> {
    let mut stage = companion.queue.subscribe();
    let mut tasks = companion.scheduler.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                ev = stage.recv() => match ev {
                    Ok(StageEvent::Displayed(item)) => {
                        let emotion = emotion_name(item.emotion_code).unwrap_or("?");
                        println!("[{emotion}] {}  ({})", item.text, item.translated_text);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Stage printer lagged");
                    }
                    Err(_) => break,
                },
                ev = tasks.recv() => match ev {
                    Ok(SchedulerEvent::TaskFinished { id, result }) => {
                        tracing::info!(id = %id, kind = ?result.kind, "Scheduled task finished");
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(_) => break,
                },
            }
        }
    })
}

async fn run_repl(companion: &Companion, shutdown: &ShutdownManager) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                shutdown.shutdown(ShutdownReason::InputClosed);
                break;
            }
            Err(e) => {
                tracing::warn!("Failed to read stdin: {}", e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            shutdown.shutdown(ShutdownReason::UserInitiated);
            break;
        }
        if let Some(cmd) = line.strip_prefix('/') {
            handle_command(companion, cmd);
            continue;
        }

        let outcome = companion.orchestrator.chat(line).await;
        if let Some(e) = outcome.error {
            println!("（出错了：{e}）");
        }
    }
}

fn handle_command(companion: &Companion, cmd: &str) {
    let (name, rest) = cmd.split_once(' ').unwrap_or((cmd, ""));
    match name {
        "tasks" => {
            let stats = companion.book.stats();
            println!("共 {} 个任务", stats.total);
            for task in companion.book.tasks() {
                println!("{}  {:<12} {}", task.id, task.status.as_str(), task.content);
            }
        }
        "schedule" => {
            let (secs, content) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));
            match secs.parse::<i64>() {
                Ok(secs) if !content.trim().is_empty() => {
                    let id = companion.book.add_schedule(secs.max(0) * 1000, content.trim(), None);
                    println!("已添加任务 {id}");
                }
                _ => println!("用法: /schedule <秒> <内容>"),
            }
        }
        "cancel" => {
            if companion.book.cancel_schedule(rest.trim()) {
                println!("已取消");
            } else {
                println!("无法取消（不存在、正在执行或已结束）");
            }
        }
        "next" => companion.queue.advance(),
        "skip" => companion.queue.clear_all(),
        "auto" => match rest.trim() {
            "on" => companion.queue.set_auto_play(true),
            "off" => companion.queue.set_auto_play(false),
            _ => println!("用法: /auto on|off"),
        },
        "status" => {
            let stream = companion.orchestrator.state().snapshot();
            let stage = companion.queue.snapshot();
            println!(
                "streaming={} tooling={} idle={}s queued={} audio={} text={}",
                stream.is_streaming,
                stream.is_tooling,
                stream.last_activity_at.elapsed().as_secs(),
                stage.queued,
                stage.audio_playing,
                stage.text.as_deref().unwrap_or("-"),
            );
        }
        "forget" => {
            companion.orchestrator.clear_history();
            println!("已清空对话历史");
        }
        other => println!("未知命令: /{other}"),
    }
}
