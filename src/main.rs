use anyhow::{Context, Result};
use clap::Parser;
use glossary_review::config::DEFAULT_CONFIG_FILE;
use glossary_review::error::{AppError, FileError};
use glossary_review::persistence::FINAL_GLOSSARY_FILE;
use glossary_review::utils::logging;
use glossary_review::{ReviewEngine, TaskPhase, TaskStatus};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

/// 多轮术语审查
#[derive(Parser, Debug)]
#[command(name = "glossary-review", version, about)]
struct Args {
    /// 任务目录（包含术语表 .toml 和参考文件 .txt）
    directory: PathBuf,

    /// 审查轮数
    #[arg(short, long, env = "REVIEW_ROUNDS", default_value_t = 1)]
    rounds: u32,

    /// 配置文件路径
    #[arg(short, long, env = "REVIEW_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// 小说背景设定
    #[arg(long, conflicts_with = "background_file")]
    background: Option<String>,

    /// 从文件读取小说背景设定
    #[arg(long)]
    background_file: Option<PathBuf>,

    /// 状态输出间隔（秒）
    #[arg(long, default_value_t = 5)]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    logging::init();

    let args = Args::parse();
    let background = load_background(&args)?;

    logging::log_startup(&args.directory.display().to_string(), args.rounds);

    let engine = ReviewEngine::new(&args.config);
    let reply = engine.start(&args.directory, background, args.rounds);
    if !reply.accepted {
        anyhow::bail!("任务未能启动: {}", reply.message);
    }
    info!("{}", reply.message);

    let mut ticker = tokio::time::interval(Duration::from_secs(args.status_interval.max(1)));
    ticker.tick().await;

    let status = loop {
        tokio::select! {
            status = engine.wait() => break status,
            _ = tokio::signal::ctrl_c() => {
                warn!("收到 Ctrl-C，正在停止任务...");
                engine.stop();
            }
            _ = ticker.tick() => print_status(&engine.status()),
        }
    };

    let output = args.directory.join(FINAL_GLOSSARY_FILE);
    match status.phase {
        TaskPhase::Completed => {
            logging::print_final_stats("完成", &output.display().to_string());
            Ok(())
        }
        TaskPhase::Stopped => {
            logging::print_final_stats("已停止", &args.directory.display().to_string());
            Ok(())
        }
        _ => {
            for line in &status.recent_log_lines {
                error!("{}", line);
            }
            anyhow::bail!("{}", status.progress.message)
        }
    }
}

fn load_background(args: &Args) -> Result<String> {
    if let Some(text) = &args.background {
        return Ok(text.clone());
    }
    match &args.background_file {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| AppError::from(FileError::read_failed(path, e)))
            .context("读取背景设定失败"),
        None => Ok(String::new()),
    }
}

fn print_status(status: &TaskStatus) {
    info!(
        "📈 [{:?}] {}% {}",
        status.phase, status.progress.percent, status.progress.message
    );
}
