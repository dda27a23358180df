//! 日志工具模块
//!
//! 提供日志初始化和输出的辅助函数

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// 初始化日志
///
/// 级别由 `RUST_LOG` 控制，默认 `info`。重复调用时忽略。
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// 记录程序启动信息
///
/// # 参数
/// - `directory`: 任务目录
/// - `rounds`: 目标轮数
pub fn log_startup(directory: &str, rounds: u32) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 多轮术语审查模式");
    info!("📁 任务目录: {}", directory);
    info!("🔁 目标轮数: {}", rounds);
    info!("{}", "=".repeat(60));
}

/// 打印最终统计信息
///
/// # 参数
/// - `phase`: 结束状态
/// - `output_path`: 输出位置
pub fn print_final_stats(phase: &str, output_path: &str) {
    info!("\n{}", "=".repeat(60));
    info!("📊 审查任务结束: {}", phase);
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("\n结果已保存至: {}", output_path);
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}
