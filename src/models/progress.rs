//! 任务进度、阶段与活动日志
//!
//! 编排器独占写入，外部通过 `status()` 轮询读取。

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{error, info, warn};

/// `status()` 返回的最近日志行数
pub const STATUS_LOG_TAIL: usize = 20;

/// 任务所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "round")]
pub enum TaskPhase {
    Idle,
    Validating,
    RunningRound(u32),
    Checkpointing(u32),
    /// 一致性终审
    Arbitrating,
    Completed,
    Stopped,
    Failed,
}

impl TaskPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskPhase::Completed | TaskPhase::Stopped | TaskPhase::Failed
        )
    }
}

/// 进度快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskProgress {
    /// 当前轮已处理的行数
    pub current: usize,
    /// 当前轮的总行数
    pub total: usize,
    /// 跨轮累计百分比
    pub percent: u8,
    pub message: String,
}

impl Default for TaskProgress {
    fn default() -> Self {
        Self {
            current: 0,
            total: 0,
            percent: 0,
            message: "Idle".to_string(),
        }
    }
}

/// 累计进度百分比
///
/// 每一轮占 `1/total_rounds`，轮内按 `done/rows` 计算。
/// 行数不变时等于 `((round-1)*rows + done) / (rows*total_rounds)`。
pub fn compute_percent(round: u32, total_rounds: u32, done: usize, rows: usize) -> u8 {
    if total_rounds == 0 {
        return 100;
    }
    let round = round.clamp(1, total_rounds) as u64;
    let total_rounds = total_rounds as u64;

    let (done, rows) = if rows == 0 {
        (1, 1)
    } else {
        (done.min(rows) as u64, rows as u64)
    };

    let numerator = (round - 1) * rows + done;
    let denominator = rows * total_rounds;
    (numerator * 100 / denominator).min(100) as u8
}

/// 外部轮询得到的任务状态
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub running: bool,
    pub phase: TaskPhase,
    pub progress: TaskProgress,
    pub recent_log_lines: Vec<String>,
}

/// 有界的活动日志
///
/// 每条记录同时写入 tracing。
#[derive(Debug)]
pub struct ActivityLog {
    lines: Mutex<VecDeque<String>>,
    capacity: AtomicUsize,
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: AtomicUsize::new(capacity),
        }
    }

    /// 调整容量，超出的旧行立即丢弃
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        self.capacity.store(capacity, Ordering::Relaxed);
        let mut lines = self.lines.lock();
        while lines.len() > capacity {
            lines.pop_front();
        }
    }

    pub fn info(&self, message: impl AsRef<str>) {
        info!("{}", message.as_ref());
        self.push(message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        warn!("{}", message.as_ref());
        self.push(message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        error!("{}", message.as_ref());
        self.push(message.as_ref());
    }

    fn push(&self, message: &str) {
        let line = format!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), message);
        let capacity = self.capacity.load(Ordering::Relaxed);
        let mut lines = self.lines.lock();
        lines.push_back(line);
        while lines.len() > capacity {
            lines.pop_front();
        }
    }

    /// 最近 `n` 行，按时间顺序
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_matches_constant_row_formula() {
        // rows=10, rounds=4: ((r-1)*10 + done) / 40
        assert_eq!(compute_percent(1, 4, 0, 10), 0);
        assert_eq!(compute_percent(1, 4, 5, 10), 12);
        assert_eq!(compute_percent(2, 4, 10, 10), 50);
        assert_eq!(compute_percent(4, 4, 10, 10), 100);
        assert_eq!(compute_percent(3, 4, 3, 10), 57);
    }

    #[test]
    fn test_percent_handles_shrinking_and_empty_rounds() {
        assert_eq!(compute_percent(2, 2, 3, 3), 100);
        assert_eq!(compute_percent(2, 2, 0, 0), 100);
        assert_eq!(compute_percent(1, 1, 50, 10), 100);
    }

    #[test]
    fn test_activity_log_is_bounded() {
        let log = ActivityLog::new(3);
        for i in 0..5 {
            log.info(format!("line {}", i));
        }
        assert_eq!(log.len(), 3);

        let tail = log.tail(2);
        assert_eq!(tail.len(), 2);
        assert!(tail[0].ends_with("line 3"));
        assert!(tail[1].ends_with("line 4"));

        log.set_capacity(1);
        assert_eq!(log.len(), 1);
        assert!(log.tail(5)[0].ends_with("line 4"));

        log.clear();
        assert!(log.is_empty());
    }
}
