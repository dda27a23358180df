//! 批次调度器 - 编排层
//!
//! ## 职责
//!
//! 把一轮的术语表切成固定大小的批次，交给有界的工作池并发判定，
//! 按批次序号收集结果，全部到齐（或任务取消）后按原始顺序还原。
//!
//! ## 设计特点
//!
//! - **并发控制**：`Semaphore` 限制同时运行的批次数，`JoinSet` 收集完成的任务
//! - **顺序还原**：工作任务只返回 `(批次序号, 结果)`，顺序由调度器恢复
//! - **失败回退**：结果缺失或条数不符时整批使用原始行
//! - **协作取消**：提交前、工作任务开始前都检查取消令牌，取消后只短暂等待在途批次

use crate::models::{ActivityLog, TermRow};
use crate::services::convergence::TermVerdict;
use crate::services::review_judge::BatchJudge;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 取消后等待在途批次的默认时长
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(2);

/// 单个批次的最终结果
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// 判定成功，`verdicts` 与 `rows` 逐行对应
    Judged {
        rows: Vec<TermRow>,
        verdicts: Vec<TermVerdict>,
    },
    /// 判定失败，原样保留
    Fallback { rows: Vec<TermRow> },
}

impl BatchOutcome {
    pub fn rows(&self) -> &[TermRow] {
        match self {
            BatchOutcome::Judged { rows, .. } | BatchOutcome::Fallback { rows } => rows,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, BatchOutcome::Fallback { .. })
    }
}

/// 一轮调度的结果
#[derive(Debug, Clone)]
pub struct ScheduleReport {
    /// 按批次序号排列
    pub outcomes: Vec<BatchOutcome>,
    pub cancelled: bool,
}

impl ScheduleReport {
    /// 按原始顺序展开的行
    pub fn rows(&self) -> impl Iterator<Item = &TermRow> {
        self.outcomes.iter().flat_map(|o| o.rows())
    }

    pub fn fallback_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_fallback()).count()
    }
}

/// 批次调度器
#[derive(Debug, Clone)]
pub struct BatchScheduler {
    batch_size: usize,
    max_workers: usize,
    grace: Duration,
    activity: Arc<ActivityLog>,
}

type BatchResult = (usize, Option<Vec<TermVerdict>>);

impl BatchScheduler {
    pub fn new(batch_size: usize, max_workers: usize, activity: Arc<ActivityLog>) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_workers: max_workers.max(1),
            grace: DEFAULT_CANCEL_GRACE,
            activity,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// 切分出的批次区间
    pub fn batch_ranges(&self, len: usize) -> Vec<Range<usize>> {
        (0..len)
            .step_by(self.batch_size)
            .map(|start| start..(start + self.batch_size).min(len))
            .collect()
    }

    /// 调度一轮
    ///
    /// `on_progress(done, total)` 在每个批次结果到达时调用（包括失败的批次），
    /// `done` 每次增加 `batch_size`，不超过 `total`。
    pub async fn run<J>(
        &self,
        table: &[TermRow],
        judge: Arc<J>,
        cancel: &CancellationToken,
        mut on_progress: impl FnMut(usize, usize),
    ) -> ScheduleReport
    where
        J: BatchJudge + ?Sized + 'static,
    {
        let total_rows = table.len();
        let ranges = self.batch_ranges(total_rows);
        let total_batches = ranges.len();

        info!(
            "📦 共 {} 条术语，分为 {} 批（每批 {} 条，并发 {}）",
            total_rows, total_batches, self.batch_size, self.max_workers
        );

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut join_set: JoinSet<BatchResult> = JoinSet::new();
        let mut slots: Vec<Option<Option<Vec<TermVerdict>>>> = vec![None; total_batches];
        let mut done_rows = 0usize;
        let mut next_batch = 0usize;

        let mut absorb = |joined: Result<BatchResult, JoinError>,
                          slots: &mut Vec<Option<Option<Vec<TermVerdict>>>>| {
            match joined {
                Ok((index, result)) => {
                    debug!("批次 {}/{} 已返回", index + 1, total_batches);
                    slots[index] = Some(result);
                }
                Err(e) => error!("批次任务异常退出: {}", e),
            }
            done_rows = (done_rows + self.batch_size).min(total_rows);
            on_progress(done_rows, total_rows);
        };

        loop {
            if next_batch == total_batches && join_set.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(joined) = join_set.join_next(), if !join_set.is_empty() => {
                    absorb(joined, &mut slots);
                }

                permit = Arc::clone(&semaphore).acquire_owned(), if next_batch < total_batches => {
                    let Ok(permit) = permit else { break };
                    let index = next_batch;
                    next_batch += 1;

                    let rows = table[ranges[index].clone()].to_vec();
                    let judge = Arc::clone(&judge);
                    let cancel = cancel.clone();

                    join_set.spawn(async move {
                        let _permit = permit;
                        if cancel.is_cancelled() {
                            return (index, None);
                        }
                        (index, judge.judge(&rows, &cancel).await)
                    });
                }
            }
        }

        let cancelled = cancel.is_cancelled();
        if cancelled && !join_set.is_empty() {
            self.activity.warn(format!(
                "🛑 收到停止信号，等待 {} 个在途批次（最多 {:.0} 秒）",
                join_set.len(),
                self.grace.as_secs_f64()
            ));
            let drain = async {
                while let Some(joined) = join_set.join_next().await {
                    absorb(joined, &mut slots);
                }
            };
            let _ = tokio::time::timeout(self.grace, drain).await;
            // 剩余任务自然结束，不强行中止
            join_set.detach_all();
        }

        let outcomes = ranges
            .into_iter()
            .zip(slots)
            .enumerate()
            .map(|(index, (range, slot))| {
                let rows = table[range].to_vec();
                match slot {
                    Some(Some(verdicts)) if verdicts.len() == rows.len() => {
                        BatchOutcome::Judged { rows, verdicts }
                    }
                    Some(Some(verdicts)) => {
                        self.activity.warn(format!(
                            "⚠️ 批次 {} 返回 {} 条结果，与 {} 行不一致，保留原始数据",
                            index + 1,
                            verdicts.len(),
                            rows.len()
                        ));
                        BatchOutcome::Fallback { rows }
                    }
                    Some(None) => {
                        self.activity
                            .warn(format!("⚠️ 批次 {} 判定失败，保留原始数据", index + 1));
                        BatchOutcome::Fallback { rows }
                    }
                    None => {
                        if !cancelled {
                            self.activity
                                .warn(format!("⚠️ 批次 {} 没有结果，保留原始数据", index + 1));
                        }
                        BatchOutcome::Fallback { rows }
                    }
                }
            })
            .collect();

        ScheduleReport { outcomes, cancelled }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Judgment;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn keep(row: &TermRow) -> TermVerdict {
        TermVerdict::fresh(Judgment {
            source_text: row.source_text.clone(),
            original_translation: None,
            recommended_translation: Some(format!("{}!", row.current_translation)),
            should_delete: false,
            deletion_reason: None,
            justification: String::new(),
            judgment_emoji: String::new(),
            suggested_category: None,
        })
    }

    fn table(n: usize) -> Vec<TermRow> {
        (0..n)
            .map(|i| TermRow::new(format!("t{}", i), format!("译{}", i), 1))
            .collect()
    }

    /// 越靠前的批次越晚完成
    struct ReversedDelays {
        total: usize,
    }

    #[async_trait]
    impl BatchJudge for ReversedDelays {
        async fn judge(&self, batch: &[TermRow], _cancel: &CancellationToken) -> Option<Vec<TermVerdict>> {
            let index: usize = batch[0].source_text[1..].parse().ok()?;
            let delay = (self.total - index) as u64 * 3;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Some(batch.iter().map(keep).collect())
        }
    }

    /// 按批次首行决定失败方式
    struct Flaky;

    #[async_trait]
    impl BatchJudge for Flaky {
        async fn judge(&self, batch: &[TermRow], _cancel: &CancellationToken) -> Option<Vec<TermVerdict>> {
            match batch[0].source_text.as_str() {
                "t0" => None,
                "t2" => Some(vec![keep(&batch[0])]),
                _ => Some(batch.iter().map(keep).collect()),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_order_is_restored_after_out_of_order_completion() {
        let rows = table(10);
        let scheduler = BatchScheduler::new(1, 4, Arc::new(ActivityLog::new(50)));
        let mut progress = Vec::new();

        let report = scheduler
            .run(
                &rows,
                Arc::new(ReversedDelays { total: 10 }),
                &CancellationToken::new(),
                |done, total| progress.push((done, total)),
            )
            .await;

        assert!(!report.cancelled);
        assert_eq!(report.fallback_count(), 0);
        let restored: Vec<TermRow> = report.rows().cloned().collect();
        assert_eq!(restored, rows);

        for (outcome, row) in report.outcomes.iter().zip(&rows) {
            match outcome {
                BatchOutcome::Judged { verdicts, .. } => {
                    assert_eq!(verdicts[0].judgment.source_text, row.source_text);
                }
                other => panic!("unexpected fallback: {:?}", other),
            }
        }

        assert_eq!(progress.len(), 10);
        assert_eq!(progress.last(), Some(&(10, 10)));
    }

    #[tokio::test]
    async fn test_failed_or_short_batches_fall_back_to_original_rows() {
        let rows = table(5);
        let scheduler = BatchScheduler::new(2, 2, Arc::new(ActivityLog::new(50)));
        let mut last = (0, 0);

        let report = scheduler
            .run(&rows, Arc::new(Flaky), &CancellationToken::new(), |done, total| {
                last = (done, total)
            })
            .await;

        assert_eq!(report.outcomes.len(), 3);
        assert!(report.outcomes[0].is_fallback());
        assert!(report.outcomes[1].is_fallback());
        assert!(!report.outcomes[2].is_fallback());
        assert_eq!(report.outcomes[0].rows(), &rows[0..2]);
        assert_eq!(report.outcomes[1].rows(), &rows[2..4]);
        assert_eq!(last, (5, 5));
    }

    /// 第一个批次触发取消，其余批次计数
    struct CancelOnFirst {
        cancel: CancellationToken,
        started: AtomicUsize,
    }

    #[async_trait]
    impl BatchJudge for CancelOnFirst {
        async fn judge(&self, batch: &[TermRow], cancel: &CancellationToken) -> Option<Vec<TermVerdict>> {
            self.started.fetch_add(1, Ordering::SeqCst);
            if cancel.is_cancelled() {
                return None;
            }
            self.cancel.cancel();
            Some(batch.iter().map(keep).collect())
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_submission() {
        let rows = table(6);
        let cancel = CancellationToken::new();
        let judge = Arc::new(CancelOnFirst {
            cancel: cancel.clone(),
            started: AtomicUsize::new(0),
        });
        let scheduler = BatchScheduler::new(1, 1, Arc::new(ActivityLog::new(50)))
            .with_grace(Duration::from_millis(100));

        let report = scheduler.run(&rows, Arc::clone(&judge), &cancel, |_, _| {}).await;

        assert!(report.cancelled);
        assert_eq!(judge.started.load(Ordering::SeqCst), 1);
        assert_eq!(report.rows().count(), 6);
        assert!(report.fallback_count() >= 5);
    }

    #[test]
    fn test_batch_ranges() {
        let scheduler = BatchScheduler::new(4, 2, Arc::new(ActivityLog::new(5)));
        assert_eq!(scheduler.batch_ranges(10), vec![0..4, 4..8, 8..10]);
        assert!(scheduler.batch_ranges(0).is_empty());
    }
}
