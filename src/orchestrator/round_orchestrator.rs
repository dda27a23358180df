//! 多轮审查编排器 - 编排层
//!
//! ## 职责
//!
//! 驱动整个审查任务的状态机：
//!
//! ```text
//! Idle → Validating → RunningRound(r) → Checkpointing(r) → RunningRound(r+1) … → Arbitrating → Completed
//!                                    ↘ Stopped / Failed
//! ```
//!
//! ## 核心功能
//!
//! 1. **校验**：每次启动重新加载配置和提供方池，没有存活的提供方直接失败
//! 2. **断点续跑**：找到最新检查点且轮次小于目标轮数时，从下一轮继续
//! 3. **轮次循环**：调度批次、单线程应用结果、更新历史、保存检查点
//! 4. **一致性终审**：最后一轮之后统一同名术语和关联角色名的译名，再写出最终术语表
//! 5. **对外接口**：`start` / `stop` / `status`，一个实例同一时间只运行一个任务
//!
//! 历史和术语表只在本任务中修改；工作任务通过 `Arc` 读取历史快照。
//! 任务体在独立的 tokio 任务中运行，panic 也会落到 `Failed`。

use crate::clients::{OpenAiConnector, ProviderConnector, RequestOptions};
use crate::config::Config;
use crate::error::{PoolError, TaskError};
use crate::models::{
    compute_percent, ActivityLog, DirectoryLoader, GlossaryLoader, TaskPhase, TaskProgress,
    TaskStatus, TermRow,
};
use crate::models::progress::STATUS_LOG_TAIL;
use crate::orchestrator::batch_scheduler::BatchScheduler;
use crate::orchestrator::round_apply::{apply_round, RoundStats};
use crate::persistence::CheckpointStore;
use crate::services::consistency::ConsistencyArbiter;
use crate::services::convergence::ConvergenceTracker;
use crate::services::prompt_builder::PromptBuilder;
use crate::services::provider_pool::ProviderPool;
use crate::services::request_executor::{RequestExecutor, RetryPolicy};
use crate::services::review_judge::ReviewJudge;
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// `start` / `stop` 等控制操作的回复
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlReply {
    pub accepted: bool,
    pub message: String,
}

impl ControlReply {
    fn accepted(message: impl Into<String>) -> Self {
        Self {
            accepted: true,
            message: message.into(),
        }
    }

    fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: message.into(),
        }
    }
}

/// 任务的结束方式（失败走 `Err`）
enum RunEnd {
    Completed,
    Stopped,
}

/// 审查引擎
///
/// 由宿主进程创建并持有；克隆后共享同一个任务状态。
#[derive(Clone)]
pub struct ReviewEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config_path: PathBuf,
    connector: Arc<dyn ProviderConnector>,
    loader: Arc<dyn GlossaryLoader>,
    running: AtomicBool,
    phase: watch::Sender<TaskPhase>,
    progress: Mutex<TaskProgress>,
    activity: Arc<ActivityLog>,
    cancel: Mutex<CancellationToken>,
    pool: Mutex<Option<Arc<ProviderPool>>>,
    disabled: Mutex<BTreeSet<String>>,
}

impl ReviewEngine {
    /// 使用默认的 API 客户端和目录加载器
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self::with_collaborators(config_path, Arc::new(OpenAiConnector), Arc::new(DirectoryLoader))
    }

    pub fn with_collaborators(
        config_path: impl Into<PathBuf>,
        connector: Arc<dyn ProviderConnector>,
        loader: Arc<dyn GlossaryLoader>,
    ) -> Self {
        let (phase, _rx) = watch::channel(TaskPhase::Idle);
        Self {
            inner: Arc::new(EngineInner {
                config_path: config_path.into(),
                connector,
                loader,
                running: AtomicBool::new(false),
                phase,
                progress: Mutex::new(TaskProgress::default()),
                activity: Arc::new(ActivityLog::new(Config::default().activity_log_capacity)),
                cancel: Mutex::new(CancellationToken::new()),
                pool: Mutex::new(None),
                disabled: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    /// 启动审查任务
    ///
    /// 已有任务运行时拒绝。任务在后台运行，通过 `status()` 查看进度。
    pub fn start(
        &self,
        directory: impl Into<PathBuf>,
        background: impl Into<String>,
        rounds: u32,
    ) -> ControlReply {
        if rounds == 0 {
            return ControlReply::rejected(TaskError::InvalidRounds.to_string());
        }
        // 占用标记和阶段在同一把锁内切换
        let claimed = self.inner.phase.send_if_modified(|phase| {
            let free = self
                .inner
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if free {
                *phase = TaskPhase::Validating;
            }
            free
        });
        if !claimed {
            return ControlReply::rejected(TaskError::Busy.to_string());
        }

        let directory = directory.into();
        let background = background.into();
        let cancel = CancellationToken::new();
        *self.inner.cancel.lock() = cancel.clone();

        self.inner.activity.clear();
        *self.inner.progress.lock() = TaskProgress {
            message: "正在启动".to_string(),
            ..TaskProgress::default()
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run_task(directory, background, rounds, cancel).await;
        });

        ControlReply::accepted(format!("任务已启动，共 {} 轮", rounds))
    }

    /// 请求停止当前任务
    ///
    /// 只发出信号；在途的批次自然结束，`running` 在任务真正退出后才释放。
    pub fn stop(&self) -> ControlReply {
        if !self.inner.running.load(Ordering::Acquire) {
            return ControlReply::rejected("当前没有运行中的任务");
        }
        self.inner.cancel.lock().cancel();
        self.inner.activity.warn("🛑 收到停止请求，正在停止...");
        ControlReply::accepted("已发送停止信号")
    }

    /// 当前状态快照
    pub fn status(&self) -> TaskStatus {
        let (running, phase) = {
            let phase = self.inner.phase.borrow();
            (self.inner.running.load(Ordering::Acquire), *phase)
        };
        TaskStatus {
            running,
            phase,
            progress: self.inner.progress.lock().clone(),
            recent_log_lines: self.inner.activity.tail(STATUS_LOG_TAIL),
        }
    }

    /// 停用一个提供方
    ///
    /// 对运行中的任务立即生效，并在本实例后续的任务中保持停用。
    pub fn disable_provider(&self, name: &str) -> ControlReply {
        let name = name.trim();
        if name.is_empty() {
            return ControlReply::rejected("提供方名称不能为空");
        }
        self.inner.disabled.lock().insert(name.to_string());

        let live = self
            .inner
            .pool
            .lock()
            .as_ref()
            .map(|pool| pool.disable(name))
            .unwrap_or(false);

        self.inner.activity.warn(format!("🚫 已停用提供方 {}", name));
        if live {
            ControlReply::accepted(format!("提供方 {} 已停用", name))
        } else {
            ControlReply::accepted(format!("提供方 {} 将在下次任务中停用", name))
        }
    }

    /// 取消停用，下次任务生效
    pub fn enable_provider(&self, name: &str) -> ControlReply {
        if self.inner.disabled.lock().remove(name.trim()) {
            ControlReply::accepted(format!("提供方 {} 已恢复", name.trim()))
        } else {
            ControlReply::rejected(format!("提供方 {} 未被停用", name.trim()))
        }
    }

    /// 等待当前任务进入终态；没有任务时立即返回
    pub async fn wait(&self) -> TaskStatus {
        let mut rx = self.inner.phase.subscribe();
        // 发送端由 inner 持有，不会关闭
        let _ = rx
            .wait_for(|phase| *phase == TaskPhase::Idle || phase.is_terminal())
            .await;
        drop(rx);
        self.status()
    }
}

impl EngineInner {
    async fn run_task(
        self: Arc<Self>,
        directory: PathBuf,
        background: String,
        rounds: u32,
        cancel: CancellationToken,
    ) {
        let worker = Arc::clone(&self);
        let outcome = tokio::spawn(async move {
            worker.drive(&directory, &background, rounds, &cancel).await
        })
        .await
        .unwrap_or_else(|e| Err(anyhow!("任务异常退出: {}", e)));
        *self.pool.lock() = None;

        let phase = match outcome {
            Ok(RunEnd::Completed) => {
                self.activity.info("🎉 全部轮次审查完成");
                let mut progress = self.progress.lock();
                progress.percent = 100;
                progress.message = "审查完成".to_string();
                TaskPhase::Completed
            }
            Ok(RunEnd::Stopped) => {
                self.activity.warn("🛑 任务已停止，已完成的轮次可以续跑");
                self.progress.lock().message = "任务已停止".to_string();
                TaskPhase::Stopped
            }
            Err(e) => {
                self.activity.error(format!("❌ 任务失败: {:#}", e));
                self.progress.lock().message = format!("任务失败: {:#}", e);
                TaskPhase::Failed
            }
        };

        self.phase.send_modify(|current| {
            self.running.store(false, Ordering::Release);
            *current = phase;
        });
    }

    async fn drive(
        &self,
        directory: &Path,
        background: &str,
        rounds: u32,
        cancel: &CancellationToken,
    ) -> Result<RunEnd> {
        // ========== 校验 ==========
        self.set_message("正在校验 API 提供方");
        let config = Config::load(&self.config_path)
            .with_context(|| format!("加载配置失败: {}", self.config_path.display()))?;
        self.activity.set_capacity(config.activity_log_capacity);

        let pool = self.validate_pool(&config).await?;

        // ========== 输入与断点 ==========
        let data = self
            .loader
            .load(directory)
            .await
            .context("加载输入文件失败")?;
        self.activity.info(format!(
            "📁 已加载术语表 {}，共 {} 条，参考上下文 {} 条",
            data.glossary_path.display(),
            data.table.len(),
            data.references.len()
        ));

        let store = CheckpointStore::new(directory);
        let (mut table, history, first_round) = self.resume_point(&store, data.table, rounds).await;
        let mut history = Arc::new(history);

        log_task_start(directory, rounds, first_round, &config);

        // ========== 轮次循环 ==========
        let executor = Arc::new(RequestExecutor::new(
            Arc::clone(&pool),
            RetryPolicy::from_config(&config),
            RequestOptions {
                max_tokens: config.max_tokens,
                temperature: config.temperature,
                timeout: config.request_timeout(),
            },
            Arc::clone(&self.activity),
        ));
        let prompts = Arc::new(PromptBuilder::new(
            config.batch_review_prompt.as_deref(),
            background,
        ));
        let references = Arc::new(data.references);
        let scheduler = BatchScheduler::new(config.batch_size, config.max_workers, Arc::clone(&self.activity));

        for round in first_round..=rounds {
            if cancel.is_cancelled() {
                return Ok(RunEnd::Stopped);
            }
            if pool.available() == 0 {
                return Err(PoolError::NoProviders.into());
            }

            self.phase.send_replace(TaskPhase::RunningRound(round));
            self.activity.info(format!(
                "🔄 第 {}/{} 轮开始，共 {} 条术语",
                round,
                rounds,
                table.len()
            ));

            let judge = Arc::new(ReviewJudge::new(
                Arc::clone(&executor),
                Arc::clone(&prompts),
                Arc::clone(&references),
                Arc::clone(&history),
                round,
                Arc::clone(&self.activity),
            ));

            let report = scheduler
                .run(&table, judge, cancel, |done, total| {
                    self.update_progress(round, rounds, done, total)
                })
                .await;

            if report.cancelled {
                self.activity
                    .warn(format!("⏹️ 第 {} 轮未完成，不保存本轮结果", round));
                return Ok(RunEnd::Stopped);
            }

            // ========== 单线程应用 ==========
            let applied = apply_round(round, report.outcomes);
            {
                let tracker = Arc::make_mut(&mut history);
                for (term, judgment) in applied.fresh {
                    tracker.record(&term, judgment);
                }
            }
            table = applied.table;

            // ========== 检查点 ==========
            self.phase.send_replace(TaskPhase::Checkpointing(round));
            if let Err(e) = store
                .save_round(round, &table, &history, &applied.entries)
                .await
            {
                self.activity
                    .error(format!("💾 第 {} 轮检查点保存失败: {}", round, e));
            }
            if let Err(e) = store.append_master_log(&applied.entries).await {
                self.activity
                    .error(format!("💾 第 {} 轮修改日志写入失败: {}", round, e));
            }

            self.log_round_complete(round, rounds, table.len(), &applied.stats);
        }

        // ========== 一致性终审 ==========
        let mut end = RunEnd::Completed;
        if config.consistency_review && !cancel.is_cancelled() {
            self.phase.send_replace(TaskPhase::Arbitrating);
            self.set_message("正在进行一致性终审");

            let arbiter = ConsistencyArbiter::new(
                Arc::clone(&executor),
                prompts.background(),
                Arc::clone(&references),
                Arc::clone(&self.activity),
            );
            let report = arbiter.run(&mut table, rounds, cancel).await;
            self.activity.info(format!(
                "⚖️ 一致性终审完成: 送审 {} 组 | 失败 {} 组 | 修改 {} 处",
                report.groups,
                report.failed,
                report.entries.len()
            ));
            if let Err(e) = store.append_master_log(&report.entries).await {
                self.activity
                    .error(format!("💾 一致性终审修改日志写入失败: {}", e));
            }
            if report.cancelled {
                self.activity.warn("⏹️ 一致性终审被中断，已完成的统一仍写入最终术语表");
                end = RunEnd::Stopped;
            }
        }

        match store.write_final(&table).await {
            Ok(path) => self
                .activity
                .info(format!("📄 最终术语表已保存: {}", path.display())),
            Err(e) => self.activity.error(format!("💾 最终术语表写入失败: {}", e)),
        }

        Ok(end)
    }

    /// 重新加载提供方池并逐个校验
    async fn validate_pool(&self, config: &Config) -> Result<Arc<ProviderPool>> {
        let mut pool = ProviderPool::load(&config.provider_configs(), self.connector.as_ref());
        self.activity
            .info(format!("🔍 正在校验 {} 个 API 提供方...", pool.loaded_len()));

        let survivors = pool.validate(config.connect_timeout()).await;
        for rejection in pool.rejected() {
            self.activity
                .warn(format!("❌ 提供方 {} 不可用: {}", rejection.label, rejection.reason));
        }
        if survivors == 0 {
            return Err(PoolError::NoValidProviders {
                checked: pool.loaded_len(),
            }
            .into());
        }
        self.activity
            .info(format!("✅ {} 个提供方校验通过", survivors));

        for name in self.disabled.lock().iter() {
            pool.disable(name);
        }

        let pool = Arc::new(pool);
        *self.pool.lock() = Some(Arc::clone(&pool));
        Ok(pool)
    }

    /// 决定从哪一轮开始
    ///
    /// 检查点读取失败时记录日志并从头开始。
    async fn resume_point(
        &self,
        store: &CheckpointStore,
        fresh_table: Vec<TermRow>,
        rounds: u32,
    ) -> (Vec<TermRow>, ConvergenceTracker, u32) {
        match store.latest_round().await {
            Ok(Some(latest)) if latest < rounds => match store.load_round(latest).await {
                Ok(checkpoint) => {
                    let next = checkpoint.round + 1;
                    self.activity.info(format!(
                        "♻️ 发现第 {} 轮检查点（{} 条术语），从第 {} 轮继续",
                        checkpoint.round,
                        checkpoint.table.len(),
                        next
                    ));
                    return (checkpoint.table, checkpoint.history, next);
                }
                Err(e) => self
                    .activity
                    .warn(format!("⚠️ 第 {} 轮检查点无法读取，将从头开始: {}", latest, e)),
            },
            Ok(Some(latest)) => self.activity.info(format!(
                "已有第 {} 轮检查点，不少于目标轮数 {}，重新开始",
                latest, rounds
            )),
            Ok(None) => {}
            Err(e) => self
                .activity
                .warn(format!("⚠️ 无法扫描检查点，将从头开始: {}", e)),
        }

        if let Err(e) = store.clear_rounds().await {
            self.activity.warn(format!("⚠️ 清理旧检查点失败: {}", e));
        }
        if let Err(e) = store.reset_master_log().await {
            self.activity.warn(format!("⚠️ 清理旧修改日志失败: {}", e));
        }
        (fresh_table, ConvergenceTracker::new(), 1)
    }

    fn set_message(&self, message: &str) {
        self.progress.lock().message = message.to_string();
    }

    fn update_progress(&self, round: u32, rounds: u32, done: usize, total: usize) {
        let mut progress = self.progress.lock();
        progress.current = done;
        progress.total = total;
        progress.percent = compute_percent(round, rounds, done, total);
        progress.message = format!("第 {}/{} 轮: {}/{}", round, rounds, done, total);
    }

    fn log_round_complete(&self, round: u32, rounds: u32, remaining: usize, stats: &RoundStats) {
        self.activity.info(format!(
            "✓ 第 {}/{} 轮完成: 保留 {} | 修改 {} | 删除 {} | 改分类 {} | 已收敛 {} | 回退 {} | 剩余 {} 条",
            round,
            rounds,
            stats.kept,
            stats.modified,
            stats.deleted,
            stats.recategorized,
            stats.cached,
            stats.fallback,
            remaining
        ));
    }
}

// ========== 日志辅助函数 ==========

fn log_task_start(directory: &Path, rounds: u32, first_round: u32, config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 术语审查任务启动: {}", directory.display());
    info!(
        "📊 目标轮数: {} (从第 {} 轮开始) | 每批 {} 条 | 并发 {}",
        rounds, first_round, config.batch_size, config.max_workers
    );
    info!("{}", "=".repeat(60));
}
