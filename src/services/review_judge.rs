//! 批次判定 - 业务能力层
//!
//! 只负责"判定一批术语"能力：跳过已收敛的术语、构建提示词、
//! 发送请求、解析结果，再按行顺序合并。任何失败都返回 `None`，
//! 由调度器回退到原始行。

use crate::models::{ActivityLog, Judgment, TermRow};
use crate::services::convergence::{ConvergenceTracker, TermVerdict};
use crate::services::judgment_parser::{parse_reply, JudgmentReply};
use crate::services::prompt_builder::PromptBuilder;
use crate::services::request_executor::RequestExecutor;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 判定一个批次
///
/// 返回值与 `batch` 逐行对应；`None` 表示该批次失败。
#[async_trait]
pub trait BatchJudge: Send + Sync {
    async fn judge(&self, batch: &[TermRow], cancel: &CancellationToken) -> Option<Vec<TermVerdict>>;
}

/// 基于 LLM 的批次判定
///
/// 每轮新建一个实例，持有该轮开始时的历史快照。
pub struct ReviewJudge {
    executor: Arc<RequestExecutor>,
    prompts: Arc<PromptBuilder>,
    references: Arc<HashMap<String, String>>,
    history: Arc<ConvergenceTracker>,
    round: u32,
    activity: Arc<ActivityLog>,
}

impl ReviewJudge {
    pub fn new(
        executor: Arc<RequestExecutor>,
        prompts: Arc<PromptBuilder>,
        references: Arc<HashMap<String, String>>,
        history: Arc<ConvergenceTracker>,
        round: u32,
        activity: Arc<ActivityLog>,
    ) -> Self {
        Self {
            executor,
            prompts,
            references,
            history,
            round,
            activity,
        }
    }
}

#[async_trait]
impl BatchJudge for ReviewJudge {
    async fn judge(&self, batch: &[TermRow], cancel: &CancellationToken) -> Option<Vec<TermVerdict>> {
        let cached: Vec<Option<Judgment>> = batch
            .iter()
            .map(|row| self.history.cached_result(row.key(), self.round).cloned())
            .collect();

        let pending: Vec<&TermRow> = batch
            .iter()
            .zip(&cached)
            .filter(|(_, slot)| slot.is_none())
            .map(|(row, _)| row)
            .collect();

        if pending.len() < batch.len() {
            debug!(
                "第 {} 轮: 本批 {} 个术语已收敛，跳过请求",
                self.round,
                batch.len() - pending.len()
            );
        }
        if pending.is_empty() {
            return ConvergenceTracker::merge(cached, Vec::new());
        }

        if cancel.is_cancelled() {
            return None;
        }

        let items: Vec<_> = pending
            .iter()
            .map(|row| self.prompts.item(row, &self.references, &self.history))
            .collect();
        let prompt = self.prompts.build(&items);

        let text = match self.executor.execute(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                self.activity
                    .warn(format!("⚠️ 批次判定失败（{}），保留原始数据", e));
                return None;
            }
        };

        let fresh = match parse_reply(&text) {
            JudgmentReply::Parsed(judgments) => judgments,
            JudgmentReply::Malformed { reason } => {
                self.activity
                    .warn(format!("⚠️ 返回结果无法解析（{}），保留原始数据", reason));
                return None;
            }
        };

        if fresh.len() != pending.len() {
            self.activity.warn(format!(
                "⚠️ 返回 {} 条结果，与请求的 {} 条不一致，保留原始数据",
                fresh.len(),
                pending.len()
            ));
            return None;
        }

        let Some(fresh) = align_to_rows(&pending, fresh) else {
            self.activity
                .warn("⚠️ 返回的术语与请求不对应，保留原始数据");
            return None;
        };

        ConvergenceTracker::merge(cached, fresh)
    }
}

/// 按术语原文把判定对齐到请求的行
///
/// 顺序一致时原样返回；顺序被打乱时按原文重排。
/// 任何一行找不到同名判定时返回 `None`。
fn align_to_rows(rows: &[&TermRow], fresh: Vec<Judgment>) -> Option<Vec<Judgment>> {
    if rows.len() != fresh.len() {
        return None;
    }
    if rows
        .iter()
        .zip(&fresh)
        .all(|(row, judgment)| judgment.source_text.trim() == row.key())
    {
        return Some(fresh);
    }

    debug!("返回顺序与请求不一致，按原文重排");
    let mut by_term: HashMap<String, VecDeque<Judgment>> = HashMap::new();
    for judgment in fresh {
        by_term
            .entry(judgment.source_text.trim().to_string())
            .or_default()
            .push_back(judgment);
    }
    rows.iter()
        .map(|row| by_term.get_mut(row.key()).and_then(VecDeque::pop_front))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ChatBackend, RequestOptions};
    use crate::config::ProviderConfig;
    use crate::error::RequestError;
    use crate::services::prompt_builder::extract_items;
    use crate::services::provider_pool::{ProviderPool, PROBE_PREFIX};
    use crate::services::request_executor::RetryPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Copy, PartialEq)]
    enum ReplyShape {
        InOrder,
        DropLast,
        Reversed,
        Renamed,
    }

    /// 原样保留每个术语，按 `shape` 改变返回列表
    struct EchoBackend {
        calls: AtomicUsize,
        shape: ReplyShape,
    }

    impl EchoBackend {
        fn new(shape: ReplyShape) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                shape,
            })
        }
    }

    #[async_trait]
    impl ChatBackend for EchoBackend {
        async fn complete(&self, prompt: &str, _options: &RequestOptions) -> Result<String, RequestError> {
            if prompt.starts_with(PROBE_PREFIX) {
                return Ok("ok".to_string());
            }
            self.calls.fetch_add(1, Ordering::SeqCst);

            let mut items = extract_items(prompt).unwrap_or_default();
            match self.shape {
                ReplyShape::InOrder => {}
                ReplyShape::DropLast => {
                    items.pop();
                }
                ReplyShape::Reversed => items.reverse(),
                ReplyShape::Renamed => {
                    if let Some(first) = items.first_mut() {
                        first.korean_term = "의자".to_string();
                    }
                }
            }
            let replies: Vec<serde_json::Value> = items
                .iter()
                .map(|item| {
                    serde_json::json!({
                        "korean_term": item.korean_term,
                        "recommended_translation": item.chinese_translation,
                        "should_delete": item.tier == crate::services::prompt_builder::Tier::C,
                    })
                })
                .collect();
            Ok(format!("```json\n{}\n```", serde_json::Value::from(replies)))
        }
    }

    async fn judge_with(backend: Arc<EchoBackend>, history: ConvergenceTracker, round: u32) -> ReviewJudge {
        let config = ProviderConfig {
            display_name: String::new(),
            base_url: "http://localhost".to_string(),
            api_key: "k".to_string(),
            model: "echo".to_string(),
            enabled: true,
        };
        let connector = move |_: &ProviderConfig| -> Result<Arc<dyn ChatBackend>, RequestError> {
            Ok(backend.clone())
        };
        let mut pool = ProviderPool::load(&[config], &connector);
        pool.validate(Duration::from_secs(1)).await;

        let activity = Arc::new(ActivityLog::new(20));
        let executor = RequestExecutor::new(
            Arc::new(pool),
            RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(1),
            },
            RequestOptions {
                max_tokens: 100,
                temperature: 0.1,
                timeout: Duration::from_secs(1),
            },
            Arc::clone(&activity),
        );

        ReviewJudge::new(
            Arc::new(executor),
            Arc::new(PromptBuilder::new(None, "")),
            Arc::new(HashMap::new()),
            Arc::new(history),
            round,
            activity,
        )
    }

    fn keep(term: &str, translation: &str) -> Judgment {
        serde_json::from_value(serde_json::json!({
            "korean_term": term,
            "recommended_translation": translation,
            "should_delete": false,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_converged_terms_skip_the_request() {
        let backend = EchoBackend::new(ReplyShape::InOrder);
        let mut history = ConvergenceTracker::new();
        history.record("해든", keep("해든", "海灯"));
        history.record("해든", keep("해든", "海灯"));

        let judge = judge_with(backend.clone(), history, 3).await;
        let cancel = CancellationToken::new();

        let batch = vec![TermRow::new("해든", "海灯", 6)];
        let verdicts = judge.judge(&batch, &cancel).await.unwrap();
        assert!(verdicts[0].is_cached());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

        let batch = vec![TermRow::new("책상", "桌子", 1), TermRow::new("해든", "海灯", 6)];
        let verdicts = judge.judge(&batch, &cancel).await.unwrap();
        assert!(!verdicts[0].is_cached());
        assert_eq!(verdicts[0].judgment.source_text, "책상");
        assert!(verdicts[1].is_cached());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_reply_and_cancellation_fail_the_batch() {
        let backend = EchoBackend::new(ReplyShape::DropLast);
        let judge = judge_with(backend.clone(), ConvergenceTracker::new(), 1).await;
        let batch = vec![TermRow::new("책상", "桌子", 1), TermRow::new("해든", "海灯", 6)];

        let cancel = CancellationToken::new();
        assert!(judge.judge(&batch, &cancel).await.is_none());

        cancel.cancel();
        assert!(judge.judge(&batch, &cancel).await.is_none());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reordered_reply_is_matched_by_term() {
        let backend = EchoBackend::new(ReplyShape::Reversed);
        let judge = judge_with(backend.clone(), ConvergenceTracker::new(), 1).await;
        let batch = vec![TermRow::new("책상", "桌子", 1), TermRow::new("해든", "海灯", 6)];

        let verdicts = judge.judge(&batch, &CancellationToken::new()).await.unwrap();
        assert_eq!(verdicts[0].judgment.source_text, "책상");
        assert!(verdicts[0].judgment.should_delete);
        assert_eq!(verdicts[1].judgment.source_text, "해든");
        assert!(!verdicts[1].judgment.should_delete);
        assert_eq!(verdicts[1].judgment.recommended(), "海灯");
    }

    #[tokio::test]
    async fn test_substituted_term_fails_the_batch() {
        let backend = EchoBackend::new(ReplyShape::Renamed);
        let judge = judge_with(backend.clone(), ConvergenceTracker::new(), 1).await;
        let batch = vec![TermRow::new("책상", "桌子", 1), TermRow::new("해든", "海灯", 6)];

        assert!(judge.judge(&batch, &CancellationToken::new()).await.is_none());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_align_keeps_duplicate_rows_in_order() {
        let first = TermRow::new("해든", "海灯", 6);
        let second = TermRow::new("해든", "海登", 6);
        let other = TermRow::new("책상", "桌子", 1);
        let rows = vec![&first, &other, &second];

        let aligned = align_to_rows(
            &rows,
            vec![keep("책상", "桌子"), keep("해든", "海灯"), keep("해든", "海登")],
        )
        .unwrap();
        let translations: Vec<&str> = aligned.iter().map(|j| j.recommended()).collect();
        assert_eq!(translations, ["海灯", "桌子", "海登"]);
    }
}
