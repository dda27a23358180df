//! 请求执行器 - 业务能力层
//!
//! 发送一次批量判定请求：有限次重试、每次轮换提供方、
//! 遇到限流时暂停所有并发请求直到触发方完成重试。

use crate::clients::RequestOptions;
use crate::config::Config;
use crate::error::{ErrorKind, ExecuteError, RequestError};
use crate::models::ActivityLog;
use crate::services::provider_pool::ProviderPool;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.retry_base_delay(),
        }
    }

    /// `base_delay * 2^attempt`
    pub fn min_delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// 限流退避时长：`base_delay * 2^attempt + jitter`
    ///
    /// 抖动小于 `min(base_delay, 1s)`，保证随 attempt 单调不减。
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let cap = self.base_delay.min(Duration::from_secs(1)).as_secs_f64();
        let jitter = if cap > 0.0 {
            Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..cap))
        } else {
            Duration::ZERO
        };
        self.min_delay(attempt).saturating_add(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
        }
    }
}

/// 全局限流暂停标记
///
/// 只有把标记从 false 置为 true 的调用方拿到 `PauseGuard`，
/// guard 释放时清除标记。
#[derive(Debug)]
pub struct PauseGate {
    tx: watch::Sender<bool>,
}

/// 持有期间所有其他请求等待
#[derive(Debug)]
pub struct PauseGuard<'a> {
    gate: &'a PauseGate,
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// 置位暂停标记；已经处于暂停状态时返回 `None`
    pub fn raise(&self) -> Option<PauseGuard<'_>> {
        let raised = self.tx.send_if_modified(|paused| {
            if *paused {
                false
            } else {
                *paused = true;
                true
            }
        });
        raised.then_some(PauseGuard { gate: self })
    }

    /// 等待暂停标记清除
    pub async fn wait_until_clear(&self) {
        let mut rx = self.tx.subscribe();
        // 发送端由 self 持有，不会关闭
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.gate.tx.send_replace(false);
    }
}

/// 请求执行器
pub struct RequestExecutor {
    pool: Arc<ProviderPool>,
    policy: RetryPolicy,
    options: RequestOptions,
    gate: PauseGate,
    activity: Arc<ActivityLog>,
}

impl RequestExecutor {
    pub fn new(
        pool: Arc<ProviderPool>,
        policy: RetryPolicy,
        options: RequestOptions,
        activity: Arc<ActivityLog>,
    ) -> Self {
        Self {
            pool,
            policy,
            options,
            gate: PauseGate::new(),
            activity,
        }
    }

    pub fn pool(&self) -> &ProviderPool {
        &self.pool
    }

    pub fn gate(&self) -> &PauseGate {
        &self.gate
    }

    /// 执行一次判定请求，返回原始文本
    ///
    /// 重试耗尽或没有可用提供方时返回错误，调用方回退到原始行。
    pub async fn execute(&self, prompt: &str) -> Result<String, ExecuteError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut pause: Option<PauseGuard<'_>> = None;
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if pause.is_none() {
                self.gate.wait_until_clear().await;
            }

            let provider = self.pool.next()?;
            let outcome = tokio::time::timeout(
                self.options.timeout,
                provider.backend().complete(prompt, &self.options),
            )
            .await
            .unwrap_or(Err(RequestError::Timeout {
                secs: self.options.timeout.as_secs(),
            }));

            let err = match outcome {
                Ok(content) => return Ok(content),
                Err(err) => err,
            };

            let tag = format!("[{}] 第 {}/{} 次", provider.label(), attempt + 1, max_attempts);
            let is_last = attempt + 1 == max_attempts;

            match err.kind() {
                ErrorKind::RateLimit => {
                    if pause.is_none() {
                        pause = self.gate.raise();
                    }
                    if is_last {
                        self.activity.warn(format!("⏳ {} 触发限流: {}", tag, err));
                    } else {
                        let delay = self.policy.backoff_delay(attempt);
                        self.activity.warn(format!(
                            "⏳ {} 触发限流，暂停所有请求 {:.1} 秒: {}",
                            tag,
                            delay.as_secs_f64(),
                            err
                        ));
                        tokio::time::sleep(delay).await;
                    }
                }
                ErrorKind::Timeout => {
                    self.activity.warn(format!("⌛ {} 请求超时，换下一个提供方", tag));
                }
                ErrorKind::ServerError => {
                    self.activity.warn(format!("⚠️ {} {}，换下一个提供方", tag, err));
                }
                ErrorKind::ClientError if err.is_auth_failure() => {
                    provider.disable();
                    self.activity.error(format!(
                        "🚫 {} 凭据无效，本次任务不再使用该提供方: {}",
                        tag, err
                    ));
                }
                ErrorKind::ClientError => {
                    self.activity.warn(format!("⚠️ {} {}，换下一个提供方", tag, err));
                }
                ErrorKind::Unknown => {
                    self.activity.warn(format!("⚠️ {} 请求异常: {}", tag, err));
                }
            }

            last_error = Some(err);
        }

        drop(pause);

        let last = last_error.unwrap_or_else(|| RequestError::Other("未发出任何请求".to_string()));
        self.activity
            .error(format!("❌ 重试 {} 次后仍然失败: {}", max_attempts, last));
        Err(ExecuteError::Exhausted {
            attempts: max_attempts,
            last,
        })
    }
}
