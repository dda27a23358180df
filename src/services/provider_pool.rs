//! 提供方池 - 业务能力层
//!
//! 持有已配置的 API 提供方，启动时逐个校验，之后在存活的提供方之间轮询。
//! 轮询游标和停用标记都是原子量，可以被多个工作任务同时使用。

use crate::clients::{ChatBackend, ProviderConnector, RequestOptions};
use crate::config::ProviderConfig;
use crate::error::{PoolError, RequestError};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// 校验探测消息前缀
pub const PROBE_PREFIX: &str = "ping from glossary review";

/// 单个提供方
pub struct ProviderHandle {
    config: ProviderConfig,
    label: String,
    backend: Arc<dyn ChatBackend>,
    disabled: AtomicBool,
}

impl ProviderHandle {
    pub fn new(config: ProviderConfig, label: String, backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            config,
            label,
            backend,
            disabled: AtomicBool::new(false),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn backend(&self) -> &dyn ChatBackend {
        self.backend.as_ref()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// 停用后不再参与轮询
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    fn matches(&self, name: &str) -> bool {
        let name = name.trim();
        self.label == name || self.config.display_name.trim() == name
    }
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("label", &self.label)
            .field("model", &self.config.model)
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

/// 校验未通过的提供方
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub label: String,
    pub reason: String,
}

/// 提供方池
#[derive(Debug, Default)]
pub struct ProviderPool {
    loaded: Vec<Arc<ProviderHandle>>,
    /// 校验通过的子集，`next()` 只在这里轮询
    active: Vec<Arc<ProviderHandle>>,
    rejected: Vec<Rejection>,
    cursor: AtomicUsize,
}

impl ProviderPool {
    /// 根据配置创建提供方
    ///
    /// 停用或字段不全的条目被过滤；单个条目创建失败只记录日志。
    pub fn load(configs: &[ProviderConfig], connector: &dyn ProviderConnector) -> Self {
        let mut loaded = Vec::new();

        for (index, config) in configs.iter().enumerate() {
            let label = config.label(index);
            if !config.enabled {
                info!("⏭️  提供方 {} 已停用，跳过", label);
                continue;
            }
            if !config.is_complete() {
                warn!("⚠️ 提供方 {} 配置不完整（需要 base_url、api_key、model），跳过", label);
                continue;
            }

            match connector.connect(config) {
                Ok(backend) => loaded.push(Arc::new(ProviderHandle::new(config.clone(), label, backend))),
                Err(e) => warn!("⚠️ 提供方 {} 初始化失败: {}", label, e),
            }
        }

        info!("📋 已加载 {} 个提供方", loaded.len());

        Self {
            loaded,
            ..Self::default()
        }
    }

    /// 依次探测每个提供方，保留返回非空内容的
    ///
    /// 返回存活数量。
    pub async fn validate(&mut self, timeout: Duration) -> usize {
        let options = RequestOptions::probe(timeout);
        let mut active = Vec::new();
        let mut rejected = Vec::new();

        for handle in &self.loaded {
            if handle.is_disabled() {
                continue;
            }

            let prompt = probe_prompt();
            let outcome = tokio::time::timeout(timeout, handle.backend().complete(&prompt, &options))
                .await
                .unwrap_or(Err(RequestError::Timeout {
                    secs: timeout.as_secs(),
                }));

            match outcome {
                Ok(content) if !content.trim().is_empty() => {
                    info!("✅ 提供方 {} 校验通过", handle.label());
                    active.push(Arc::clone(handle));
                }
                Ok(_) => rejected.push(reject(handle, &RequestError::EmptyContent)),
                Err(e) => rejected.push(reject(handle, &e)),
            }
        }

        self.active = active;
        self.rejected = rejected;
        self.cursor.store(0, Ordering::Relaxed);
        self.active.len()
    }

    /// 按轮询顺序返回下一个可用提供方
    pub fn next(&self) -> Result<Arc<ProviderHandle>, PoolError> {
        let n = self.active.len();
        for _ in 0..n {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
            let handle = &self.active[index];
            if !handle.is_disabled() {
                return Ok(Arc::clone(handle));
            }
        }
        Err(PoolError::NoProviders)
    }

    /// 当前可用数量
    pub fn available(&self) -> usize {
        self.active.iter().filter(|h| !h.is_disabled()).count()
    }

    /// 按名称停用提供方，返回是否找到
    pub fn disable(&self, name: &str) -> bool {
        let mut found = false;
        for handle in self.loaded.iter().filter(|h| h.matches(name)) {
            handle.disable();
            found = true;
        }
        if found {
            warn!("🚫 提供方 {} 已停用", name);
        }
        found
    }

    pub fn loaded_len(&self) -> usize {
        self.loaded.len()
    }

    pub fn rejected(&self) -> &[Rejection] {
        &self.rejected
    }
}

fn probe_prompt() -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let nonce: u32 = rand::thread_rng().gen_range(1000..10000);
    format!("{} {} {}", PROBE_PREFIX, ts, nonce)
}

fn reject(handle: &ProviderHandle, err: &RequestError) -> Rejection {
    let reason = match err {
        RequestError::Timeout { secs } => format!("Timeout ({}s)", secs),
        RequestError::RateLimited { message } => format!("HTTP 429: {}", message),
        RequestError::Server { status, message } | RequestError::Client { status, message } => {
            format!("HTTP {}: {}", status, message)
        }
        other => format!("Error: {}", other),
    };
    warn!("❌ 提供方 {} 校验失败: {}", handle.label(), reason);
    Rejection {
        label: handle.label().to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StaticBackend(Result<String, RequestError>);

    #[async_trait]
    impl ChatBackend for StaticBackend {
        async fn complete(&self, _prompt: &str, _options: &RequestOptions) -> Result<String, RequestError> {
            self.0.clone()
        }
    }

    fn provider(model: &str) -> ProviderConfig {
        ProviderConfig {
            display_name: String::new(),
            base_url: "http://localhost".to_string(),
            api_key: "k".to_string(),
            model: model.to_string(),
            enabled: true,
        }
    }

    fn connector(config: &ProviderConfig) -> Result<Arc<dyn ChatBackend>, RequestError> {
        let reply = match config.model.as_str() {
            "good" => Ok("pong".to_string()),
            "blank" => Ok("  ".to_string()),
            "broken" => return Err(RequestError::Other("bad url".to_string())),
            _ => Err(RequestError::from_status(401, "invalid key")),
        };
        Ok(Arc::new(StaticBackend(reply)))
    }

    #[tokio::test]
    async fn test_load_filters_disabled_incomplete_and_broken() {
        let mut disabled = provider("good");
        disabled.enabled = false;
        let mut incomplete = provider("good");
        incomplete.api_key = " ".to_string();

        let pool = ProviderPool::load(
            &[disabled, incomplete, provider("broken"), provider("good")],
            &connector,
        );
        assert_eq!(pool.loaded_len(), 1);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.next().unwrap_err(), PoolError::NoProviders);
    }

    #[tokio::test]
    async fn test_validate_keeps_well_formed_responders() {
        let mut pool = ProviderPool::load(
            &[provider("denied"), provider("good"), provider("blank")],
            &connector,
        );

        assert_eq!(pool.validate(Duration::from_secs(1)).await, 1);
        assert_eq!(pool.rejected().len(), 2);
        assert_eq!(pool.rejected()[0].reason, "HTTP 401: invalid key");
        assert!(pool.rejected()[1].reason.starts_with("Error:"));

        for _ in 0..4 {
            assert_eq!(pool.next().unwrap().label(), "#2 good");
        }
    }

    #[tokio::test]
    async fn test_round_robin_and_disable() {
        let mut named = provider("good");
        named.display_name = "主力".to_string();
        let mut pool = ProviderPool::load(&[named, provider("good")], &connector);
        assert_eq!(pool.validate(Duration::from_secs(1)).await, 2);

        let first = pool.next().unwrap().label().to_string();
        let second = pool.next().unwrap().label().to_string();
        assert_ne!(first, second);

        assert!(pool.disable("主力"));
        assert!(!pool.disable("不存在"));
        assert_eq!(pool.available(), 1);
        for _ in 0..3 {
            assert_eq!(pool.next().unwrap().label(), "#2 good");
        }
    }

    #[test]
    fn test_probe_prompt_carries_nonce() {
        let prompt = probe_prompt();
        assert!(prompt.starts_with(PROBE_PREFIX));
        assert_eq!(prompt.split_whitespace().count(), 6);
    }
}
