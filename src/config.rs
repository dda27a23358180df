//! 程序配置
//!
//! 配置保存在 TOML 文件中，每次启动任务时重新加载；部分数值可以用环境变量覆盖。

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// 默认配置文件名
pub const DEFAULT_CONFIG_FILE: &str = "review.toml";

/// 单个 API 提供方配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// 显示名称（为空时由序号和模型名生成）
    #[serde(default)]
    pub display_name: String,
    /// API 基础 URL
    #[serde(default, alias = "endpoint")]
    pub base_url: String,
    /// API 密钥
    #[serde(default, alias = "credential")]
    pub api_key: String,
    /// 模型名称
    #[serde(default, alias = "model_name")]
    pub model: String,
    /// 是否启用
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ProviderConfig {
    /// 端点、凭据、模型三者都不为空
    pub fn is_complete(&self) -> bool {
        !self.base_url.trim().is_empty()
            && !self.api_key.trim().is_empty()
            && !self.model.trim().is_empty()
    }

    /// 日志中使用的名称
    pub fn label(&self, index: usize) -> String {
        if self.display_name.trim().is_empty() {
            format!("#{} {}", index + 1, self.model)
        } else {
            self.display_name.clone()
        }
    }
}

/// 程序配置文件
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// API 提供方列表
    pub providers: Vec<ProviderConfig>,
    /// 旧版单提供方字段：每行一个密钥
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// 同时处理的批次数量
    pub max_workers: usize,
    /// 每批术语数量
    pub batch_size: usize,
    /// 单次请求最多尝试次数
    pub max_attempts: u32,
    /// 退避基础时长（秒）
    pub retry_base_delay_secs: f64,
    /// 判定请求超时（秒）
    pub request_timeout_secs: u64,
    /// 校验探测超时（秒）
    pub connect_timeout_secs: u64,
    /// 单次请求最大输出 token
    pub max_tokens: u32,
    pub temperature: f32,
    /// 任务日志环形缓冲区容量
    pub activity_log_capacity: usize,
    /// 全部轮次结束后执行一致性终审
    pub consistency_review: bool,
    /// 自定义批量审查提示词（为空时使用内置模板）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_review_prompt: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            api_key: None,
            base_url: None,
            model: None,
            max_workers: 10,
            batch_size: 10,
            max_attempts: 3,
            retry_base_delay_secs: 5.0,
            request_timeout_secs: 300,
            connect_timeout_secs: 120,
            max_tokens: 8192,
            temperature: 0.1,
            activity_log_capacity: 100,
            consistency_review: true,
            batch_review_prompt: None,
        }
    }
}

impl Config {
    /// 从 TOML 文件加载配置
    ///
    /// 文件不存在时写入一份默认模板并返回默认配置。
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!("配置文件 {} 不存在，正在创建默认模板", path.display());
            let config = Self::default();
            config.save(path)?;
            return Ok(config.with_env_overrides());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source,
        })?;

        let config = config.with_env_overrides();
        config.validate()?;

        info!(
            "✓ 已加载配置 {} (提供方 {} 个, 并发 {}, 每批 {})",
            path.display(),
            config.provider_configs().len(),
            config.max_workers,
            config.batch_size
        );
        Ok(config)
    }

    /// 保存配置到 TOML 文件
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    /// 应用环境变量覆盖
    pub fn with_env_overrides(self) -> Self {
        Self {
            max_workers: env_or("REVIEW_MAX_WORKERS", self.max_workers),
            batch_size: env_or("REVIEW_BATCH_SIZE", self.batch_size),
            request_timeout_secs: env_or("REVIEW_REQUEST_TIMEOUT_SECS", self.request_timeout_secs),
            connect_timeout_secs: env_or("REVIEW_CONNECT_TIMEOUT_SECS", self.connect_timeout_secs),
            ..self
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid {
                field: "max_workers",
                reason: "必须大于 0".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "batch_size",
                reason: "必须大于 0".to_string(),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "max_attempts",
                reason: "必须大于 0".to_string(),
            });
        }
        if Duration::try_from_secs_f64(self.retry_base_delay_secs).is_err() {
            return Err(ConfigError::Invalid {
                field: "retry_base_delay_secs",
                reason: format!("{} 不是合法的时长", self.retry_base_delay_secs),
            });
        }
        Ok(())
    }

    /// 实际使用的提供方列表
    ///
    /// `providers` 为空时回退到旧版字段，`api_key` 中每个非空行对应一个提供方。
    pub fn provider_configs(&self) -> Vec<ProviderConfig> {
        if !self.providers.is_empty() {
            return self.providers.clone();
        }

        let base_url = self.base_url.clone().unwrap_or_default();
        let model = self
            .model
            .clone()
            .unwrap_or_else(|| "deepseek-chat".to_string());

        self.api_key
            .as_deref()
            .unwrap_or_default()
            .lines()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(|key| ProviderConfig {
                display_name: String::new(),
                base_url: base_url.clone(),
                api_key: key.to_string(),
                model: model.clone(),
                enabled: true,
            })
            .collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.retry_base_delay_secs).unwrap_or_default()
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
