//! LLM API 客户端
//!
//! 兼容 OpenAI API 的 `/chat/completions` 调用。请求体与响应体使用
//! `async-openai` 的类型构建和解析，传输层使用 `reqwest`，
//! 以便按 HTTP 状态码和超时区分错误种类。

use crate::config::ProviderConfig;
use crate::error::RequestError;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// 单次请求参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

impl RequestOptions {
    /// 校验探测使用的参数
    pub fn probe(timeout: Duration) -> Self {
        Self {
            max_tokens: 5,
            temperature: 0.0,
            timeout,
        }
    }
}

/// 判定请求的传输接口
///
/// 返回原始文本内容；错误已归类为 `RequestError`。
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, prompt: &str, options: &RequestOptions) -> Result<String, RequestError>;
}

/// 为单个提供方配置创建传输句柄
pub trait ProviderConnector: Send + Sync {
    fn connect(&self, config: &ProviderConfig) -> Result<Arc<dyn ChatBackend>, RequestError>;
}

/// OpenAI 兼容客户端
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model_name: String,
}

impl OpenAiCompatClient {
    /// 创建新的客户端（不发起网络请求）
    pub fn new(config: &ProviderConfig) -> Result<Self, RequestError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| RequestError::Other(format!("无法创建 HTTP 客户端: {}", e)))?;

        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.trim().to_string(),
            model_name: config.model.trim().to_string(),
        })
    }

    fn build_request(
        &self,
        prompt: &str,
        options: &RequestOptions,
    ) -> Result<async_openai::types::chat::CreateChatCompletionRequest, RequestError> {
        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt)
            .build()
            .map_err(|e| RequestError::Other(format!("构建用户消息失败: {}", e)))?;

        CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(vec![ChatCompletionRequestMessage::User(user_msg)])
            .temperature(options.temperature)
            .max_tokens(options.max_tokens)
            .build()
            .map_err(|e| RequestError::Other(format!("构建请求失败: {}", e)))
    }
}

#[async_trait]
impl ChatBackend for OpenAiCompatClient {
    async fn complete(&self, prompt: &str, options: &RequestOptions) -> Result<String, RequestError> {
        debug!("调用 LLM API，模型: {}", self.model_name);
        debug!("用户消息长度: {} 字符", prompt.len());

        let request = self.build_request(prompt, options)?;

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(options.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_transport_error(e, options.timeout))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport_error(e, options.timeout))?;

        if !status.is_success() {
            return Err(RequestError::from_status(status.as_u16(), error_message(&body)));
        }

        let parsed: CreateChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| RequestError::Other(format!("响应解析失败: {}", e)))?;

        debug!("LLM API 调用成功");

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();

        if content.is_empty() {
            return Err(RequestError::EmptyContent);
        }
        Ok(content)
    }
}

impl<F> ProviderConnector for F
where
    F: Fn(&ProviderConfig) -> Result<Arc<dyn ChatBackend>, RequestError> + Send + Sync,
{
    fn connect(&self, config: &ProviderConfig) -> Result<Arc<dyn ChatBackend>, RequestError> {
        self(config)
    }
}

/// 生产环境使用的连接器
#[derive(Debug, Default, Clone)]
pub struct OpenAiConnector;

impl ProviderConnector for OpenAiConnector {
    fn connect(&self, config: &ProviderConfig) -> Result<Arc<dyn ChatBackend>, RequestError> {
        Ok(Arc::new(OpenAiCompatClient::new(config)?))
    }
}

fn classify_transport_error(err: reqwest::Error, timeout: Duration) -> RequestError {
    if err.is_timeout() {
        return RequestError::Timeout {
            secs: timeout.as_secs(),
        };
    }
    match err.status() {
        Some(status) => RequestError::from_status(status.as_u16(), err.to_string()),
        None => RequestError::Other(err.to_string()),
    }
}

/// 从错误响应体中提取 message 字段，取不到时返回截断后的原文
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| crate::utils::logging::truncate_text(body.trim(), 200))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_prefers_json_field() {
        assert_eq!(
            error_message(r#"{"error": {"message": "Invalid API key", "type": "auth"}}"#),
            "Invalid API key"
        );
        assert_eq!(error_message(r#"{"message": "busy"}"#), "busy");
        assert_eq!(error_message("  upstream down  "), "upstream down");
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        let config = ProviderConfig {
            display_name: String::new(),
            base_url: "https://api.deepseek.com/v1/".to_string(),
            api_key: " sk-test ".to_string(),
            model: "deepseek-chat".to_string(),
            enabled: true,
        };
        let client = OpenAiCompatClient::new(&config).unwrap();
        assert_eq!(client.endpoint, "https://api.deepseek.com/v1/chat/completions");
        assert_eq!(client.api_key, "sk-test");
    }

    #[test]
    fn test_request_body_carries_options() {
        let config = ProviderConfig {
            display_name: String::new(),
            base_url: "http://localhost".to_string(),
            api_key: "k".to_string(),
            model: "m".to_string(),
            enabled: true,
        };
        let client = OpenAiCompatClient::new(&config).unwrap();
        let request = client
            .build_request("hello", &RequestOptions::probe(Duration::from_secs(1)))
            .unwrap();
        let body = serde_json::to_value(&request).unwrap();

        assert_eq!(body["model"], "m");
        assert_eq!(body["max_tokens"], 5);
        assert_eq!(body["messages"][0]["role"], "user");
    }
}
