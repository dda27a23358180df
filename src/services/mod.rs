//! 业务能力层（Services）
//!
//! 每个模块只描述一种能力，不关心轮次流程：
//!
//! - `provider_pool` - 提供方加载、校验与轮询
//! - `request_executor` - 单次请求的重试、退避与限流暂停
//! - `prompt_builder` - 批量审查提示词
//! - `judgment_parser` - 解析模型返回的判定列表
//! - `convergence` - 判定历史与收敛跳过
//! - `review_judge` - 判定一个批次
//! - `consistency` - 全部轮次结束后的一致性终审

pub mod consistency;
pub mod convergence;
pub mod judgment_parser;
pub mod prompt_builder;
pub mod provider_pool;
pub mod request_executor;
pub mod review_judge;

pub use consistency::{ArbitrationReport, ConsistencyArbiter};
pub use convergence::{ConvergenceTracker, TermVerdict, VerdictSource};
pub use judgment_parser::{parse_reply, JudgmentReply};
pub use prompt_builder::{PromptBuilder, PromptItem, Tier};
pub use provider_pool::{ProviderHandle, ProviderPool, Rejection};
pub use request_executor::{PauseGate, RequestExecutor, RetryPolicy};
pub use review_judge::{BatchJudge, ReviewJudge};
