//! # Glossary Review
//!
//! 多轮术语审查引擎：用兼容 OpenAI 的 LLM API 逐批审查双语术语表，
//! 跨轮次收敛译名，并支持断点续跑。
//!
//! ## 架构设计
//!
//! 本系统采用分层架构：
//!
//! ### ① 客户端层（Clients）
//! - `clients/` - `ChatBackend` 传输接口与 OpenAI 兼容实现
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，只处理单个批次
//! - `ProviderPool` - 提供方校验与轮询
//! - `RequestExecutor` - 重试、退避、限流暂停
//! - `ReviewJudge` - 收敛过滤 → 提示词 → 请求 → 解析
//! - `ConsistencyArbiter` - 最后一轮后的译名一致性终审
//!
//! ### ③ 持久化层（Persistence）
//! - `persistence/` - 每轮检查点、主修改日志、最终术语表
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/round_orchestrator` - 多轮状态机，对外暴露 start / stop / status
//! - `orchestrator/batch_scheduler` - 并发批次调度与顺序还原
//!
//! ## 模块结构

pub mod clients;
pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod services;
pub mod utils;

// 重新导出常用类型
pub use config::{Config, ProviderConfig};
pub use error::AppError;
pub use models::{Judgment, TaskPhase, TaskStatus, TermRow};
pub use orchestrator::{ControlReply, ReviewEngine};
