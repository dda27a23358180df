//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责轮次推进和批次调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `round_orchestrator` - 多轮审查编排器
//! - 管理任务生命周期（校验、续跑、轮次循环、终态）
//! - 对外提供 start / stop / status
//! - 保存每轮检查点和修改日志
//!
//! ### `batch_scheduler` - 批次调度器
//! - 切分批次，控制并发数量（Semaphore + JoinSet）
//! - 按批次序号还原顺序，失败批次回退为原始行
//! - 协作式取消
//!
//! ### `round_apply` - 结果应用
//! - 单线程应用判定，生成下一轮术语表和修改日志
//!
//! ## 层次关系
//!
//! ```text
//! round_orchestrator (处理 N 轮)
//!     ↓
//! batch_scheduler (处理一轮的 Vec<Batch>)
//!     ↓
//! services::ReviewJudge (处理单个批次)
//!     ↓
//! services::RequestExecutor → ProviderPool → clients
//! ```

pub mod batch_scheduler;
pub mod round_apply;
pub mod round_orchestrator;

// 重新导出主要类型
pub use batch_scheduler::{BatchOutcome, BatchScheduler, ScheduleReport};
pub use round_apply::{apply_round, RoundApplied, RoundStats};
pub use round_orchestrator::{ControlReply, ReviewEngine};
