//! 持久化层
//!
//! 每轮的检查点、主修改日志和最终术语表。

pub mod checkpoint_store;

pub use checkpoint_store::{
    CheckpointStore, FINAL_GLOSSARY_FILE, LOG_DIR, MASTER_LOG_JSON, MASTER_LOG_TOML,
};
