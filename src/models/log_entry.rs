//! 修改日志条目

use serde::{Deserialize, Serialize};
use std::fmt;

/// 单个术语在一轮中的处理动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReviewAction {
    Keep,
    Modify,
    Delete,
    Category,
}

impl fmt::Display for ReviewAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReviewAction::Keep => "Keep",
            ReviewAction::Modify => "Modify",
            ReviewAction::Delete => "Delete",
            ReviewAction::Category => "Category",
        };
        f.write_str(name)
    }
}

/// 修改日志条目
///
/// 每个术语在实际被判定的每一轮中各有一条。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModificationEntry {
    pub round: u32,
    pub term: String,
    pub original_translation: String,
    pub new_translation: String,
    pub action: ReviewAction,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub justification: String,
    #[serde(default)]
    pub emoji: String,
    #[serde(default)]
    pub original_category: String,
    #[serde(default)]
    pub suggested_category: String,
}

/// 以 TOML 保存日志时的外层结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModificationSheet {
    #[serde(default)]
    pub entries: Vec<ModificationEntry>,
}
