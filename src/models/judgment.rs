//! 判定结果
//!
//! LLM 返回的每条判定都必须带有 `korean_term` 和 `should_delete`，
//! 多余字段直接拒绝，避免静默套用默认值。

use serde::{Deserialize, Deserializer, Serialize};

/// 单个术语在一轮中的判定结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Judgment {
    /// 术语原文
    #[serde(rename = "korean_term", alias = "source_text")]
    pub source_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_translation: Option<String>,
    /// 推荐译文
    #[serde(default)]
    pub recommended_translation: Option<String>,
    /// 是否建议删除
    #[serde(deserialize_with = "bool_or_text")]
    pub should_delete: bool,
    #[serde(default)]
    pub deletion_reason: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub justification: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub judgment_emoji: String,
    /// 建议分类（大类/子类）
    #[serde(default)]
    pub suggested_category: Option<String>,
}

impl Judgment {
    /// 去除空白后的推荐译文，没有时为空串
    pub fn recommended(&self) -> &str {
        self.recommended_translation
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
    }

    /// 去除空白后的建议分类
    pub fn suggested_category(&self) -> &str {
        self.suggested_category
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
    }

    /// 推荐译文与删除建议都一致
    pub fn agrees_with(&self, other: &Judgment) -> bool {
        self.should_delete == other.should_delete && self.recommended() == other.recommended()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BoolLike {
    Bool(bool),
    Text(String),
}

fn bool_or_text<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match BoolLike::deserialize(deserializer)? {
        BoolLike::Bool(value) => Ok(value),
        BoolLike::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "should_delete 必须是 true/false，收到 '{}'",
                other
            ))),
        },
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}
