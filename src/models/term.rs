//! 术语行

use serde::{Deserialize, Serialize};

/// 术语表中的一行
///
/// 以去除首尾空白后的 `source_text` 作为身份标识。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermRow {
    /// 原文
    #[serde(alias = "src")]
    pub source_text: String,
    /// 当前译文
    #[serde(rename = "translation", alias = "dst")]
    pub current_translation: String,
    /// 出现次数
    #[serde(default = "default_frequency", alias = "count")]
    pub frequency: u32,
    /// 分类（如 "角色/男性角色"）
    #[serde(default, alias = "info")]
    pub category: String,
}

fn default_frequency() -> u32 {
    1
}

impl TermRow {
    pub fn new(
        source_text: impl Into<String>,
        translation: impl Into<String>,
        frequency: u32,
    ) -> Self {
        Self {
            source_text: source_text.into(),
            current_translation: translation.into(),
            frequency,
            category: String::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// 术语身份键
    pub fn key(&self) -> &str {
        self.source_text.trim()
    }
}

/// 以 TOML 保存术语表时的外层结构
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TermSheet {
    #[serde(default)]
    pub terms: Vec<TermRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sheet_accepts_short_column_names() {
        let sheet: TermSheet = toml::from_str(
            r#"
            [[terms]]
            src = " 해든 "
            dst = "海灯"
            count = 6
            info = "男性角色"

            [[terms]]
            source_text = "책상"
            translation = "桌子"
            "#,
        )
        .unwrap();

        assert_eq!(sheet.terms.len(), 2);
        assert_eq!(sheet.terms[0].key(), "해든");
        assert_eq!(sheet.terms[0].frequency, 6);
        assert_eq!(sheet.terms[1].frequency, 1);
        assert_eq!(sheet.terms[1].category, "");
    }
}
