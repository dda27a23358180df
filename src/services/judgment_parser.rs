//! 判定结果解析
//!
//! 模型返回的文本可能带有 Markdown 代码块、前后说明文字，或者因为输出长度被截断。
//! 依次尝试：直接解析 → 截取最外层 `[...]` → 修补截断的列表。
//! 语法通过后再按 `Judgment` 的字段约束校验，不符合时返回 `Malformed`。

use crate::models::Judgment;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// 一次回复的解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum JudgmentReply {
    Parsed(Vec<Judgment>),
    Malformed { reason: String },
}

impl JudgmentReply {
    pub fn into_judgments(self) -> Option<Vec<Judgment>> {
        match self {
            JudgmentReply::Parsed(judgments) => Some(judgments),
            JudgmentReply::Malformed { .. } => None,
        }
    }
}

fn fence_regex() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"```(?:json|JSON)?\s*|\s*```").ok())
        .as_ref()
}

/// 去掉代码块标记后宽松地解析出 JSON
///
/// 依次尝试：直接解析 → 最外层 `[...]` → 修补截断的列表 → 最外层 `{...}`。
pub fn parse_json(text: &str) -> Result<Value, String> {
    let clean = match fence_regex() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    };
    let clean = clean.trim();
    if clean.is_empty() {
        return Err("返回内容为空".to_string());
    }

    parse_lenient(clean).ok_or_else(|| {
        format!(
            "无法解析为 JSON: {}",
            crate::utils::logging::truncate_text(clean, 80)
        )
    })
}

/// 解析模型返回的判定列表
pub fn parse_reply(text: &str) -> JudgmentReply {
    let value = match parse_json(text) {
        Ok(value) => value,
        Err(reason) => return JudgmentReply::Malformed { reason },
    };

    match value {
        Value::Array(_) => match serde_json::from_value::<Vec<Judgment>>(value) {
            Ok(judgments) => JudgmentReply::Parsed(judgments),
            Err(e) => JudgmentReply::Malformed {
                reason: format!("字段不符合要求: {}", e),
            },
        },
        other => JudgmentReply::Malformed {
            reason: format!("期望 JSON 列表，实际为 {}", json_type(&other)),
        },
    }
}

fn parse_lenient(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }
    parse_list(text).or_else(|| slice_between(text, '{', '}'))
}

fn parse_list(text: &str) -> Option<Value> {
    let start = text.find('[')?;
    if let Some(value) = slice_between(text, '[', ']') {
        return Some(value);
    }

    // 截断：保留到最后一个完整对象为止，补上 `]`
    let last_brace = text.rfind('}')?;
    if last_brace < start {
        return None;
    }
    let repaired = format!("{}]", &text[start..=last_brace]);
    serde_json::from_str::<Value>(&repaired).ok()
}

fn slice_between(text: &str, open: char, close: char) -> Option<Value> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&text[start..=end]).ok()
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITEM_A: &str = r#"{"korean_term": "책상", "recommended_translation": null, "should_delete": true, "deletion_reason": "通用词", "justification": "日常词", "judgment_emoji": "🗑️"}"#;
    const ITEM_B: &str = r#"{"korean_term": "해든", "original_translation": "海灯", "recommended_translation": "海灯", "should_delete": false, "deletion_reason": null, "justification": "角色名", "judgment_emoji": "✅", "suggested_category": "角色/男性角色"}"#;

    fn terms(reply: JudgmentReply) -> Vec<String> {
        reply
            .into_judgments()
            .unwrap()
            .into_iter()
            .map(|j| j.source_text)
            .collect()
    }

    #[test]
    fn test_plain_and_fenced_lists() {
        let plain = format!("[{}, {}]", ITEM_A, ITEM_B);
        assert_eq!(terms(parse_reply(&plain)), ["책상", "해든"]);

        let fenced = format!("```json\n{}\n```", plain);
        assert_eq!(terms(parse_reply(&fenced)), ["책상", "해든"]);
    }

    #[test]
    fn test_list_embedded_in_prose() {
        let text = format!("以下是审查结果：\n[{}]\n如有疑问请告知。", ITEM_B);
        let judgments = parse_reply(&text).into_judgments().unwrap();
        assert_eq!(judgments[0].suggested_category(), "角色/男性角色");
    }

    #[test]
    fn test_truncated_list_is_repaired() {
        let text = format!("[{}, {}, {{\"korean_term\": \"의자\", \"should_del", ITEM_A, ITEM_B);
        assert_eq!(terms(parse_reply(&text)), ["책상", "해든"]);
    }

    #[test]
    fn test_malformed_replies_fail_closed() {
        assert!(matches!(parse_reply(""), JudgmentReply::Malformed { .. }));
        assert!(matches!(parse_reply("抱歉，我无法完成"), JudgmentReply::Malformed { .. }));
        assert!(matches!(parse_reply(ITEM_A), JudgmentReply::Malformed { .. }));

        let missing_flag = r#"[{"korean_term": "책상", "recommended_translation": "桌子"}]"#;
        assert!(matches!(parse_reply(missing_flag), JudgmentReply::Malformed { .. }));

        let extra_field = r#"[{"korean_term": "책상", "should_delete": false, "score": 3}]"#;
        assert!(matches!(parse_reply(extra_field), JudgmentReply::Malformed { .. }));
    }

    #[test]
    fn test_object_embedded_in_prose() {
        let text = "裁决如下：\n```json\n{\"korean_term\": \"해든\", \"recommended_translation\": \"海灯\"}\n```";
        let value = parse_json(text).unwrap();
        assert_eq!(value["recommended_translation"], "海灯");

        let prose = format!("结论：{}。", ITEM_A);
        assert!(matches!(parse_reply(&prose), JudgmentReply::Malformed { .. }));
        assert!(parse_json("  ").is_err());
    }
}
