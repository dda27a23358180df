//! 提示词构建 - 业务能力层
//!
//! 把一批术语整理成带分级、历史和上下文的条目，拼接成一次请求的提示词。

use crate::models::TermRow;
use crate::services::convergence::ConvergenceTracker;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 提示词中条目 JSON 之前的标记行
pub const ITEMS_MARKER: &str = "待审查术语列表:";

/// 被视为人物的分类关键词
const CHARACTER_KEYWORDS: [&str; 4] = ["角色", "神祇/传说人物", "男性角色", "女性角色"];

/// 分类是否属于人物
pub fn is_character_category(category: &str) -> bool {
    let category = category.trim();
    CHARACTER_KEYWORDS.iter().any(|k| category.contains(k))
}

/// 默认角色说明，可被配置中的 `batch_review_prompt` 覆盖
pub const DEFAULT_ROLE_PROMPT: &str = "\
角色：韩中小说术语复审专家（批处理模式）

你会收到一批从小说中提取的术语及其现有中文译名，请逐条独立审查。

审查准则：
- 以「小说背景设定」和「术语所在原文参考」为最高依据。
- 专有名词（人名、组织名、地名）的一致性优先于字面准确：已经稳定的译名不要改写。
- 同一角色的全名、省略名、昵称属于同一术语组，译名体系和性别等属性必须一致，不得因为不是全名而建议删除。
- 组织的全称与简称同样视为同一术语组，已确立的译名保持不变。
- 多义且无法稳定指向具体含义的词、无歧义的日常通用词、动词、形容词和纯描述性短语，建议删除。
- 只有在译名明显错误或违背设定时才给出新的推荐译名。";

/// 术语权重等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    S,
    A,
    B,
    C,
}

impl Tier {
    /// 出现在背景设定中为 S；频次 ≥ 5 为 A；≤ 3 为 C；其余为 B
    pub fn classify(term: &str, frequency: u32, background: &str) -> Self {
        if !term.is_empty() && background.contains(term) {
            Tier::S
        } else if frequency >= 5 {
            Tier::A
        } else if frequency <= 3 {
            Tier::C
        } else {
            Tier::B
        }
    }

    pub fn instruction(self) -> &'static str {
        match self {
            Tier::S => "【核心设定词】出现在背景设定中，必须与设定保持一致，禁止删除。",
            Tier::A => "【高频词】在原文中多次出现，通常是重要术语；若确认是误提取的通用词（单字、虚词、动词、形容词、数量词等），请标记删除。",
            Tier::B => "",
            Tier::C => "【低频词】仅出现 1-3 次；若判断为通用词汇而非术语，请大胆建议删除。",
        }
    }
}

/// 提示词中的单个条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptItem {
    pub korean_term: String,
    pub chinese_translation: String,
    pub tier: Tier,
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_context: Option<String>,
    pub is_character: bool,
    pub current_category: String,
    pub context: String,
}

/// 批量审查提示词构建器
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    role_prompt: String,
    background: String,
}

impl PromptBuilder {
    pub fn new(role_prompt: Option<&str>, background: impl Into<String>) -> Self {
        let role_prompt = role_prompt
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_ROLE_PROMPT)
            .to_string();

        Self {
            role_prompt,
            background: background.into(),
        }
    }

    pub fn background(&self) -> &str {
        &self.background
    }

    /// 为一行术语生成条目
    pub fn item(
        &self,
        row: &TermRow,
        references: &HashMap<String, String>,
        history: &ConvergenceTracker,
    ) -> PromptItem {
        let term = row.key();
        let tier = Tier::classify(term, row.frequency, &self.background);

        let history_context = history.latest(term).map(|last| {
            if last.should_delete {
                "之前已建议删除".to_string()
            } else {
                format!("之前已审定为: {}", last.recommended())
            }
        });

        let category = row.category.trim();
        let context = references
            .get(term)
            .cloned()
            .unwrap_or_else(|| format!("未在参考文件中找到术语 '{}' 的上下文。", term));

        PromptItem {
            korean_term: term.to_string(),
            chinese_translation: row.current_translation.trim().to_string(),
            tier,
            instruction: tier.instruction().to_string(),
            history_context,
            is_character: is_character_category(category),
            current_category: category.to_string(),
            context,
        }
    }

    /// 拼接完整提示词
    pub fn build(&self, items: &[PromptItem]) -> String {
        let items_json = serde_json::to_string_pretty(items).unwrap_or_else(|_| "[]".to_string());

        format!(
            "{role}\n\n{rules}\n\n小说背景设定:\n{background}\n\n{marker}\n{items}\n\n{schema}",
            role = self.role_prompt,
            rules = RULES,
            background = self.background.trim(),
            marker = ITEMS_MARKER,
            items = items_json,
            schema = OUTPUT_SCHEMA,
        )
    }
}

/// 从提示词中取回条目
pub fn extract_items(prompt: &str) -> Option<Vec<PromptItem>> {
    let (_, rest) = prompt.split_once(ITEMS_MARKER)?;
    serde_json::Deserializer::from_str(rest)
        .into_iter::<Vec<PromptItem>>()
        .next()?
        .ok()
}

const RULES: &str = "\
请结合背景设定、权重等级、历史记忆和每条术语的原文参考，逐条独立判断。

1. 历史记忆：`history_context` 表示之前轮次的结论，没有明显错误时必须保持一致。
2. 权重等级：`tier` 为 S 时以设定为准；A 为高频词，误提取的通用词仍需删除；C 为低频词，可以大胆删除。
3. 分类审查：判断 `current_category` 是否准确，在 `suggested_category` 中返回“大类/子类”格式的分类。
   - 角色：男性角色 / 女性角色 / 动物角色 / 历史人物 / 知名人物 / 角色外号 / 昵称 / 小说作者
   - 地点：特定地名 / 通用地名
   - 组织机构：特定组织 / XX机构
   - 小说设定：ABO / Nameverse / 哨兵向导 / 猎人能力设定 / 特定世界设定词
   - 能力技能：角色技能 / 特定设定技能
   - 物品：特定物品 / 通用物品 / 特殊物品
   现有分类准确时，规范成“大类/子类”后原样返回。";

const OUTPUT_SCHEMA: &str = "\
只返回一个 JSON 列表，顺序与输入完全一致，每个元素只包含以下字段：
{
  \"korean_term\": \"原文\",
  \"original_translation\": \"现有译名\",
  \"recommended_translation\": \"推荐译名（建议删除时可为 null）\",
  \"should_delete\": false,
  \"deletion_reason\": \"删除理由（不删除时为 null）\",
  \"justification\": \"翻译与分类的审查理由\",
  \"judgment_emoji\": \"✅ / ⚠️ / ❌\",
  \"suggested_category\": \"大类/子类\"
}";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Judgment;

    #[test]
    fn test_tier_rules() {
        let background = "主角海灯（해든）是一名猎人。";
        assert_eq!(Tier::classify("해든", 1, background), Tier::S);
        assert_eq!(Tier::classify("책상", 5, background), Tier::A);
        assert_eq!(Tier::classify("책상", 4, background), Tier::B);
        assert_eq!(Tier::classify("책상", 3, background), Tier::C);
        assert_eq!(Tier::classify("", 4, background), Tier::B);
        assert_eq!(Tier::B.instruction(), "");
    }

    #[test]
    fn test_item_carries_history_and_context() {
        let builder = PromptBuilder::new(None, "");
        let mut references = HashMap::new();
        references.insert("해든".to_string(), "해든이 웃었다.".to_string());

        let mut history = ConvergenceTracker::new();
        history.record(
            "해든",
            serde_json::from_str::<Judgment>(
                r#"{"korean_term": "해든", "recommended_translation": "海灯", "should_delete": false}"#,
            )
            .unwrap(),
        );
        history.record(
            "책상",
            serde_json::from_str::<Judgment>(r#"{"korean_term": "책상", "should_delete": true}"#).unwrap(),
        );

        let row = TermRow::new(" 해든 ", " 海灯 ", 6).with_category("男性角色");
        let item = builder.item(&row, &references, &history);
        assert_eq!(item.korean_term, "해든");
        assert_eq!(item.chinese_translation, "海灯");
        assert_eq!(item.tier, Tier::A);
        assert_eq!(item.history_context.as_deref(), Some("之前已审定为: 海灯"));
        assert!(item.is_character);
        assert_eq!(item.context, "해든이 웃었다.");

        let item = builder.item(&TermRow::new("책상", "桌子", 1), &references, &history);
        assert_eq!(item.history_context.as_deref(), Some("之前已建议删除"));
        assert!(!item.is_character);
        assert!(item.context.contains("未在参考文件中找到"));

        let item = builder.item(&TermRow::new("의자", "椅子", 1), &references, &history);
        assert!(item.history_context.is_none());
    }

    #[test]
    fn test_prompt_round_trips_items_and_uses_override() {
        let builder = PromptBuilder::new(Some("  自定义角色  "), "背景");
        let items = vec![builder.item(
            &TermRow::new("책상", "桌子", 1),
            &HashMap::new(),
            &ConvergenceTracker::new(),
        )];

        let prompt = builder.build(&items);
        assert!(prompt.starts_with("自定义角色"));
        assert!(prompt.contains("小说背景设定:\n背景"));
        assert_eq!(extract_items(&prompt), Some(items));

        let default = PromptBuilder::new(Some("   "), "");
        assert!(default.build(&[]).starts_with("角色：韩中小说术语复审专家"));
    }
}
