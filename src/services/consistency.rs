//! 一致性终审 - 业务能力层
//!
//! 全部轮次结束后执行一次，分两步：
//!
//! 1. **完全匹配**：同一原文对应多个不同译名时，请模型裁定一个统一译名
//! 2. **关联角色名**：人物类术语中短名是长名的子串时归为一组，请模型给出彼此一致的译名
//!
//! 两步产生的改动都记为 `Modify`。请求或解析失败的组保持原样。

use crate::models::{ActivityLog, ModificationEntry, ReviewAction, TermRow};
use crate::services::judgment_parser::parse_json;
use crate::services::prompt_builder::is_character_category;
use crate::services::request_executor::RequestExecutor;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 完全匹配仲裁提示词中的任务标记
pub const EXACT_TASK_MARKER: &str = "任务：同一原文的译名仲裁";
/// 关联角色名仲裁提示词中的任务标记
pub const GROUP_TASK_MARKER: &str = "任务：关联角色名的译名仲裁";

/// 同一原文的多个译名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExactConflict {
    pub term: String,
    /// 按首次出现顺序去重
    pub translations: Vec<String>,
}

/// 模型给出的一条裁决
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Arbitration {
    #[serde(rename = "korean_term", alias = "source_text")]
    pub term: String,
    #[serde(default)]
    pub recommended_translation: Option<String>,
}

impl Arbitration {
    pub fn recommended(&self) -> &str {
        self.recommended_translation
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
    }
}

/// 一次终审的结果
#[derive(Debug, Clone, Default)]
pub struct ArbitrationReport {
    pub entries: Vec<ModificationEntry>,
    /// 送审的组数
    pub groups: usize,
    /// 没有得到可用裁决的组数
    pub failed: usize,
    pub cancelled: bool,
}

/// 找出同一原文存在多个译名的术语
pub fn exact_conflicts(table: &[TermRow]) -> Vec<ExactConflict> {
    let mut conflicts: Vec<ExactConflict> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for row in table {
        let slot = *index.entry(row.key()).or_insert_with(|| {
            conflicts.push(ExactConflict {
                term: row.key().to_string(),
                translations: Vec::new(),
            });
            conflicts.len() - 1
        });

        let translation = row.current_translation.trim();
        let translations = &mut conflicts[slot].translations;
        if !translations.iter().any(|t| t == translation) {
            translations.push(translation.to_string());
        }
    }

    conflicts.retain(|c| c.translations.len() > 1);
    conflicts
}

/// 人物类术语按「长名包含短名」分组
///
/// 从最长的名字开始，每个名字只归入一组；只有一个成员的组不返回。
pub fn related_name_groups(table: &[TermRow]) -> Vec<Vec<String>> {
    let mut seen = HashSet::new();
    let mut names: Vec<&str> = table
        .iter()
        .filter(|row| is_character_category(&row.category))
        .map(TermRow::key)
        .filter(|key| !key.is_empty() && seen.insert(*key))
        .collect();
    names.sort_by_key(|name| std::cmp::Reverse(name.chars().count()));

    let mut grouped: HashSet<&str> = HashSet::new();
    let mut groups = Vec::new();
    for &full in &names {
        if !grouped.insert(full) {
            continue;
        }
        let mut group = vec![full.to_string()];
        for &short in &names {
            if short != full && full.contains(short) && grouped.insert(short) {
                group.push(short.to_string());
            }
        }
        if group.len() > 1 {
            groups.push(group);
        }
    }
    groups
}

/// 解析裁决：单个对象或对象列表
pub fn parse_arbitration(text: &str) -> Result<Vec<Arbitration>, String> {
    let value = parse_json(text)?;
    let value = if value.is_object() {
        Value::Array(vec![value])
    } else {
        value
    };
    serde_json::from_value(value).map_err(|e| format!("字段不符合要求: {}", e))
}

/// 一致性终审
pub struct ConsistencyArbiter {
    executor: Arc<RequestExecutor>,
    background: String,
    references: Arc<HashMap<String, String>>,
    activity: Arc<ActivityLog>,
}

impl ConsistencyArbiter {
    pub fn new(
        executor: Arc<RequestExecutor>,
        background: impl Into<String>,
        references: Arc<HashMap<String, String>>,
        activity: Arc<ActivityLog>,
    ) -> Self {
        Self {
            executor,
            background: background.into(),
            references,
            activity,
        }
    }

    /// 在最终术语表上执行两步仲裁，改动记在第 `round` 轮
    ///
    /// 每组请求前检查取消令牌；取消后剩余的组不再处理，已完成的改动保留。
    pub async fn run(
        &self,
        table: &mut [TermRow],
        round: u32,
        cancel: &CancellationToken,
    ) -> ArbitrationReport {
        let mut report = ArbitrationReport::default();

        // ========== 完全匹配 ==========
        let conflicts = exact_conflicts(table);
        if !conflicts.is_empty() {
            self.activity.info(format!(
                "⚖️ 发现 {} 组同一原文译名不一致，请求仲裁",
                conflicts.len()
            ));
        }
        for conflict in conflicts {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return report;
            }
            report.groups += 1;

            let Some(decisions) = self.ask(&self.exact_prompt(&conflict), &conflict.term).await else {
                report.failed += 1;
                continue;
            };
            let recommended = decisions
                .iter()
                .find(|d| d.term.trim() == conflict.term)
                .map(Arbitration::recommended)
                .filter(|t| !t.is_empty());

            match recommended {
                Some(recommended) => {
                    let justification = format!("统一为推荐译法 '{}'", recommended);
                    rewrite(table, &conflict.term, recommended, round, &justification, &mut report.entries);
                }
                None => {
                    report.failed += 1;
                    self.activity
                        .warn(format!("⚠️ 仲裁结果中没有术语 {} 的译名，保持原样", conflict.term));
                }
            }
        }

        // ========== 关联角色名 ==========
        let groups = related_name_groups(table);
        if !groups.is_empty() {
            self.activity
                .info(format!("⚖️ 发现 {} 组关联角色名，请求仲裁", groups.len()));
        }
        for group in groups {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return report;
            }
            report.groups += 1;

            let members: Vec<Value> = group
                .iter()
                .map(|term| {
                    let current = table
                        .iter()
                        .find(|row| row.key() == term)
                        .map(|row| row.current_translation.trim())
                        .unwrap_or_default();
                    json!({ "korean_term": term, "current_translation": current })
                })
                .collect();

            let label = group.join(" / ");
            let Some(decisions) = self.ask(&self.group_prompt(&members), &label).await else {
                report.failed += 1;
                continue;
            };

            for decision in &decisions {
                let term = decision.term.trim();
                let recommended = decision.recommended();
                if recommended.is_empty() || !group.iter().any(|member| member == term) {
                    debug!("忽略组外或空的裁决: {:?}", decision);
                    continue;
                }
                let justification = format!("为保持关联一致性，统一为 '{}'", recommended);
                rewrite(table, term, recommended, round, &justification, &mut report.entries);
            }
        }

        report
    }

    async fn ask(&self, prompt: &str, label: &str) -> Option<Vec<Arbitration>> {
        let text = match self.executor.execute(prompt).await {
            Ok(text) => text,
            Err(e) => {
                self.activity
                    .warn(format!("⚠️ {} 的一致性仲裁请求失败（{}），保持原样", label, e));
                return None;
            }
        };

        match parse_arbitration(&text) {
            Ok(decisions) => Some(decisions),
            Err(reason) => {
                self.activity
                    .warn(format!("⚠️ {} 的仲裁结果无法解析（{}），保持原样", label, reason));
                None
            }
        }
    }

    fn exact_prompt(&self, conflict: &ExactConflict) -> String {
        let context = self
            .references
            .get(&conflict.term)
            .map(String::as_str)
            .unwrap_or("无上下文");
        let conflicts: Vec<Value> = conflict
            .translations
            .iter()
            .map(|t| json!({ "translation": t, "context": context }))
            .collect();
        let conflicts_json =
            serde_json::to_string_pretty(&conflicts).unwrap_or_else(|_| "[]".to_string());

        format!(
            "角色：韩中翻译复审专家（一致性仲裁）\n\n\
             小说背景设定:\n{background}\n\n\
             {marker}\n\
             同一个韩语原文「{term}」在术语表中有多种译法。请结合背景设定和原文参考，选出应统一采用的一个译法。\n\n\
             存在冲突的译法:\n{conflicts}\n\n\
             只返回一个 JSON 对象：\n\
             {{\"korean_term\": \"{term}\", \"recommended_translation\": \"统一后的译法\"}}",
            background = self.background.trim(),
            marker = EXACT_TASK_MARKER,
            term = conflict.term,
            conflicts = conflicts_json,
        )
    }

    fn group_prompt(&self, members: &[Value]) -> String {
        let members_json =
            serde_json::to_string_pretty(members).unwrap_or_else(|_| "[]".to_string());

        format!(
            "角色：韩中翻译复审专家（关联角色名仲裁）\n\n\
             小说背景设定:\n{background}\n\n\
             {marker}\n\
             以下角色术语可能指向同一人物（例如全名与省略名）。先确定核心人物，再检查每个译名是否与之一致：\
             简称的译名应当是全名译名的一部分。已经合适的译名原样返回。\n\n\
             术语组:\n{members}\n\n\
             只返回一个 JSON 列表，每个输入术语一项，不要附加说明：\n\
             [{{\"korean_term\": \"原文\", \"recommended_translation\": \"最终译法\"}}]",
            background = self.background.trim(),
            marker = GROUP_TASK_MARKER,
            members = members_json,
        )
    }
}

fn rewrite(
    table: &mut [TermRow],
    term: &str,
    recommended: &str,
    round: u32,
    justification: &str,
    entries: &mut Vec<ModificationEntry>,
) {
    for row in table.iter_mut().filter(|row| row.key() == term) {
        if row.current_translation.trim() == recommended {
            continue;
        }

        info!("⚖️ {}: {} → {}", term, row.current_translation, recommended);
        entries.push(ModificationEntry {
            round,
            term: term.to_string(),
            original_translation: row.current_translation.clone(),
            new_translation: recommended.to_string(),
            action: ReviewAction::Modify,
            reason: String::new(),
            justification: justification.to_string(),
            emoji: "⚠️".to_string(),
            original_category: row.category.clone(),
            suggested_category: String::new(),
        });
        row.current_translation = recommended.to_string();
    }
}
