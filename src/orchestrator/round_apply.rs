//! 应用一轮的判定结果
//!
//! 在编排任务上单线程执行：删除行、改写译名或分类、生成修改日志。
//! 已收敛（缓存）的判定静默应用，不产生日志，也不追加历史。
//! 同一原文出现在多行时，每轮只把第一行的判定计入历史。

use crate::models::{Judgment, ModificationEntry, ReviewAction, TermRow};
use crate::orchestrator::batch_scheduler::BatchOutcome;
use std::collections::HashSet;

/// 一轮的动作统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundStats {
    pub kept: usize,
    pub modified: usize,
    pub deleted: usize,
    pub recategorized: usize,
    /// 复用缓存判定的行
    pub cached: usize,
    /// 回退为原始数据的行
    pub fallback: usize,
}

impl RoundStats {
    fn count(&mut self, action: ReviewAction) {
        match action {
            ReviewAction::Keep => self.kept += 1,
            ReviewAction::Modify => self.modified += 1,
            ReviewAction::Delete => self.deleted += 1,
            ReviewAction::Category => self.recategorized += 1,
        }
    }
}

/// 应用后的结果
#[derive(Debug, Clone, Default)]
pub struct RoundApplied {
    /// 下一轮的术语表
    pub table: Vec<TermRow>,
    /// 本轮修改日志，每个实际判定的术语一条
    pub entries: Vec<ModificationEntry>,
    /// 本轮新得到的判定 `(术语, 判定)`，每个术语至多一条，用于追加历史
    pub fresh: Vec<(String, Judgment)>,
    pub stats: RoundStats,
}

/// 判定对应的动作：删除 > 改译名 > 改分类 > 保留
pub fn decide(row: &TermRow, judgment: &Judgment) -> ReviewAction {
    if judgment.should_delete {
        return ReviewAction::Delete;
    }

    let recommended = judgment.recommended();
    if !recommended.is_empty() && recommended != row.current_translation.trim() {
        return ReviewAction::Modify;
    }
    if category_changes(row, judgment) {
        return ReviewAction::Category;
    }
    ReviewAction::Keep
}

fn category_changes(row: &TermRow, judgment: &Judgment) -> bool {
    let suggested = judgment.suggested_category();
    !suggested.is_empty() && suggested != row.category.trim()
}

/// 应用一轮的全部批次结果
pub fn apply_round(round: u32, outcomes: Vec<BatchOutcome>) -> RoundApplied {
    let mut applied = RoundApplied::default();
    let mut recorded: HashSet<String> = HashSet::new();

    for outcome in outcomes {
        match outcome {
            BatchOutcome::Fallback { rows } => {
                applied.stats.fallback += rows.len();
                applied.table.extend(rows);
            }
            BatchOutcome::Judged { rows, verdicts } => {
                for (row, verdict) in rows.into_iter().zip(verdicts) {
                    let key = row.key().to_string();
                    let cached = verdict.is_cached();
                    let judgment = verdict.judgment;
                    let action = decide(&row, &judgment);

                    if cached {
                        applied.stats.cached += 1;
                    } else {
                        applied.stats.count(action);
                        applied.entries.push(log_entry(round, &row, action, &judgment));
                    }

                    if let Some(next) = apply_action(row, action, &judgment) {
                        applied.table.push(next);
                    }

                    if !cached && recorded.insert(key.clone()) {
                        applied.fresh.push((key, judgment));
                    }
                }
            }
        }
    }

    applied
}

fn apply_action(mut row: TermRow, action: ReviewAction, judgment: &Judgment) -> Option<TermRow> {
    match action {
        ReviewAction::Delete => return None,
        ReviewAction::Modify => {
            row.current_translation = judgment.recommended().to_string();
            if category_changes(&row, judgment) {
                row.category = judgment.suggested_category().to_string();
            }
        }
        ReviewAction::Category => {
            row.category = judgment.suggested_category().to_string();
        }
        ReviewAction::Keep => {}
    }
    Some(row)
}

fn log_entry(round: u32, row: &TermRow, action: ReviewAction, judgment: &Judgment) -> ModificationEntry {
    let new_translation = match action {
        ReviewAction::Delete => String::new(),
        ReviewAction::Modify => judgment.recommended().to_string(),
        ReviewAction::Keep | ReviewAction::Category => row.current_translation.clone(),
    };

    ModificationEntry {
        round,
        term: row.key().to_string(),
        original_translation: row.current_translation.clone(),
        new_translation,
        action,
        reason: judgment.deletion_reason.clone().unwrap_or_default(),
        justification: judgment.justification.clone(),
        emoji: judgment.judgment_emoji.clone(),
        original_category: row.category.clone(),
        suggested_category: judgment.suggested_category().to_string(),
    }
}
