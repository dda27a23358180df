//! 收敛跟踪 - 业务能力层
//!
//! 按术语保存各轮判定历史，决定下一轮是否可以跳过请求。
//!
//! 历史只由编排器在一轮结束后写入；工作任务通过 `Arc` 共享只读快照，
//! 同一轮内兄弟批次的更新不可见。

use crate::models::Judgment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 从第几轮开始允许跳过
pub const SKIP_FROM_ROUND: u32 = 3;

/// 判定来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictSource {
    /// 本轮实际请求得到
    Fresh,
    /// 已收敛，复用最近一次判定
    Cached,
}

/// 单行的判定结果
#[derive(Debug, Clone, PartialEq)]
pub struct TermVerdict {
    pub judgment: Judgment,
    pub source: VerdictSource,
}

impl TermVerdict {
    pub fn fresh(judgment: Judgment) -> Self {
        Self {
            judgment,
            source: VerdictSource::Fresh,
        }
    }

    pub fn cached(judgment: Judgment) -> Self {
        Self {
            judgment,
            source: VerdictSource::Cached,
        }
    }

    pub fn is_cached(&self) -> bool {
        self.source == VerdictSource::Cached
    }
}

/// 术语判定历史
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConvergenceTracker {
    history: BTreeMap<String, Vec<Judgment>>,
}

impl ConvergenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条判定
    pub fn record(&mut self, term: &str, judgment: Judgment) {
        self.history
            .entry(term.trim().to_string())
            .or_default()
            .push(judgment);
    }

    /// 第 3 轮起，最近两次判定一致时跳过
    pub fn should_skip(&self, term: &str, round: u32) -> bool {
        if round < SKIP_FROM_ROUND {
            return false;
        }
        match self.history.get(term.trim()).map(Vec::as_slice) {
            Some([.., previous, latest]) => previous.agrees_with(latest),
            _ => false,
        }
    }

    /// 可跳过时返回最近一次判定
    pub fn cached_result(&self, term: &str, round: u32) -> Option<&Judgment> {
        if self.should_skip(term, round) {
            self.latest(term)
        } else {
            None
        }
    }

    /// 最近一次判定
    pub fn latest(&self, term: &str) -> Option<&Judgment> {
        self.history.get(term.trim()).and_then(|entries| entries.last())
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// 按行顺序合并缓存结果和新结果
    ///
    /// `cached` 与批次行一一对应，`None` 的位置依次取 `fresh` 中的元素。
    /// 数量对不上时返回 `None`，调用方回退到原始行。
    pub fn merge(cached: Vec<Option<Judgment>>, fresh: Vec<Judgment>) -> Option<Vec<TermVerdict>> {
        let needed = cached.iter().filter(|slot| slot.is_none()).count();
        if needed != fresh.len() {
            return None;
        }

        let mut fresh = fresh.into_iter();
        cached
            .into_iter()
            .map(|slot| match slot {
                Some(judgment) => Some(TermVerdict::cached(judgment)),
                None => fresh.next().map(TermVerdict::fresh),
            })
            .collect()
    }
}
