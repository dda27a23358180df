//! 检查点存储
//!
//! 目录结构：
//!
//! ```text
//! <dir>/
//! ├── glossary_output.toml          最终术语表
//! ├── modified.json / modified.toml 主修改日志
//! └── review_logs/
//!     ├── round_{r}_glossary.toml   第 r 轮结束时的术语表
//!     ├── round_{r}_history.json    截至第 r 轮的判定历史
//!     └── round_{r}_modified.json   第 r 轮的修改日志
//! ```

use crate::error::FileError;
use crate::models::{ModificationEntry, ModificationSheet, TermRow, TermSheet};
use crate::services::convergence::ConvergenceTracker;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// 检查点子目录
pub const LOG_DIR: &str = "review_logs";
/// 最终术语表文件
pub const FINAL_GLOSSARY_FILE: &str = "glossary_output.toml";
/// 主修改日志（TOML）
pub const MASTER_LOG_TOML: &str = "modified.toml";
/// 主修改日志（JSON）
pub const MASTER_LOG_JSON: &str = "modified.json";

/// 已加载的检查点
#[derive(Debug, Clone)]
pub struct RoundCheckpoint {
    pub round: u32,
    pub table: Vec<TermRow>,
    pub history: ConvergenceTracker,
}

/// 单个任务目录下的检查点存储
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
    log_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(directory: &Path) -> Self {
        Self {
            root: directory.to_path_buf(),
            log_dir: directory.join(LOG_DIR),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn final_path(&self) -> PathBuf {
        self.root.join(FINAL_GLOSSARY_FILE)
    }

    fn glossary_path(&self, round: u32) -> PathBuf {
        self.log_dir.join(format!("round_{}_glossary.toml", round))
    }

    fn history_path(&self, round: u32) -> PathBuf {
        self.log_dir.join(format!("round_{}_history.json", round))
    }

    fn round_log_path(&self, round: u32) -> PathBuf {
        self.log_dir.join(format!("round_{}_modified.json", round))
    }

    /// 最新的完整检查点轮次（术语表和历史都存在）
    pub async fn latest_round(&self) -> Result<Option<u32>, FileError> {
        if !self.log_dir.is_dir() {
            return Ok(None);
        }

        let mut entries = fs::read_dir(&self.log_dir)
            .await
            .map_err(|e| FileError::read_failed(&self.log_dir, e))?;

        let mut latest = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FileError::read_failed(&self.log_dir, e))?
        {
            let name = entry.file_name();
            let Some(round) = name
                .to_str()
                .and_then(|n| n.strip_prefix("round_"))
                .and_then(|n| n.strip_suffix("_glossary.toml"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };

            if round > 0 && self.history_path(round).is_file() {
                latest = latest.max(Some(round));
            }
        }

        Ok(latest)
    }

    /// 读取第 `round` 轮的检查点
    pub async fn load_round(&self, round: u32) -> Result<RoundCheckpoint, FileError> {
        let glossary_path = self.glossary_path(round);
        let sheet = crate::models::loaders::load_term_sheet(&glossary_path).await?;

        let history_path = self.history_path(round);
        let content = fs::read_to_string(&history_path)
            .await
            .map_err(|e| FileError::read_failed(&history_path, e))?;
        let history: ConvergenceTracker = serde_json::from_str(&content)
            .map_err(|e| FileError::json_failed(&history_path, e))?;

        debug!(
            "已读取第 {} 轮检查点: {} 条术语, {} 条历史",
            round,
            sheet.terms.len(),
            history.len()
        );

        Ok(RoundCheckpoint {
            round,
            table: sheet.terms,
            history,
        })
    }

    /// 保存一轮的术语表、历史和本轮日志
    pub async fn save_round(
        &self,
        round: u32,
        table: &[TermRow],
        history: &ConvergenceTracker,
        entries: &[ModificationEntry],
    ) -> Result<(), FileError> {
        fs::create_dir_all(&self.log_dir)
            .await
            .map_err(|e| FileError::write_failed(&self.log_dir, e))?;

        write_toml(&self.glossary_path(round), &term_sheet(table)).await?;
        write_json(&self.history_path(round), history).await?;
        write_json(&self.round_log_path(round), &entries).await?;

        info!("💾 第 {} 轮检查点已保存: {}", round, self.log_dir.display());
        Ok(())
    }

    /// 删除全部轮次检查点，全新任务开始时调用
    pub async fn clear_rounds(&self) -> Result<(), FileError> {
        if self.log_dir.is_dir() {
            fs::remove_dir_all(&self.log_dir)
                .await
                .map_err(|e| FileError::write_failed(&self.log_dir, e))?;
        }
        Ok(())
    }

    /// 读取主修改日志
    pub async fn load_master_log(&self) -> Result<Vec<ModificationEntry>, FileError> {
        let path = self.root.join(MASTER_LOG_JSON);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| FileError::read_failed(&path, e))?;
        serde_json::from_str(&content).map_err(|e| FileError::json_failed(&path, e))
    }

    /// 向主修改日志追加条目，同时刷新 JSON 和 TOML 两份
    pub async fn append_master_log(&self, entries: &[ModificationEntry]) -> Result<usize, FileError> {
        let mut all = self.load_master_log().await?;
        all.extend_from_slice(entries);

        write_json(&self.root.join(MASTER_LOG_JSON), &all).await?;
        let sheet = ModificationSheet { entries: all };
        write_toml(&self.root.join(MASTER_LOG_TOML), &sheet).await?;

        Ok(sheet.entries.len())
    }

    /// 全新任务开始时清空主修改日志
    pub async fn reset_master_log(&self) -> Result<(), FileError> {
        for name in [MASTER_LOG_JSON, MASTER_LOG_TOML] {
            let path = self.root.join(name);
            if path.is_file() {
                fs::remove_file(&path)
                    .await
                    .map_err(|e| FileError::write_failed(&path, e))?;
            }
        }
        Ok(())
    }

    /// 写出最终术语表
    pub async fn write_final(&self, table: &[TermRow]) -> Result<PathBuf, FileError> {
        let path = self.final_path();
        write_toml(&path, &term_sheet(table)).await?;
        Ok(path)
    }
}

fn term_sheet(table: &[TermRow]) -> TermSheet {
    TermSheet {
        terms: table.to_vec(),
    }
}

async fn write_toml<T: Serialize>(path: &Path, value: &T) -> Result<(), FileError> {
    let content = toml::to_string_pretty(value).map_err(|source| FileError::TomlSerializeFailed {
        path: path.to_path_buf(),
        source,
    })?;
    write_replace(path, content).await
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), FileError> {
    let content = serde_json::to_string_pretty(value).map_err(|e| FileError::json_failed(path, e))?;
    write_replace(path, content).await
}

/// 先写临时文件再改名，中途失败不会留下半个检查点
async fn write_replace(path: &Path, content: String) -> Result<(), FileError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, content)
        .await
        .map_err(|e| FileError::write_failed(&tmp, e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| FileError::write_failed(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Judgment, ReviewAction};

    fn entry(round: u32, term: &str, action: ReviewAction) -> ModificationEntry {
        ModificationEntry {
            round,
            term: term.to_string(),
            original_translation: "桌子".to_string(),
            new_translation: String::new(),
            action,
            reason: String::new(),
            justification: String::new(),
            emoji: String::new(),
            original_category: String::new(),
            suggested_category: String::new(),
        }
    }

    #[tokio::test]
    async fn test_round_checkpoint_roundtrip_and_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert_eq!(store.latest_round().await.unwrap(), None);

        let table = vec![TermRow::new("해든", "海灯", 6).with_category("角色/男性角色")];
        let mut history = ConvergenceTracker::new();
        history.record(
            "해든",
            serde_json::from_str::<Judgment>(
                r#"{"korean_term": "해든", "recommended_translation": "海灯", "should_delete": false}"#,
            )
            .unwrap(),
        );

        store.save_round(1, &table, &history, &[]).await.unwrap();
        store.save_round(2, &table, &history, &[]).await.unwrap();
        // 只有术语表没有历史的轮次不算
        std::fs::write(store.log_dir().join("round_7_glossary.toml"), "terms = []\n").unwrap();

        assert_eq!(store.latest_round().await.unwrap(), Some(2));

        let checkpoint = store.load_round(2).await.unwrap();
        assert_eq!(checkpoint.table, table);
        assert_eq!(checkpoint.history, history);
    }

    #[tokio::test]
    async fn test_master_log_appends_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        let total = store
            .append_master_log(&[entry(1, "책상", ReviewAction::Delete)])
            .await
            .unwrap();
        assert_eq!(total, 1);
        let total = store
            .append_master_log(&[entry(2, "해든", ReviewAction::Keep)])
            .await
            .unwrap();
        assert_eq!(total, 2);

        let toml_text = std::fs::read_to_string(dir.path().join(MASTER_LOG_TOML)).unwrap();
        let sheet: ModificationSheet = toml::from_str(&toml_text).unwrap();
        assert_eq!(sheet.entries[0].action, ReviewAction::Delete);
        assert_eq!(sheet.entries[1].term, "해든");

        store.save_round(1, &[], &ConvergenceTracker::new(), &[]).await.unwrap();
        store.clear_rounds().await.unwrap();
        assert_eq!(store.latest_round().await.unwrap(), None);

        store.reset_master_log().await.unwrap();
        assert!(store.load_master_log().await.unwrap().is_empty());
        assert!(!dir.path().join(MASTER_LOG_TOML).exists());
    }

    #[tokio::test]
    async fn test_final_table_is_loadable() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        let path = store
            .write_final(&[TermRow::new("해든", "海灯", 6)])
            .await
            .unwrap();
        let sheet = crate::models::loaders::load_term_sheet(&path).await.unwrap();
        assert_eq!(sheet.terms[0].current_translation, "海灯");
    }
}
