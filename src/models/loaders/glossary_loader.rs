//! 输入文件加载
//!
//! 在任务目录中查找术语表（TOML）和参考文件（.txt），
//! 返回术语表和按原文索引的上下文。

use crate::config::DEFAULT_CONFIG_FILE;
use crate::error::FileError;
use crate::models::term::{TermRow, TermSheet};
use crate::persistence::{FINAL_GLOSSARY_FILE, MASTER_LOG_TOML};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

/// 不当作术语表的 TOML 文件
const EXCLUDED_TOML: [&str; 3] = [FINAL_GLOSSARY_FILE, MASTER_LOG_TOML, DEFAULT_CONFIG_FILE];

/// 参考文件中的块标记
const REFERENCE_MARKER: &str = "原文：";

/// 一次任务的输入数据
#[derive(Debug, Clone)]
pub struct GlossaryData {
    pub table: Vec<TermRow>,
    /// 原文 → 原文参考片段
    pub references: HashMap<String, String>,
    pub glossary_path: PathBuf,
}

/// 输入加载接口
#[async_trait]
pub trait GlossaryLoader: Send + Sync {
    async fn load(&self, directory: &Path) -> Result<GlossaryData, FileError>;
}

/// 从目录中加载 TOML 术语表和 .txt 参考文件
#[derive(Debug, Default, Clone)]
pub struct DirectoryLoader;

#[async_trait]
impl GlossaryLoader for DirectoryLoader {
    async fn load(&self, directory: &Path) -> Result<GlossaryData, FileError> {
        if !directory.is_dir() {
            return Err(FileError::DirectoryNotFound {
                path: directory.to_path_buf(),
            });
        }

        let (glossary_path, reference_path) = find_input_files(directory).await?;
        info!("找到术语表文件: {}", glossary_path.display());
        info!("找到参考文件: {}", reference_path.display());

        let sheet = load_term_sheet(&glossary_path).await?;
        let table: Vec<TermRow> = sheet
            .terms
            .into_iter()
            .map(|mut row| {
                row.source_text = row.source_text.trim().to_string();
                row
            })
            .collect();
        info!("成功加载术语表，共 {} 条", table.len());

        let bytes = fs::read(&reference_path)
            .await
            .map_err(|e| FileError::read_failed(&reference_path, e))?;
        let content = String::from_utf8_lossy(&bytes)
            .replace("\r\n", "\n")
            .replace('\r', "\n");
        let references = parse_reference(&content, &table);
        info!("成功解析参考文件，共 {} 个术语的上下文", references.len());

        Ok(GlossaryData {
            table,
            references,
            glossary_path,
        })
    }
}

/// 从 TOML 文件加载术语表
pub async fn load_term_sheet(path: &Path) -> Result<TermSheet, FileError> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| FileError::read_failed(path, e))?;

    toml::from_str(&content).map_err(|source| FileError::TomlParseFailed {
        path: path.to_path_buf(),
        source,
    })
}

/// 查找术语表和参考文件
async fn find_input_files(directory: &Path) -> Result<(PathBuf, PathBuf), FileError> {
    let mut glossaries = Vec::new();
    let mut references = Vec::new();

    let mut entries = fs::read_dir(directory)
        .await
        .map_err(|e| FileError::read_failed(directory, e))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| FileError::read_failed(directory, e))?
    {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if name.starts_with('~') || name.starts_with('.') {
            continue;
        }

        match path.extension().and_then(|s| s.to_str()) {
            Some("toml") if !EXCLUDED_TOML.contains(&name.as_str()) => glossaries.push(path),
            Some("txt") => references.push(path),
            _ => {}
        }
    }

    glossaries.sort();
    references.sort();

    if glossaries.len() > 1 {
        warn!(
            "⚠️ 目录中有 {} 个术语表文件，将使用第一个: {}",
            glossaries.len(),
            glossaries[0].display()
        );
    }

    let glossary = glossaries
        .into_iter()
        .next()
        .ok_or_else(|| FileError::InputMissing {
            dir: directory.to_path_buf(),
            what: "术语表 (.toml) 文件",
        })?;
    let reference = references
        .into_iter()
        .next()
        .ok_or_else(|| FileError::InputMissing {
            dir: directory.to_path_buf(),
            what: "参考 (.txt) 文件",
        })?;

    Ok((glossary, reference))
}

/// 解析参考文件
///
/// 优先按 `原文：` 块解析（首行为术语，其余为上下文）；
/// 没有块标记时当作小说原文，取术语首次出现的行及其前后各一行。
pub fn parse_reference(content: &str, table: &[TermRow]) -> HashMap<String, String> {
    let mut references = HashMap::new();

    if content.contains(REFERENCE_MARKER) {
        for block in content.split(REFERENCE_MARKER).skip(1) {
            let (term, context) = block.split_once('\n').unwrap_or((block, ""));
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            references.insert(term.to_string(), context.replace('※', "").trim().to_string());
        }
    }

    if !references.is_empty() {
        return references;
    }

    let lines: Vec<&str> = content.split('\n').collect();
    for row in table {
        let term = row.key();
        if term.is_empty() || references.contains_key(term) {
            continue;
        }
        if let Some(i) = lines.iter().position(|line| line.contains(term)) {
            let start = i.saturating_sub(1);
            let end = (i + 2).min(lines.len());
            references.insert(term.to_string(), lines[start..end].join("\n").trim().to_string());
        }
    }

    references
}
