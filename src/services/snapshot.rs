//! HTML 快照服务 - 业务能力层
//!
//! 只负责"把抓到的页面写到 raw/html"，何时写由编排层决定

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

/// 页面种类，决定快照文件名前缀
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    General,
    Documents,
}

impl PageKind {
    pub fn file_prefix(self) -> &'static str {
        match self {
            PageKind::General => "generalInformation",
            PageKind::Documents => "document-info",
        }
    }

    /// `{prefix}_{id}.html`
    pub fn file_name(self, id: u64) -> String {
        format!("{}_{}.html", self.file_prefix(), id)
    }
}

/// HTML 快照写入器
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    dir: PathBuf,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// 写入快照；已存在则保留原文件
    ///
    /// 返回是否写入了新文件
    pub fn save(&self, kind: PageKind, id: u64, html: &str) -> Result<bool> {
        let path = self.dir.join(kind.file_name(id));
        if path.exists() {
            debug!("快照已存在，跳过: {}", path.display());
            return Ok(false);
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("无法创建目录: {}", self.dir.display()))?;
        fs::write(&path, html).with_context(|| format!("无法写入快照: {}", path.display()))?;
        debug!("保存快照: {}", path.display());
        Ok(true)
    }
}
