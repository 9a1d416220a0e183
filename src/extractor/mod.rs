//! 页面字段抽取
//!
//! 纯函数：HTML → 字段。无 I/O，无状态。

pub mod registry;

pub use registry::RegistryExtractor;

use crate::models::{PrimaryPage, SecondaryPage};

/// 文档页元数据写入 attribute 表时使用的分区名
pub const DOCUMENT_META_SECTION: &str = "Документы: Информация о банковской гарантии";

/// 页面抽取器
pub trait Extractor: Send + Sync {
    /// 解析基本信息页
    fn parse_primary_page(&self, html: &str) -> PrimaryPage;

    /// 解析文档页：附件列表 + 文档元数据
    fn parse_secondary_page(&self, html: &str) -> SecondaryPage;

    /// 目标站点确认记录不存在
    fn is_missing_page(&self, html: &str) -> bool;
}
