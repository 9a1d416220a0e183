//! 页面解析结果（Extractor 的输出）

use std::collections::BTreeMap;

/// 分区名 → (字段名 → 字段值)
pub type Sections = BTreeMap<String, BTreeMap<String, String>>;

/// 基本信息页解析结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrimaryPage {
    pub sections: Sections,
    pub warnings: Vec<String>,
}

/// 文档页列出的一个附件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub download_url: String,
    pub original_filename: String,
    pub document_index: u32,
    pub document_number: String,
}

/// 文档级元数据字段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentField {
    pub field_name: String,
    pub field_value: String,
    pub document_index: u32,
    pub document_number: String,
}

/// 文档页解析结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecondaryPage {
    pub attachments: Vec<Attachment>,
    pub document_metadata: Vec<DocumentField>,
    pub warnings: Vec<String>,
}
