//! 输出表记录类型
//!
//! 三张表：guarantee（每个 ID 每次尝试一行）、attribute（字段事实表）、file（每个附件一行）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 单个 ID 的最终状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    Missing,
    Partial,
    Error,
    Timeout,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Missing => "MISSING",
            Status::Partial => "PARTIAL",
            Status::Error => "ERROR",
            Status::Timeout => "TIMEOUT",
        }
    }

    /// 是否进入重试队列
    pub fn is_retryable(self) -> bool {
        matches!(self, Status::Error | Status::Partial | Status::Timeout)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 附件下载状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    Downloaded,
    SkippedExists,
    SkippedOffline,
    FailedNotFound,
    FailedErrorPage,
    FailedStalled,
    FailedTimeout,
    FailedMissing,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Downloaded => "DOWNLOADED",
            DownloadStatus::SkippedExists => "SKIPPED_EXISTS",
            DownloadStatus::SkippedOffline => "SKIPPED_OFFLINE",
            DownloadStatus::FailedNotFound => "FAILED_NOT_FOUND",
            DownloadStatus::FailedErrorPage => "FAILED_ERROR_PAGE",
            DownloadStatus::FailedStalled => "FAILED_STALLED",
            DownloadStatus::FailedTimeout => "FAILED_TIMEOUT",
            DownloadStatus::FailedMissing => "FAILED_MISSING",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            DownloadStatus::FailedNotFound
                | DownloadStatus::FailedErrorPage
                | DownloadStatus::FailedStalled
                | DownloadStatus::FailedTimeout
                | DownloadStatus::FailedMissing
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// guarantee 表的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuaranteeRecord {
    pub run_id: u64,
    pub id: u64,
    pub status: Status,
    pub general_url: String,
    pub documents_url: String,
    pub fetched_at: DateTime<Utc>,
    pub warnings: Vec<String>,
    pub error: String,
}

/// attribute 表的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeRecord {
    pub run_id: u64,
    pub id: u64,
    pub section: String,
    pub field_name: String,
    pub field_value: String,
    pub document_index: Option<u32>,
    pub document_number: Option<String>,
}

/// file 表的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub run_id: u64,
    pub id: u64,
    pub file_index: u32,
    pub stored_filename: String,
    pub stored_path: String,
    pub original_filename: String,
    pub download_url: String,
    pub document_index: u32,
    pub document_number: String,
    pub page_count: u32,
    pub mime_type: String,
    pub download_status: DownloadStatus,
    pub sha256: String,
}
