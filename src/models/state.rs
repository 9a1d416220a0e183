//! 运行状态类型：运行标识、统计、检查点

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::records::Status;

/// 一次运行
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub run_id: u64,
    pub started_at: DateTime<Utc>,
}

/// 按状态的计数 + 文件数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    #[serde(rename = "OK")]
    pub ok: u64,
    #[serde(rename = "MISSING")]
    pub missing: u64,
    #[serde(rename = "PARTIAL")]
    pub partial: u64,
    #[serde(rename = "ERROR")]
    pub error: u64,
    #[serde(rename = "TIMEOUT")]
    pub timeout: u64,
    #[serde(rename = "FILES")]
    pub files: u64,
}

impl RunStats {
    pub fn record(&mut self, status: Status, files: usize) {
        match status {
            Status::Ok => self.ok += 1,
            Status::Missing => self.missing += 1,
            Status::Partial => self.partial += 1,
            Status::Error => self.error += 1,
            Status::Timeout => self.timeout += 1,
        }
        self.files += files as u64;
    }

    /// 已处理的 ID 总数
    pub fn processed(&self) -> u64 {
        self.ok + self.missing + self.partial + self.error + self.timeout
    }
}

/// 检查点快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: u64,
    pub last_processed_id: u64,
    pub stats: RunStats,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_counts_statuses_and_files() {
        let mut a = RunStats::default();
        a.record(Status::Ok, 2);
        a.record(Status::Timeout, 0);
        a.record(Status::Partial, 3);
        assert_eq!(a.ok, 1);
        assert_eq!(a.timeout, 1);
        assert_eq!(a.partial, 1);
        assert_eq!(a.files, 5);
        assert_eq!(a.processed(), 3);
    }

    #[test]
    fn test_stats_use_status_keys() {
        let json = serde_json::to_value(RunStats::default()).unwrap();
        assert!(json.get("OK").is_some());
        assert!(json.get("FILES").is_some());
    }
}
