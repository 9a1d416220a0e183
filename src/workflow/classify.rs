//! 单条记录的结果累积与最终状态判定
//!
//! 流程在执行过程中不断往 `IdOutcome` 里追加行和警告；出错时已抓到的内容保留。
//! `finalize` 按固定优先级给出唯一的最终状态：
//!
//! 1. 异常（非超时）→ ERROR
//! 2. 超时 → TIMEOUT
//! 3. 主页面不存在 → MISSING
//! 4. 列出附件却没有文件行 → PARTIAL
//! 5. 附件全部失败 → ERROR；部分失败 → PARTIAL
//! 6. 仍为 OK 但记录了错误信息 → PARTIAL

use crate::error::{is_transport_fatal, FailureKind, HarvestError};
use crate::models::{AttributeRecord, FileRecord, Status};

/// 打断流程的失败
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruption {
    Error,
    Timeout,
}

/// 单条记录的处理结果
#[derive(Debug, Clone)]
pub struct IdOutcome {
    status: Status,
    interruption: Option<Interruption>,
    pub warnings: Vec<String>,
    pub error: String,
    pub attributes: Vec<AttributeRecord>,
    pub files: Vec<FileRecord>,
    /// 文档页列出的附件数
    pub attachments_listed: usize,
    pub general_html: Option<String>,
    pub documents_html: Option<String>,
    /// 浏览器已失效，需要重启会话
    pub restart_reason: Option<String>,
}

impl Default for IdOutcome {
    fn default() -> Self {
        Self {
            status: Status::Ok,
            interruption: None,
            warnings: Vec::new(),
            error: String::new(),
            attributes: Vec::new(),
            files: Vec::new(),
            attachments_listed: 0,
            general_html: None,
            documents_html: None,
            restart_reason: None,
        }
    }
}

impl IdOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前（或最终）状态
    pub fn status(&self) -> Status {
        self.status
    }

    pub fn mark_missing(&mut self) {
        self.status = Status::Missing;
    }

    /// 不打断流程的错误：状态记为 ERROR，信息同时进入警告
    pub fn mark_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.status = Status::Error;
        self.warnings.push(message.clone());
        self.error = message;
    }

    /// OK 降级为 PARTIAL 并记录警告
    pub fn downgrade(&mut self, warning: impl Into<String>) {
        if self.status == Status::Ok {
            self.status = Status::Partial;
        }
        self.warnings.push(warning.into());
    }

    pub fn request_restart(&mut self, reason: impl Into<String>) {
        if self.restart_reason.is_none() {
            self.restart_reason = Some(reason.into());
        }
    }

    /// 记录打断流程的失败，返回失败分类
    pub fn apply_failure(&mut self, err: &HarvestError, timeout_secs: u64) -> FailureKind {
        let kind = err.kind();
        match kind {
            FailureKind::Deadline => {
                self.interruption = Some(Interruption::Timeout);
                self.error = format!("Timeout after {}s", timeout_secs);
                self.warnings.push(err.to_string());
            }
            FailureKind::TransportFatal | FailureKind::Unclassified => {
                let message = err.to_string();
                self.interruption = Some(Interruption::Error);
                if is_transport_fatal(&message) {
                    self.request_restart(message.clone());
                }
                self.error = message;
            }
        }
        kind
    }

    /// 给出最终状态
    pub fn finalize(&mut self) -> Status {
        self.status = self.classify();
        self.status
    }

    fn classify(&mut self) -> Status {
        match self.interruption {
            Some(Interruption::Error) => return Status::Error,
            Some(Interruption::Timeout) => return Status::Timeout,
            None => {}
        }
        if self.status == Status::Missing {
            return Status::Missing;
        }

        let mut status = self.status;
        if self.attachments_listed > 0 && self.files.is_empty() {
            if status == Status::Ok {
                status = Status::Partial;
            }
            self.warnings
                .push("Attachments listed but no file rows created".to_string());
        }

        let failed = self
            .files
            .iter()
            .filter(|f| f.download_status.is_failure())
            .count();
        if failed > 0 {
            if failed == self.files.len() {
                status = Status::Error;
            } else if status == Status::Ok {
                status = Status::Partial;
            }
            self.warnings
                .push(format!("Attachment failures: {}/{}", failed, self.files.len()));
        }

        if status == Status::Ok && !self.error.is_empty() {
            status = Status::Partial;
        }
        status
    }
}
