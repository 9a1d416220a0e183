use thiserror::Error;

/// 单个 ID 处理流程中的错误
#[derive(Debug, Error)]
pub enum HarvestError {
    /// 超过单个 ID 的处理时限
    #[error("Per-ID processing timed out")]
    Deadline,
    /// 浏览器操作失败
    #[error("{0:#}")]
    Browser(anyhow::Error),
    /// 文件读写失败
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// 其他错误
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

/// 失败分类
///
/// 只决定 worker 的恢复动作（重启浏览器 / 收拢窗口），最终状态由分类器决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 超时
    Deadline,
    /// 浏览器进程不可用，需要重启会话
    TransportFatal,
    /// 其他错误，原样记录
    Unclassified,
}

/// 浏览器会话已失效的错误特征（小写匹配）
pub const TRANSPORT_FATAL_PATTERNS: &[&str] = &[
    "invalid session id",
    "err_connection_reset",
    "chrome not reachable",
    "disconnected",
    "receiver is gone",
    "channel closed",
    "connection closed",
];

/// 根据错误文本判断是否为浏览器致命错误
pub fn is_transport_fatal(message: &str) -> bool {
    let message = message.to_lowercase();
    TRANSPORT_FATAL_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

impl HarvestError {
    /// 包装浏览器错误
    pub fn browser(err: impl Into<anyhow::Error>) -> Self {
        HarvestError::Browser(err.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            HarvestError::Deadline => FailureKind::Deadline,
            other if is_transport_fatal(&other.to_string()) => FailureKind::TransportFatal,
            _ => FailureKind::Unclassified,
        }
    }
}

// ========== Result 类型别名 ==========

/// 单个 ID 处理流程的结果类型
pub type HarvestResult<T> = Result<T, HarvestError>;
