//! 单个 ID 的处理时限
//!
//! 每个挂起点（导航、等待、下载轮询）都从截止时间推导出剩余预算，
//! 进入新的挂起点之前先检查是否已经超时。

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{is_transport_fatal, HarvestError, HarvestResult};

/// 挂起点的最小预算（只要还有剩余时间）
const MIN_BUDGET: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// `secs == 0` 表示不限时
    pub fn after_secs(secs: u64) -> Self {
        if secs == 0 {
            Self::unbounded()
        } else {
            Self {
                at: Some(Instant::now() + Duration::from_secs(secs)),
            }
        }
    }

    pub fn unbounded() -> Self {
        Self { at: None }
    }

    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// 协作式检查点：已超时则返回 `Deadline` 错误
    pub fn ensure_time_left(&self) -> HarvestResult<()> {
        if self.is_expired() {
            Err(HarvestError::Deadline)
        } else {
            Ok(())
        }
    }

    /// 挂起点预算：`min(default, 剩余时间)`，剩余时间不足 1 秒时给 1 秒，已超时为 0
    pub fn remaining(&self, default: Duration) -> Duration {
        match self.at {
            None => default,
            Some(at) => {
                let now = Instant::now();
                if now >= at {
                    Duration::ZERO
                } else {
                    (at - now).max(MIN_BUDGET).min(default)
                }
            }
        }
    }

    /// 在剩余预算内执行一个挂起操作
    ///
    /// 超出预算且截止时间已过归类为 `Deadline`。操作自身报错时，只有截止时间已过
    /// 且不是浏览器致命错误才算超时（内部等待用的就是剩余预算），致命错误总是原样返回。
    pub async fn guard<T, F>(&self, default: Duration, op: F) -> HarvestResult<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        self.ensure_time_left()?;
        let budget = self.remaining(default);
        match tokio::time::timeout(budget, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) if is_transport_fatal(&format!("{:#}", err)) => Err(HarvestError::browser(err)),
            Ok(Err(_)) | Err(_) if self.is_expired() => Err(HarvestError::Deadline),
            Ok(Err(err)) => Err(HarvestError::browser(err)),
            Err(_) => Err(HarvestError::browser(anyhow::anyhow!(
                "operation timed out after {}s",
                budget.as_secs()
            ))),
        }
    }
}
