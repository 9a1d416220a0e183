//! 记录处理上下文
//!
//! 封装"哪个 worker 正在处理哪条记录"这一信息

use std::fmt::Display;

/// 记录处理上下文
#[derive(Debug, Clone, Copy)]
pub struct IdCtx {
    pub run_id: u64,

    /// worker 编号（从 1 开始）
    pub worker_id: usize,

    /// 记录 ID
    pub id: u64,

    /// 在本 worker 分区中的位置（从 1 开始，决定长暂停节奏）
    pub position: usize,
}

impl IdCtx {
    pub fn new(run_id: u64, worker_id: usize, id: u64, position: usize) -> Self {
        Self {
            run_id,
            worker_id,
            id,
            position,
        }
    }
}

impl Display for IdCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[worker {} #{}]", self.worker_id, self.id)
    }
}
