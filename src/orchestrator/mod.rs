//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责一次运行的调度和状态记账，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `coordinator` - 运行协调器
//! - 管理应用生命周期（初始化、运行）
//! - 组装工作列表，分配运行编号
//! - 按步长分区，并发启动 worker
//! - 输出全局统计信息
//!
//! ### `worker` - 单个 worker
//! - 独占一个浏览器会话
//! - 按顺序处理分区内的记录
//! - 失败恢复、结果写出、请求节奏
//!
//! ### `shared_state` - 共享运行状态
//! - 已处理集合、重试计数、字段并集、检查点
//! - 一把锁，只在每条记录结束时短暂持有
//!
//! ## 层次关系
//!
//! ```text
//! coordinator (处理整个工作列表)
//!     ↓
//! worker (处理一个分区)
//!     ↓
//! workflow::IdFlow (处理单条记录)
//!     ↓
//! services (能力层：下载 / 完成判定 / 快照)
//!     ↓
//! infrastructure + browser (时限、存储、输出、浏览器会话)
//! ```

pub mod coordinator;
pub mod shared_state;
pub mod worker;

// 重新导出主要类型
pub use coordinator::{merge_retries, partition_striped, select_ids, App, RunSummary, Worklist};
pub use shared_state::SharedRunState;
pub use worker::Worker;
