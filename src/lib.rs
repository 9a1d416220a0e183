//! # Guarantee Harvester
//!
//! 可断点续跑、容错的登记簿采集器：按记录 ID 逐条抓取页面和附件，
//! 写成列式批文件，并维护检查点、重试队列和已处理集合。
//!
//! ## 架构设计
//!
//! 本系统采用分层架构：
//!
//! ### ① 基础设施层（Infrastructure / Browser）
//! - `browser/` - 浏览器会话能力（`BrowserSession`），每个 worker 独占一个
//! - `infrastructure/` - 截止时间、运行状态存储、Parquet 批量输出、文件工具
//!
//! ### ② 业务能力层（Services / Extractor）
//! - `extractor/` - 页面 → 字段，纯函数
//! - `services/` - 附件下载、下载完成判定、HTML 快照
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一条记录"的处理流程
//! - `IdCtx` - 上下文封装（worker + 记录 ID）
//! - `IdFlow` - 流程编排（基本信息页 → 文档页 → 附件）
//! - `IdOutcome` - 结果累积与最终状态判定
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/coordinator` - 工作列表、分区、并发、汇总
//! - `orchestrator/worker` - 单个 worker 的记录循环
//! - `orchestrator/shared_state` - 共享运行状态与提交
//!
//! ## 模块结构

pub mod browser;
pub mod config;
pub mod error;
pub mod extractor;
pub mod infrastructure;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use browser::{BrowserSession, ChromiumLauncher, SessionLauncher};
pub use config::{Config, Mode};
pub use error::{HarvestError, HarvestResult};
pub use extractor::{Extractor, RegistryExtractor};
pub use orchestrator::{App, RunSummary};
pub use workflow::{IdCtx, IdFlow, IdOutcome};
