//! 日志工具模块
//!
//! 订阅器初始化（控制台 + 本次运行的日志文件）以及横幅式的日志辅助函数

use anyhow::{anyhow, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::Config;
use crate::models::{Run, RunStats};

/// 初始化日志
///
/// `RUST_LOG` 优先；否则 `verbose` 决定 debug / info。
/// 返回的 guard 必须保持到程序结束，否则文件中的尾部日志会丢失。
pub fn init(config: &Config) -> Result<(WorkerGuard, PathBuf)> {
    let log_dir = config.paths().logs;
    fs::create_dir_all(&log_dir)?;
    let file_name = format!("harvest_{}.log", chrono::Local::now().format("%Y%m%d_%H%M%S"));

    let default_level = if config.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},chromiumoxide=warn,tungstenite=warn", default_level))
    });

    let file_appender = tracing_appender::rolling::never(&log_dir, &file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::Layer::new()
        .with_writer(file_writer)
        .with_target(false)
        .with_ansi(false);
    let console_layer = fmt::Layer::new()
        .with_writer(std::io::stdout)
        .with_target(false);

    Registry::default()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow!("初始化日志失败: {}", e))?;

    Ok((guard, log_dir.join(file_name)))
}

/// 记录程序启动信息
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 登记簿采集 ({:?} 模式)", config.mode);
    info!("📊 worker 数量: {}", config.workers.max(1));
    info!(
        "⏱️ 单条时限: {}s | 下载时限: {}s | 卡死判定: {}s",
        config.per_id_timeout_secs, config.download_timeout_secs, config.download_stall_secs
    );
    info!("📁 数据目录: {}", config.data_dir.display());
    info!("{}", "=".repeat(60));
}

/// 记录工作列表信息
pub fn log_worklist(run: &Run, total: usize, retries: usize, workers: usize) {
    info!("✓ 运行编号 run_id={} (开始于 {})", run.run_id, run.started_at.to_rfc3339());
    info!("📋 待处理 {} 条（其中重试 {} 条），分给 {} 个 worker", total, retries, workers);
}

/// 记录 worker 启动信息
pub fn log_worker_start(worker_id: usize, assigned: usize, download_dir: &Path) {
    info!("\n{}", "─".repeat(60));
    info!("👷 worker {} 启动: 分配 {} 条", worker_id, assigned);
    info!("📥 下载目录: {}", download_dir.display());
    info!("{}", "─".repeat(60));
}

/// 记录 worker 完成信息
pub fn log_worker_finish(worker_id: usize, stats: &RunStats) {
    info!("\n{}", "─".repeat(60));
    info!(
        "✓ worker {} 完成: 处理 {} 条, 文件 {} 个",
        worker_id,
        stats.processed(),
        stats.files
    );
    info!("{}", "─".repeat(60));
}

/// 打印最终统计信息
pub fn print_final_stats(run_id: u64, stats: &RunStats, failed_workers: usize) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计 (run_id={})", run_id);
    info!("完成时间: {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
    info!("{}", "=".repeat(60));
    info!("✅ OK: {}", stats.ok);
    info!("🔍 MISSING: {}", stats.missing);
    info!("⚠️ PARTIAL: {}", stats.partial);
    info!("⏱️ TIMEOUT: {}", stats.timeout);
    info!("❌ ERROR: {}", stats.error);
    info!("📎 FILES: {}", stats.files);
    if failed_workers > 0 {
        info!("💥 启动失败的 worker: {}", failed_workers);
    }
    info!("{}", "=".repeat(60));
}
