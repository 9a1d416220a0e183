//! 单个 worker - 编排层
//!
//! ## 职责
//!
//! 按分区顺序处理分到的记录，是记录级别的编排器。
//!
//! ## 核心功能
//!
//! 1. **资源持有**：独占一个浏览器会话（在线模式）和三张表的批量写入器
//! 2. **截止时间**：为每条记录设置处理时限
//! 3. **失败恢复**：浏览器失效时重启，超时后收拢多余窗口
//! 4. **结果落地**：写出记录行，在共享锁内提交运行状态
//! 5. **请求节奏**：在线模式下记录之间暂停
//!
//! 单条记录的任何失败都不会终止 worker；启动浏览器失败或收尾时写不出剩余的行，才会让 worker 以错误退出。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::browser::{BrowserSession, SessionLauncher, SessionOptions};
use crate::config::Config;
use crate::error::{FailureKind, HarvestError};
use crate::infrastructure::{Deadline, TableWriters};
use crate::models::{GuaranteeRecord, Run, RunStats, Status};
use crate::orchestrator::shared_state::SharedRunState;
use crate::services::{PageKind, SnapshotWriter};
use crate::utils::{logging, politeness};
use crate::workflow::{IdCtx, IdFlow, IdOutcome};

/// 超时后收拢窗口的最长等待
const RECONCILE_TIMEOUT: Duration = Duration::from_secs(30);

/// 一个 worker 的运行参数
pub struct Worker {
    pub worker_id: usize,
    pub run: Run,
    pub config: Arc<Config>,
    pub shared: Arc<SharedRunState>,
    pub flow: Arc<IdFlow>,
}

impl Worker {
    /// 处理分到的全部记录，返回本 worker 的统计
    ///
    /// 浏览器会话在每条退出路径上都会关闭。
    /// 剩余的行写不出去时，对应 ID 放回重试队列并返回错误。
    pub async fn run<L>(self, launcher: Arc<L>, ids: Vec<u64>) -> Result<RunStats>
    where
        L: SessionLauncher,
    {
        let paths = self.config.paths();
        let download_dir = paths.incoming_dir(self.worker_id);

        if self.config.worker_start_delay > 0.0 && self.worker_id > 1 {
            let delay = self.config.worker_start_delay * (self.worker_id - 1) as f64;
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }
        logging::log_worker_start(self.worker_id, ids.len(), &download_dir);

        let mut session = if self.config.mode.is_live() {
            let options = SessionOptions {
                download_dir,
                profile_dir: paths.profile_dir(self.worker_id),
                headless: self.config.headless,
                block_images: self.config.block_images,
                user_agent: self.config.user_agent.clone(),
            };
            match launcher.launch(options).await {
                Ok(session) => Some(session),
                Err(e) => {
                    error!("[worker {}] ❌ 启动浏览器失败: {:#}", self.worker_id, e);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let mut writers = TableWriters::new(&paths.processed, self.run.run_id, self.worker_id, self.config.batch_size);
        let snapshots = SnapshotWriter::new(paths.raw_html);
        let mut unflushed = Vec::new();

        let stats = self
            .process_all(session.as_mut(), &mut writers, &snapshots, &ids, &mut unflushed)
            .await;

        let flushed = writers.flush_all();
        if let Some(session) = session.as_mut() {
            if let Err(e) = session.close().await {
                debug!("[worker {}] 关闭浏览器失败（忽略）: {:#}", self.worker_id, e);
            }
        }
        logging::log_worker_finish(self.worker_id, &stats);

        if let Err(e) = flushed {
            error!(
                "[worker {}] ❌ 写出剩余记录失败，{} 个 ID 放回重试队列: {:#}",
                self.worker_id,
                unflushed.len(),
                e
            );
            if let Err(e) = self.shared.requeue(&unflushed) {
                error!("[worker {}] ❌ 保存重试队列失败: {:#}", self.worker_id, e);
            }
            return Err(anyhow!("{} 个 ID 的记录未写出: {:#}", unflushed.len(), e));
        }
        Ok(stats)
    }

    async fn process_all<S>(
        &self,
        mut session: Option<&mut S>,
        writers: &mut TableWriters,
        snapshots: &SnapshotWriter,
        ids: &[u64],
        unflushed: &mut Vec<u64>,
    ) -> RunStats
    where
        S: BrowserSession + ?Sized,
    {
        let mut stats = RunStats::default();
        let mut snapshots_taken = 0usize;

        for (index, &id) in ids.iter().enumerate() {
            let ctx = IdCtx::new(self.run.run_id, self.worker_id, id, index + 1);
            if self.shared.should_skip(id) {
                info!("{} 已处理，跳过", ctx);
                continue;
            }

            let outcome = self.process_one(session.as_deref_mut(), &ctx).await;
            let status = outcome.status();

            if self.config.save_html || snapshots_taken < self.config.save_html_first_n || status != Status::Ok {
                save_snapshots(snapshots, &ctx, &outcome);
                snapshots_taken += 1;
            }

            let file_count = outcome.files.len();
            stats.record(status, file_count);
            self.persist(&ctx, outcome, writers);
            // 行还在缓冲里的 ID
            unflushed.push(id);
            if writers.is_drained() {
                unflushed.clear();
            }
            log_id_finished(&ctx, status, file_count);

            let is_last = index + 1 == ids.len();
            if self.config.mode.is_live() && !is_last {
                let (min, max) = politeness::pause_bounds(&self.config, status, ctx.position);
                politeness::human_sleep(min, max).await;
            }
        }
        stats
    }

    /// 执行流程并给出最终状态；处理失败恢复动作
    async fn process_one<S>(&self, session: Option<&mut S>, ctx: &IdCtx) -> IdOutcome
    where
        S: BrowserSession + ?Sized,
    {
        let deadline = Deadline::after_secs(self.config.per_id_timeout_secs);
        let mut outcome = IdOutcome::new();

        let Some(session) = session else {
            if let Err(err) = self.flow.run_offline(ctx, &deadline, &mut outcome).await {
                self.record_failure(ctx, &err, &mut outcome);
            }
            outcome.finalize();
            return outcome;
        };

        debug!("{} 开始处理", ctx);
        if let Err(err) = self.flow.run_live(session, ctx, &deadline, &mut outcome).await {
            if self.record_failure(ctx, &err, &mut outcome) == FailureKind::Deadline {
                reconcile_contexts(session, ctx).await;
            }
        }
        outcome.finalize();

        if let Some(reason) = outcome.restart_reason.take() {
            warn!("{} ♻️ 浏览器失效，重启会话: {}", ctx, reason);
            if let Err(e) = session.restart().await {
                error!("{} ❌ 重启浏览器失败: {:#}", ctx, e);
            }
        }
        outcome
    }

    fn record_failure(&self, ctx: &IdCtx, err: &HarvestError, outcome: &mut IdOutcome) -> FailureKind {
        let kind = outcome.apply_failure(err, self.config.per_id_timeout_secs);
        match kind {
            FailureKind::Deadline => warn!("{} ⏱️ 处理超时 ({}s)", ctx, self.config.per_id_timeout_secs),
            FailureKind::TransportFatal => error!("{} ❌ 浏览器失效: {}", ctx, err),
            FailureKind::Unclassified => error!("{} ❌ 处理失败: {}", ctx, err),
        }
        kind
    }

    /// 写出记录行，然后在共享锁内提交运行状态
    fn persist(&self, ctx: &IdCtx, outcome: IdOutcome, writers: &mut TableWriters) {
        let status = outcome.status();
        let file_count = outcome.files.len();
        let guarantee = GuaranteeRecord {
            run_id: ctx.run_id,
            id: ctx.id,
            status,
            general_url: self.config.general_url(ctx.id),
            documents_url: self.config.documents_url(ctx.id),
            fetched_at: Utc::now(),
            warnings: outcome.warnings,
            error: outcome.error,
        };

        if let Err(e) = writers.add(guarantee, outcome.attributes.clone(), outcome.files) {
            error!("{} ❌ 写出记录失败: {:#}", ctx, e);
        }
        if let Err(e) = self
            .shared
            .commit(ctx.run_id, ctx.id, status, &outcome.attributes, file_count)
        {
            error!("{} ❌ 提交运行状态失败: {:#}", ctx, e);
        }
    }
}

/// 关闭主上下文以外的所有窗口
async fn reconcile_contexts<S>(session: &mut S, ctx: &IdCtx)
where
    S: BrowserSession + ?Sized,
{
    let reconcile = async {
        let handles = session.list_contexts().await?;
        for handle in handles.iter().skip(1) {
            session.close_context(handle).await?;
        }
        anyhow::Ok(handles.len().saturating_sub(1))
    };
    match tokio::time::timeout(RECONCILE_TIMEOUT, reconcile).await {
        Ok(Ok(0)) => {}
        Ok(Ok(closed)) => debug!("{} 关闭了 {} 个多余窗口", ctx, closed),
        Ok(Err(e)) => debug!("{} 收拢窗口失败（忽略）: {:#}", ctx, e),
        Err(_) => debug!("{} 收拢窗口超时（忽略）", ctx),
    }
}

fn save_snapshots(snapshots: &SnapshotWriter, ctx: &IdCtx, outcome: &IdOutcome) {
    let pages = [
        (PageKind::General, &outcome.general_html),
        (PageKind::Documents, &outcome.documents_html),
    ];
    for (kind, html) in pages {
        if let Some(html) = html {
            if let Err(e) = snapshots.save(kind, ctx.id, html) {
                warn!("{} ⚠️ 保存快照失败: {:#}", ctx, e);
            }
        }
    }
}

// ========== 日志辅助函数 ==========

fn log_id_finished(ctx: &IdCtx, status: Status, files: usize) {
    match status {
        Status::Ok => info!("{} ✓ status={} files={}", ctx, status, files),
        Status::Missing => info!("{} 🔍 status={} files={}", ctx, status, files),
        Status::Partial | Status::Timeout => warn!("{} ⚠️ status={} files={}", ctx, status, files),
        Status::Error => error!("{} ❌ status={} files={}", ctx, status, files),
    }
}
