//! 运行协调器 - 编排层
//!
//! ## 职责
//!
//! 本模块是整个应用的入口，负责一次运行的资源和调度。
//!
//! ## 核心功能
//!
//! 1. **应用初始化**：创建目录、载入共享运行状态、准备抽取器
//! 2. **工作列表**：显式列表 / 区间 / 默认样本，合并重试队列，过滤已完成的 ID
//! 3. **运行登记**：工作列表非空时才分配新的 run_id 并记录开始时间
//! 4. **分区调度**：按步长把列表分给 N 个 worker，用 tokio::spawn 并发执行
//! 5. **全局统计**：汇总各 worker 的结果
//!
//! ## 设计特点
//!
//! - **顶层编排**：不处理单条记录的细节
//! - **向下委托**：委托 worker 处理各自的分区

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::browser::{ChromiumLauncher, SessionLauncher};
use crate::config::{Config, DEFAULT_SAMPLE_IDS};
use crate::extractor::{Extractor, RegistryExtractor};
use crate::infrastructure::RunStateStore;
use crate::models::{Run, RunStats};
use crate::orchestrator::shared_state::SharedRunState;
use crate::orchestrator::worker::Worker;
use crate::utils::logging;
use crate::workflow::IdFlow;

/// 一次运行的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// 工作列表为空时不开始新的运行
    pub run: Option<Run>,
    pub stats: RunStats,
    /// 启动失败（或崩溃）的 worker 数
    pub failed_workers: usize,
}

impl RunSummary {
    pub fn run_id(&self) -> Option<u64> {
        self.run.map(|run| run.run_id)
    }
}

/// 合并后的工作列表
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Worklist {
    pub ids: Vec<u64>,
    /// 其中来自重试队列的数量
    pub retries: usize,
}

/// 应用主结构
pub struct App {
    config: Arc<Config>,
    shared: Arc<SharedRunState>,
    extractor: Arc<dyn Extractor>,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        logging::log_startup(&config);

        let paths = config.paths();
        for dir in [&paths.raw_html, &paths.attachments, &paths.processed, &paths.state] {
            fs::create_dir_all(dir).with_context(|| format!("无法创建目录: {}", dir.display()))?;
        }

        let store = RunStateStore::new(&paths.state, paths.attribute_union());
        if let Some(checkpoint) = store.load_checkpoint()? {
            info!(
                "📌 上次检查点: run_id={} last_processed_id={} ({})",
                checkpoint.run_id, checkpoint.last_processed_id, checkpoint.updated_at
            );
        }
        let shared = SharedRunState::load(store, config.force, config.skip_retries, config.max_retries)?;
        let extractor: Arc<dyn Extractor> = Arc::new(RegistryExtractor::new()?);

        Ok(Self {
            config: Arc::new(config),
            shared: Arc::new(shared),
            extractor,
        })
    }

    /// 替换页面抽取器
    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn shared_state(&self) -> &SharedRunState {
        &self.shared
    }

    /// 使用本地 Chrome 运行
    pub async fn run(&self) -> Result<RunSummary> {
        self.run_with(Arc::new(ChromiumLauncher)).await
    }

    /// 使用指定的会话启动器运行
    pub async fn run_with<L>(&self, launcher: Arc<L>) -> Result<RunSummary>
    where
        L: SessionLauncher + 'static,
    {
        let worklist = self.build_worklist();
        if worklist.ids.is_empty() {
            warn!("⚠️ 没有需要处理的 ID，程序结束");
            return Ok(RunSummary::default());
        }

        let run = self.shared.store().start_run()?;
        let workers = self.config.workers.max(1);
        logging::log_worklist(&run, worklist.ids.len(), worklist.retries, workers);

        let flow = Arc::new(IdFlow::new(self.config.clone(), self.extractor.clone()));
        let mut handles = Vec::new();
        for (slot, ids) in partition_striped(&worklist.ids, workers).into_iter().enumerate() {
            if ids.is_empty() {
                continue;
            }
            let worker_id = slot + 1;
            let worker = Worker {
                worker_id,
                run,
                config: self.config.clone(),
                shared: self.shared.clone(),
                flow: flow.clone(),
            };
            let launcher = launcher.clone();
            let handle = tokio::spawn(async move { worker.run(launcher, ids).await });
            handles.push((worker_id, handle));
        }

        let mut failed_workers = 0;
        for (worker_id, handle) in handles {
            match handle.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    error!("[worker {}] ❌ 退出: {:#}", worker_id, e);
                    failed_workers += 1;
                }
                Err(e) => {
                    error!("[worker {}] 任务执行失败: {}", worker_id, e);
                    failed_workers += 1;
                }
            }
        }

        let stats = self.shared.stats();
        logging::print_final_stats(run.run_id, &stats, failed_workers);
        Ok(RunSummary {
            run: Some(run),
            stats,
            failed_workers,
        })
    }

    /// 组装本次运行的工作列表
    ///
    /// 重试队列中的 ID 排在最前（升序），之后剔除本来就会被跳过的 ID。
    pub fn build_worklist(&self) -> Worklist {
        let mut selected = select_ids(&self.config);
        if let Some(max) = self.config.max_ids {
            selected.truncate(max);
        }
        let retries = if self.config.skip_retries {
            Vec::new()
        } else {
            self.shared.retry_ids()
        };

        let merged = merge_retries(&retries, &selected);
        let ids: Vec<u64> = merged
            .into_iter()
            .filter(|id| !self.shared.should_skip(*id))
            .collect();
        let retry_set: HashSet<u64> = retries.into_iter().collect();
        let retries = ids.iter().filter(|id| retry_set.contains(id)).count();
        Worklist { ids, retries }
    }
}

/// 显式列表优先，其次闭区间，否则默认样本
pub fn select_ids(config: &Config) -> Vec<u64> {
    if !config.ids.is_empty() {
        return config.ids.clone();
    }
    match (config.start_id, config.end_id) {
        (Some(start), Some(end)) => (start..=end).collect(),
        _ => DEFAULT_SAMPLE_IDS.to_vec(),
    }
}

/// 重试 ID 在前，其余按原顺序去重
pub fn merge_retries(retries: &[u64], ids: &[u64]) -> Vec<u64> {
    let mut seen = HashSet::new();
    retries
        .iter()
        .chain(ids.iter())
        .copied()
        .filter(|id| seen.insert(*id))
        .collect()
}

/// 按步长分区：第 i 个分区为 `ids[i], ids[i + n], ...`
pub fn partition_striped(ids: &[u64], workers: usize) -> Vec<Vec<u64>> {
    let workers = workers.max(1);
    (0..workers)
        .map(|offset| ids.iter().skip(offset).step_by(workers).copied().collect())
        .collect()
}
