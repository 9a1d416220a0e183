//! 下载完成判定 - 业务能力层
//!
//! 观察 worker 私有下载目录中"新出现"的文件，判定一次浏览器发起的下载
//! 是完成、卡死还是超时。只看目录，不碰浏览器；错误页由调用方探测。

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::infrastructure::files::file_names;
use crate::models::DownloadStatus;

/// 浏览器下载中的临时文件扩展名
pub const IN_PROGRESS_EXTENSIONS: [&str; 2] = [".crdownload", ".part"];

/// 判定参数
#[derive(Debug, Clone, Copy)]
pub struct WatchSettings {
    /// 总时限
    pub timeout: Duration,
    /// 完成文件大小保持不变的时长
    pub stable_window: Duration,
    /// 下载中文件大小不变多久视为卡死
    pub stall_window: Duration,
    /// 轮询间隔
    pub poll_interval: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            stable_window: Duration::from_secs(3),
            stall_window: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// 判定结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// 下载完成，文件位于下载目录中
    Completed(PathBuf),
    /// 下载失败
    Failed(DownloadStatus),
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    size: u64,
    changed_at: Instant,
}

pub fn is_in_progress(name: &str) -> bool {
    let lower = name.to_lowercase();
    IN_PROGRESS_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// 识别附件页上的服务端错误标记
pub fn detect_download_error(html: &str) -> Option<DownloadStatus> {
    let not_found = (html.contains("File with uid") && html.contains("not found"))
        || (html.contains("Файл с uid") && html.contains("не найден"));
    if not_found {
        return Some(DownloadStatus::FailedNotFound);
    }
    if html.contains("\"status\":\"ERROR\"") {
        return Some(DownloadStatus::FailedErrorPage);
    }
    None
}

/// 一次下载的观察器
///
/// 每次 `poll` 读取一次目录并推进状态，调用方负责在两次 `poll` 之间等待。
pub struct DownloadWatch {
    dir: PathBuf,
    before: HashSet<String>,
    settings: WatchSettings,
    started: Instant,
    observed: HashMap<String, Observation>,
}

impl DownloadWatch {
    /// `before` 为打开附件前下载目录中已有的文件名
    pub fn new(dir: &Path, before: HashSet<String>, settings: WatchSettings) -> Self {
        Self {
            dir: dir.to_path_buf(),
            before,
            settings,
            started: Instant::now(),
            observed: HashMap::new(),
        }
    }

    /// 推进一次；`None` 表示尚未有结论
    pub fn poll(&mut self) -> io::Result<Option<WatchOutcome>> {
        let now = Instant::now();
        let fresh: Vec<String> = file_names(&self.dir)?
            .into_iter()
            .filter(|name| !self.before.contains(name))
            .collect();

        self.observed.retain(|name, _| fresh.contains(name));
        for name in &fresh {
            // 临时文件可能在两次系统调用之间被浏览器改名
            let Ok(meta) = fs::metadata(self.dir.join(name)) else {
                continue;
            };
            let size = meta.len();
            let entry = self.observed.entry(name.clone()).or_insert(Observation {
                size,
                changed_at: now,
            });
            if entry.size != size {
                entry.size = size;
                entry.changed_at = now;
            }
        }

        let mut completed: Vec<(&String, &Observation)> = self
            .observed
            .iter()
            .filter(|(name, _)| !is_in_progress(name))
            .collect();
        completed.sort_by_key(|(name, obs)| (obs.changed_at, name.to_string()));
        if let Some((name, _)) = completed
            .into_iter()
            .find(|(_, obs)| now.duration_since(obs.changed_at) >= self.settings.stable_window)
        {
            debug!("下载完成: {}", name);
            return Ok(Some(WatchOutcome::Completed(self.dir.join(name))));
        }

        let stalled = self
            .observed
            .iter()
            .filter(|(name, _)| is_in_progress(name))
            .find(|(_, obs)| now.duration_since(obs.changed_at) >= self.settings.stall_window)
            .map(|(name, _)| name.clone());
        if let Some(name) = stalled {
            let path = self.dir.join(&name);
            warn!("⚠️ 下载卡死 ({}s 无进展)，删除: {}", self.settings.stall_window.as_secs(), name);
            if let Err(e) = fs::remove_file(&path) {
                debug!("删除卡死文件失败: {} - {}", path.display(), e);
            }
            return Ok(Some(WatchOutcome::Failed(DownloadStatus::FailedStalled)));
        }

        if now.duration_since(self.started) >= self.settings.timeout {
            return Ok(Some(WatchOutcome::Failed(DownloadStatus::FailedTimeout)));
        }
        Ok(None)
    }
}
