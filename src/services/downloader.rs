//! 附件下载服务 - 业务能力层
//!
//! 职责：
//! - 把一个记录的附件逐个下载到该记录的持久目录
//! - 每个输入附件恰好产出一行 FileRecord，不论成败
//! - 单个附件失败不影响同一记录的其他附件
//! - 附件上下文用完即关，焦点回到主上下文

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::download_watch::{detect_download_error, DownloadWatch, WatchOutcome, WatchSettings};
use crate::browser::{BrowserSession, ContextHandle};
use crate::config::Config;
use crate::error::is_transport_fatal;
use crate::infrastructure::files::{dotted_extension, file_names, guess_mime, pdf_page_count, sha256_file_blocking};
use crate::infrastructure::Deadline;
use crate::models::{Attachment, DownloadStatus, FileRecord};

/// 下载参数
#[derive(Debug, Clone, Copy)]
pub struct DownloadSettings {
    pub watch: WatchSettings,
    /// 打开附件后、首次检查错误页之前的等待
    pub settle_delay: Duration,
    pub page_count_retries: u32,
    pub page_count_delay: Duration,
    /// 覆盖已存在的附件
    pub force: bool,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            watch: WatchSettings::default(),
            settle_delay: Duration::from_millis(1500),
            page_count_retries: 3,
            page_count_delay: Duration::from_secs(1),
            force: false,
        }
    }
}

impl DownloadSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            watch: WatchSettings {
                timeout: config.download_timeout(),
                stable_window: Duration::from_secs(config.download_stable_secs),
                stall_window: Duration::from_secs(config.download_stall_secs),
                poll_interval: Duration::from_millis(config.download_poll_ms.max(1)),
            },
            force: config.force,
            ..Self::default()
        }
    }
}

/// 一个记录的下载结果
#[derive(Debug, Default)]
pub struct DownloadBatch {
    /// 与输入附件一一对应
    pub files: Vec<FileRecord>,
    pub warnings: Vec<String>,
    /// 浏览器已失效时的错误文本，调用方据此重启会话
    pub restart_reason: Option<String>,
}

/// 附件下载服务
pub struct AttachmentDownloader {
    attachments_root: PathBuf,
    settings: DownloadSettings,
}

impl AttachmentDownloader {
    pub fn new(attachments_root: impl Into<PathBuf>, settings: DownloadSettings) -> Self {
        Self {
            attachments_root: attachments_root.into(),
            settings,
        }
    }

    /// 记录的持久附件目录
    pub fn id_dir(&self, id: u64) -> PathBuf {
        self.attachments_root.join(id.to_string())
    }

    /// `{id}_{序号}{原扩展名}`
    pub fn stored_filename(id: u64, file_index: u32, original_filename: &str) -> String {
        format!("{}_{}{}", id, file_index, dotted_extension(original_filename.trim()))
    }

    /// 离线模式：不下载，每个附件一行 SKIPPED_OFFLINE
    pub fn offline_records(&self, run_id: u64, id: u64, attachments: &[Attachment]) -> Vec<FileRecord> {
        attachments
            .iter()
            .zip(1u32..)
            .map(|(attachment, file_index)| {
                let name = Self::stored_filename(id, file_index, &attachment.original_filename);
                let path = self.id_dir(id).join(&name);
                FileRecord {
                    stored_path: path.to_string_lossy().into_owned(),
                    mime_type: guess_mime(&name),
                    stored_filename: name,
                    ..base_record(run_id, id, file_index, attachment, DownloadStatus::SkippedOffline)
                }
            })
            .collect()
    }

    /// 按文档顺序下载全部附件
    pub async fn download_all<S>(
        &self,
        session: &mut S,
        run_id: u64,
        id: u64,
        attachments: &[Attachment],
        deadline: &Deadline,
    ) -> DownloadBatch
    where
        S: BrowserSession + ?Sized,
    {
        let mut batch = DownloadBatch::default();
        let total = attachments.len();
        for (attachment, file_index) in attachments.iter().zip(1u32..) {
            debug!("[#{}] 📎 附件 {}/{}: {}", id, file_index, total, attachment.download_url);
            let record = self
                .download_one(session, run_id, id, file_index, attachment, deadline, &mut batch)
                .await;
            if record.download_status.is_failure() {
                warn!("[#{}] ⚠️ 附件 {}/{} 失败: {}", id, file_index, total, record.download_status);
            } else {
                info!("[#{}] ✓ 附件 {}/{}: {} ({})", id, file_index, total, record.stored_filename, record.download_status);
            }
            batch.files.push(record);
        }
        batch
    }

    #[allow(clippy::too_many_arguments)]
    async fn download_one<S>(
        &self,
        session: &mut S,
        run_id: u64,
        id: u64,
        file_index: u32,
        attachment: &Attachment,
        deadline: &Deadline,
        batch: &mut DownloadBatch,
    ) -> FileRecord
    where
        S: BrowserSession + ?Sized,
    {
        let failed = |status| base_record(run_id, id, file_index, attachment, status);
        let name = Self::stored_filename(id, file_index, &attachment.original_filename);
        let stored_path = self.id_dir(id).join(&name);

        if stored_path.exists() && !self.settings.force {
            return self.finished_record(&stored_path, failed(DownloadStatus::SkippedExists)).await;
        }

        let budget = deadline.remaining(self.settings.watch.timeout);
        if budget.is_zero() {
            return failed(DownloadStatus::FailedTimeout);
        }

        let download_dir = session.download_dir().to_path_buf();
        let before = match snapshot_names(&download_dir) {
            Ok(before) => before,
            Err(e) => {
                batch
                    .warnings
                    .push(format!("Attachment {} download dir unreadable: {}", file_index, e));
                return failed(DownloadStatus::FailedMissing);
            }
        };

        let handle = match session.open_in_new_context(&attachment.download_url).await {
            Ok(handle) => handle,
            Err(e) => {
                let message = format!("{:#}", e);
                batch.warnings.push(format!(
                    "Attachment {} ({}) failed to open: {}",
                    file_index, attachment.download_url, message
                ));
                if is_transport_fatal(&message) && batch.restart_reason.is_none() {
                    batch.restart_reason = Some(message);
                }
                return failed(DownloadStatus::FailedErrorPage);
            }
        };

        let settings = WatchSettings {
            timeout: budget,
            ..self.settings.watch
        };
        let outcome = self
            .await_outcome(session, &handle, &download_dir, before.clone(), settings)
            .await;

        if let Err(e) = session.close_context(&handle).await {
            debug!("[#{}] 关闭附件上下文失败（忽略）: {:#}", id, e);
        }
        // 失败的下载留下的文件会被下一个附件误认为自己的下载
        if matches!(outcome, Ok(WatchOutcome::Failed(_))) {
            discard_new_files(&download_dir, &before);
        }

        let downloaded = match outcome {
            Ok(WatchOutcome::Completed(path)) => path,
            Ok(WatchOutcome::Failed(status)) => return failed(status),
            Err(e) => {
                batch
                    .warnings
                    .push(format!("Attachment {} download dir unreadable: {}", file_index, e));
                return failed(DownloadStatus::FailedMissing);
            }
        };

        let stored_path = if dotted_extension(attachment.original_filename.trim()).is_empty() {
            let adopted = format!("{}_{}{}", id, file_index, dotted_extension(&file_name_of(&downloaded)));
            self.id_dir(id).join(adopted)
        } else {
            stored_path
        };

        if let Err(e) = move_into_place(&downloaded, &stored_path, self.settings.force) {
            warn!("[#{}] 移动附件失败: {} → {}: {}", id, downloaded.display(), stored_path.display(), e);
            return failed(DownloadStatus::FailedMissing);
        }
        let size = fs::metadata(&stored_path).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            // 空文件留着会在下次运行时被当成已存在的附件
            let _ = fs::remove_file(&stored_path);
            return failed(DownloadStatus::FailedMissing);
        }

        self.finished_record(&stored_path, failed(DownloadStatus::Downloaded)).await
    }

    /// 先等待页面稳定，再同时观察错误页与下载目录
    async fn await_outcome<S>(
        &self,
        session: &mut S,
        handle: &ContextHandle,
        download_dir: &Path,
        before: HashSet<String>,
        settings: WatchSettings,
    ) -> io::Result<WatchOutcome>
    where
        S: BrowserSession + ?Sized,
    {
        sleep(self.settings.settle_delay).await;
        if let Some(status) = check_error_page(session, handle).await {
            return Ok(WatchOutcome::Failed(status));
        }

        let mut watch = DownloadWatch::new(download_dir, before, settings);
        loop {
            if let Some(status) = check_error_page(session, handle).await {
                return Ok(WatchOutcome::Failed(status));
            }
            if let Some(outcome) = watch.poll()? {
                return Ok(outcome);
            }
            sleep(settings.poll_interval).await;
        }
    }

    /// 填充已落盘文件的名称、哈希、页数和 MIME 类型
    async fn finished_record(&self, path: &Path, mut record: FileRecord) -> FileRecord {
        let name = file_name_of(path);
        record.sha256 = match sha256_file_blocking(path).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!("计算哈希失败: {} - {}", path.display(), e);
                String::new()
            }
        };
        record.page_count = pdf_page_count(path, self.settings.page_count_retries, self.settings.page_count_delay).await;
        record.mime_type = guess_mime(&name);
        record.stored_path = path.to_string_lossy().into_owned();
        record.stored_filename = name;
        record
    }
}

fn base_record(run_id: u64, id: u64, file_index: u32, attachment: &Attachment, status: DownloadStatus) -> FileRecord {
    FileRecord {
        run_id,
        id,
        file_index,
        stored_filename: String::new(),
        stored_path: String::new(),
        original_filename: attachment.original_filename.trim().to_string(),
        download_url: attachment.download_url.trim().to_string(),
        document_index: attachment.document_index,
        document_number: attachment.document_number.clone(),
        page_count: 0,
        mime_type: String::new(),
        download_status: status,
        sha256: String::new(),
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn snapshot_names(dir: &Path) -> io::Result<HashSet<String>> {
    fs::create_dir_all(dir)?;
    Ok(file_names(dir)?.into_iter().collect())
}

fn discard_new_files(dir: &Path, before: &HashSet<String>) {
    let Ok(names) = file_names(dir) else {
        return;
    };
    for name in names.into_iter().filter(|n| !before.contains(n)) {
        let path = dir.join(&name);
        match fs::remove_file(&path) {
            Ok(()) => debug!("删除未完成的下载: {}", name),
            Err(e) => debug!("删除未完成的下载失败: {} - {}", path.display(), e),
        }
    }
}

/// 上下文可能已自行关闭，读取失败视为无错误标记
async fn check_error_page<S>(session: &mut S, handle: &ContextHandle) -> Option<DownloadStatus>
where
    S: BrowserSession + ?Sized,
{
    match session.context_page_source(handle).await {
        Ok(Some(html)) => detect_download_error(&html),
        Ok(None) => None,
        Err(e) => {
            debug!("读取附件页失败（忽略）: {:#}", e);
            None
        }
    }
}

/// 跨文件系统时 rename 会失败，退回复制 + 删除
fn move_into_place(from: &Path, to: &Path, force: bool) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if force && to.exists() {
        fs::remove_file(to)?;
    }
    if fs::rename(from, to).is_err() {
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn attachment(name: &str, index: u32) -> Attachment {
        Attachment {
            download_url: format!("https://host/download?uid={}", index),
            original_filename: name.to_string(),
            document_index: index,
            document_number: "N-1".to_string(),
        }
    }

    #[test]
    fn test_stored_filename_keeps_extension() {
        assert_eq!(AttachmentDownloader::stored_filename(42, 1, "scan.PDF"), "42_1.PDF");
        assert_eq!(AttachmentDownloader::stored_filename(42, 2, " ссылка "), "42_2");
    }

    #[test]
    fn test_offline_records_one_per_attachment() {
        let dir = tempdir().unwrap();
        let downloader = AttachmentDownloader::new(dir.path(), DownloadSettings::default());
        let rows = downloader.offline_records(7, 42, &[attachment("a.pdf", 1), attachment("b", 1)]);

        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.download_status == DownloadStatus::SkippedOffline));
        assert_eq!(rows[0].stored_filename, "42_1.pdf");
        assert_eq!(rows[0].mime_type, "application/pdf");
        assert!(rows[0].stored_path.ends_with("42_1.pdf"));
        assert_eq!(rows[1].file_index, 2);
        assert_eq!(rows[1].sha256, "");
        assert_eq!(rows[1].page_count, 0);
    }

    #[test]
    fn test_discard_new_files_keeps_earlier_ones() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("earlier.pdf"), b"1").unwrap();
        let before = snapshot_names(dir.path()).unwrap();
        fs::write(dir.path().join("late.pdf.crdownload"), b"2").unwrap();

        discard_new_files(dir.path(), &before);
        assert_eq!(file_names(dir.path()).unwrap(), vec!["earlier.pdf".to_string()]);
    }

    #[test]
    fn test_move_into_place_overwrites_when_forced() {
        let dir = tempdir().unwrap();
        let from = dir.path().join("in.pdf");
        let to = dir.path().join("42").join("42_1.pdf");
        fs::create_dir_all(to.parent().unwrap()).unwrap();
        fs::write(&to, b"old").unwrap();
        fs::write(&from, b"new").unwrap();

        move_into_place(&from, &to, true).unwrap();
        assert_eq!(fs::read(&to).unwrap(), b"new");
        assert!(!from.exists());
    }
}
