//! 业务能力层：附件下载、下载完成判定、HTML 快照

pub mod download_watch;
pub mod downloader;
pub mod snapshot;

pub use download_watch::{detect_download_error, DownloadWatch, WatchOutcome, WatchSettings};
pub use downloader::{AttachmentDownloader, DownloadBatch, DownloadSettings};
pub use snapshot::{PageKind, SnapshotWriter};
