//! 单条记录处理流程 - 流程层
//!
//! 核心职责：定义"一条记录"的抓取顺序
//!
//! 流程顺序：
//! 1. 基本信息页 → 不存在则结束（MISSING）
//! 2. 文档页 → 附件列表 + 文档元数据
//! 3. 附件下载（离线模式只登记）
//!
//! 每个挂起点都在截止时间的剩余预算内执行；出错时已抓到的内容保留在 `IdOutcome` 中。

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::browser::BrowserSession;
use crate::config::Config;
use crate::error::HarvestResult;
use crate::extractor::{Extractor, DOCUMENT_META_SECTION};
use crate::infrastructure::files::clean_download_dir;
use crate::infrastructure::Deadline;
use crate::models::{AttributeRecord, DownloadStatus, PrimaryPage, SecondaryPage};
use crate::services::{AttachmentDownloader, DownloadSettings, PageKind};
use crate::workflow::classify::IdOutcome;
use crate::workflow::id_ctx::IdCtx;

/// 页面等待的默认时限
pub const PAGE_WAIT: Duration = Duration::from_secs(30);
/// 导航的默认时限
pub const NAVIGATION_WAIT: Duration = Duration::from_secs(60);

pub const PRIMARY_READY_SELECTORS: [&str; 3] = ["h2.blockInfo__title", ".blockInfo__title", "body"];
pub const SECONDARY_READY_SELECTORS: [&str; 2] = [".attachment__text", "body"];

const MISSING_GENERAL_SAMPLE: &str = "Missing offline generalInformation HTML";
const MISSING_DOCUMENTS_SAMPLE: &str = "Missing offline document-info HTML";
const DOCUMENT_PAGE_MISSING: &str = "Document page missing";

/// 单条记录处理流程
///
/// - 决定先抓什么、何时停止
/// - 不持有浏览器会话，由 worker 借给它
/// - 不决定最终状态，只往 `IdOutcome` 里记录事实
pub struct IdFlow {
    config: Arc<Config>,
    extractor: Arc<dyn Extractor>,
    downloader: AttachmentDownloader,
    samples_dir: PathBuf,
}

impl IdFlow {
    pub fn new(config: Arc<Config>, extractor: Arc<dyn Extractor>) -> Self {
        let paths = config.paths();
        let downloader = AttachmentDownloader::new(paths.attachments, DownloadSettings::from_config(&config));
        Self {
            config,
            extractor,
            downloader,
            samples_dir: paths.samples,
        }
    }

    // ========== 在线模式 ==========

    pub async fn run_live<S>(
        &self,
        session: &mut S,
        ctx: &IdCtx,
        deadline: &Deadline,
        outcome: &mut IdOutcome,
    ) -> HarvestResult<()>
    where
        S: BrowserSession + ?Sized,
    {
        deadline.ensure_time_left()?;
        clean_download_dir(session.download_dir())?;

        let general_url = self.config.general_url(ctx.id);
        let html = self.load_page(session, &general_url, deadline, None).await?;
        outcome.general_html = Some(html.clone());
        if self.extractor.is_missing_page(&html) {
            info!("{} 记录不存在", ctx);
            outcome.mark_missing();
            return Ok(());
        }

        let html = self
            .load_page(session, &general_url, deadline, Some(&PRIMARY_READY_SELECTORS[..]))
            .await?;
        outcome.general_html = Some(html.clone());
        self.apply_primary(ctx, &html, outcome);

        deadline.ensure_time_left()?;
        let documents_url = self.config.documents_url(ctx.id);
        let html = self.load_page(session, &documents_url, deadline, None).await?;
        outcome.documents_html = Some(html.clone());
        if self.extractor.is_missing_page(&html) {
            warn!("{} ⚠️ 文档页不存在", ctx);
            outcome.downgrade(DOCUMENT_PAGE_MISSING);
            return Ok(());
        }

        let html = self
            .load_page(session, &documents_url, deadline, Some(&SECONDARY_READY_SELECTORS[..]))
            .await?;
        outcome.documents_html = Some(html.clone());
        let page = self.extractor.parse_secondary_page(&html);
        outcome.attachments_listed = page.attachments.len();
        outcome.warnings.extend(page.warnings.iter().cloned());
        outcome.attributes.extend(document_rows(ctx, &page));

        if page.attachments.is_empty() {
            return Ok(());
        }
        info!("{} 📎 发现 {} 个附件", ctx, page.attachments.len());
        let batch = self
            .downloader
            .download_all(session, ctx.run_id, ctx.id, &page.attachments, deadline)
            .await;
        outcome.warnings.extend(batch.warnings);
        if let Some(reason) = batch.restart_reason {
            outcome.error = reason.clone();
            outcome.request_restart(reason);
        }
        let ran_out = batch
            .files
            .iter()
            .any(|f| f.download_status == DownloadStatus::FailedTimeout);
        outcome.files = batch.files;

        if ran_out {
            deadline.ensure_time_left()?;
        }
        Ok(())
    }

    /// 导航（仅当 `selectors` 为空时）并等待就绪，返回当前 HTML
    ///
    /// 第二次调用（带选择器）复用已加载的页面，只等选择器再重新读取 HTML。
    async fn load_page<S>(
        &self,
        session: &mut S,
        url: &str,
        deadline: &Deadline,
        selectors: Option<&[&str]>,
    ) -> HarvestResult<String>
    where
        S: BrowserSession + ?Sized,
    {
        match selectors {
            None => {
                debug!("打开页面: {}", url);
                let budget = deadline.remaining(NAVIGATION_WAIT);
                deadline.guard(NAVIGATION_WAIT, session.navigate(url, budget)).await?;
                let budget = deadline.remaining(PAGE_WAIT);
                deadline.guard(PAGE_WAIT, session.wait_ready(budget)).await?;
            }
            Some(selectors) => {
                let budget = deadline.remaining(PAGE_WAIT);
                deadline
                    .guard(PAGE_WAIT, session.wait_for_any_selector(selectors, budget))
                    .await?;
            }
        }
        deadline.guard(PAGE_WAIT, session.current_page_source()).await
    }

    // ========== 离线模式 ==========

    pub async fn run_offline(&self, ctx: &IdCtx, deadline: &Deadline, outcome: &mut IdOutcome) -> HarvestResult<()> {
        deadline.ensure_time_left()?;
        match self.load_sample(PageKind::General, ctx.id)? {
            None => outcome.mark_error(MISSING_GENERAL_SAMPLE),
            Some(html) => {
                if self.extractor.is_missing_page(&html) {
                    outcome.general_html = Some(html);
                    outcome.mark_missing();
                    return Ok(());
                }
                self.apply_primary(ctx, &html, outcome);
                outcome.general_html = Some(html);
            }
        }

        deadline.ensure_time_left()?;
        let Some(html) = self.load_sample(PageKind::Documents, ctx.id)? else {
            outcome.downgrade(MISSING_DOCUMENTS_SAMPLE);
            return Ok(());
        };
        if self.extractor.is_missing_page(&html) {
            outcome.documents_html = Some(html);
            outcome.downgrade(DOCUMENT_PAGE_MISSING);
            return Ok(());
        }

        let page = self.extractor.parse_secondary_page(&html);
        outcome.documents_html = Some(html);
        outcome.attachments_listed = page.attachments.len();
        outcome.warnings.extend(page.warnings.iter().cloned());
        outcome.files = self
            .downloader
            .offline_records(ctx.run_id, ctx.id, &page.attachments);
        outcome.attributes.extend(document_rows(ctx, &page));
        Ok(())
    }

    /// 读取样本 HTML；不存在或为空返回 `None`
    fn load_sample(&self, kind: PageKind, id: u64) -> HarvestResult<Option<String>> {
        let path = self.samples_dir.join(kind.file_name(id));
        match fs::read_to_string(&path) {
            Ok(html) if html.trim().is_empty() => Ok(None),
            Ok(html) => Ok(Some(html)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn apply_primary(&self, ctx: &IdCtx, html: &str, outcome: &mut IdOutcome) {
        let page = self.extractor.parse_primary_page(html);
        debug!("{} 解析到 {} 个分区", ctx, page.sections.len());
        outcome.warnings.extend(page.warnings.iter().cloned());
        outcome.attributes.extend(section_rows(ctx, &page));
    }
}

// ========== 记录转换 ==========

fn section_rows(ctx: &IdCtx, page: &PrimaryPage) -> Vec<AttributeRecord> {
    page.sections
        .iter()
        .flat_map(|(section, fields)| {
            fields.iter().map(move |(name, value)| AttributeRecord {
                run_id: ctx.run_id,
                id: ctx.id,
                section: section.clone(),
                field_name: name.clone(),
                field_value: value.clone(),
                document_index: None,
                document_number: None,
            })
        })
        .collect()
}

fn document_rows(ctx: &IdCtx, page: &SecondaryPage) -> Vec<AttributeRecord> {
    page.document_metadata
        .iter()
        .map(|field| AttributeRecord {
            run_id: ctx.run_id,
            id: ctx.id,
            section: DOCUMENT_META_SECTION.to_string(),
            field_name: field.field_name.clone(),
            field_value: field.field_value.clone(),
            document_index: Some(field.document_index),
            document_number: Some(field.document_number.clone()),
        })
        .collect()
}
