//! 集成测试共用：脚本化的浏览器会话、页面样例、Parquet 读取

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use arrow::array::{Array, ListArray, StringArray, UInt32Array, UInt64Array};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use guarantee_harvester::browser::{BrowserSession, ContextHandle, SessionLauncher, SessionOptions};
use guarantee_harvester::config::{Config, Mode};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

pub const GENERAL_URL: &str = "http://registry.test/general/{id}";
pub const DOCUMENTS_URL: &str = "http://registry.test/documents/{id}";

pub fn general_url(id: u64) -> String {
    GENERAL_URL.replace("{id}", &id.to_string())
}

pub fn documents_url(id: u64) -> String {
    DOCUMENTS_URL.replace("{id}", &id.to_string())
}

pub fn attachment_url(id: u64, index: usize) -> String {
    format!("http://registry.test/filestore/download?uid={}-{}", id, index)
}

// ========== 页面样例 ==========

pub fn missing_page() -> String {
    "<html><body><h1>Запрашиваемая страница не существует</h1></body></html>".to_string()
}

pub fn general_page() -> String {
    r#"<html><body>
      <div class="cardMainInfo">
        <div class="cardMainInfo__section">
          <span class="cardMainInfo__title">Банк-гарант</span>
          <span class="cardMainInfo__content">ПАО Банк</span>
        </div>
      </div>
      <div class="blockInfo">
        <h2 class="blockInfo__title">Информация о банке-гаранте</h2>
        <section class="blockInfo__section">
          <span class="section__title">ИНН</span>
          <span class="section__info">7700000000</span>
        </section>
      </div>
    </body></html>"#
        .to_string()
}

/// 文档页：`count` 个附件，文件名 `scan{n}.pdf`
pub fn documents_page(id: u64, count: usize) -> String {
    let names: Vec<String> = (1..=count).map(|n| format!("scan{}.pdf", n)).collect();
    documents_page_named(id, &names.iter().map(String::as_str).collect::<Vec<_>>())
}

/// 文档页：附件按给定文件名依次编号
pub fn documents_page_named(id: u64, names: &[&str]) -> String {
    let attachments: String = names
        .iter()
        .zip(1..)
        .map(|(name, n)| {
            format!(
                r#"<div class="attachment">
                     <div class="attachment__value">Информация о банковской гарантии № G-{n} от 01.01.2024</div>
                     <a href="{url}" data-tooltip="{name}">скачать</a>
                   </div>"#,
                n = n,
                url = attachment_url(id, n),
                name = name
            )
        })
        .collect();
    format!(
        r#"<html><body><div class="card-attachments__block">
             <div class="title">Информация о банковской гарантии</div>{}</div></body></html>"#,
        attachments
    )
}

// ========== 脚本化会话 ==========

/// 打开附件链接后浏览器的行为
#[derive(Debug, Clone)]
pub enum DownloadScript {
    /// 立即写出完整文件
    Complete { name: String, bytes: Vec<u8> },
    /// 留下一个不再增长的临时文件
    Stall { name: String },
    /// 附件页显示错误内容，不下载
    ErrorPage(String),
}

/// 站点脚本：URL → 页面 / 就绪延迟 / 下载行为 / 导航错误 / 弹窗
#[derive(Debug, Default)]
pub struct SiteScript {
    pub pages: HashMap<String, String>,
    pub ready_delays: HashMap<String, Duration>,
    pub downloads: HashMap<String, DownloadScript>,
    pub navigation_errors: HashMap<String, String>,
    pub popups: HashMap<String, usize>,
}

impl SiteScript {
    pub fn page(mut self, url: String, html: String) -> Self {
        self.pages.insert(url, html);
        self
    }

    pub fn slow(mut self, url: String, delay: Duration) -> Self {
        self.ready_delays.insert(url, delay);
        self
    }

    pub fn download(mut self, url: String, script: DownloadScript) -> Self {
        self.downloads.insert(url, script);
        self
    }

    /// 导航到该 URL 时失败
    pub fn fail_navigation(mut self, url: String, message: &str) -> Self {
        self.navigation_errors.insert(url, message.to_string());
        self
    }

    /// 导航到该 URL 时额外弹出 `count` 个窗口
    pub fn popups(mut self, url: String, count: usize) -> Self {
        self.popups.insert(url, count);
        self
    }
}

/// 所有会话共用的观察记录
#[derive(Debug, Default)]
pub struct SessionLog {
    pub navigations: Vec<String>,
    pub opened: Vec<String>,
    /// 被关闭的上下文句柄
    pub closed: Vec<String>,
    pub launches: usize,
    pub restarts: usize,
    pub closes: usize,
}

pub struct FakeSession {
    script: Arc<SiteScript>,
    log: Arc<Mutex<SessionLog>>,
    download_dir: PathBuf,
    current: String,
    contexts: Vec<(ContextHandle, Option<String>)>,
    next_context: usize,
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn navigate(&mut self, url: &str, _timeout: Duration) -> Result<()> {
        self.log.lock().unwrap().navigations.push(url.to_string());
        if let Some(message) = self.script.navigation_errors.get(url) {
            bail!("{}", message);
        }
        self.current = url.to_string();
        for _ in 0..self.script.popups.get(url).copied().unwrap_or(0) {
            let handle = self.new_handle();
            self.contexts.push((handle, None));
        }
        Ok(())
    }

    async fn wait_ready(&mut self, _timeout: Duration) -> Result<()> {
        if let Some(delay) = self.script.ready_delays.get(&self.current) {
            tokio::time::sleep(*delay).await;
        }
        Ok(())
    }

    async fn wait_for_any_selector(&mut self, _selectors: &[&str], _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn current_page_source(&mut self) -> Result<String> {
        Ok(self
            .script
            .pages
            .get(&self.current)
            .cloned()
            .unwrap_or_else(|| "<html><body></body></html>".to_string()))
    }

    async fn open_in_new_context(&mut self, url: &str) -> Result<ContextHandle> {
        self.log.lock().unwrap().opened.push(url.to_string());
        let handle = self.new_handle();
        let mut page = None;
        match self.script.downloads.get(url) {
            Some(DownloadScript::Complete { name, bytes }) => {
                fs::write(self.download_dir.join(name), bytes)?;
            }
            Some(DownloadScript::Stall { name }) => {
                fs::write(self.download_dir.join(format!("{}.crdownload", name)), vec![1u8; 128])?;
            }
            Some(DownloadScript::ErrorPage(html)) => page = Some(html.clone()),
            None => bail!("unexpected attachment url: {}", url),
        }
        self.contexts.push((handle.clone(), page));
        Ok(handle)
    }

    async fn context_page_source(&mut self, handle: &ContextHandle) -> Result<Option<String>> {
        Ok(self
            .contexts
            .iter()
            .find(|(h, _)| h == handle)
            .and_then(|(_, page)| page.clone()))
    }

    async fn close_context(&mut self, handle: &ContextHandle) -> Result<()> {
        self.log.lock().unwrap().closed.push(handle.as_str().to_string());
        self.contexts.retain(|(h, _)| h != handle);
        Ok(())
    }

    async fn list_contexts(&mut self) -> Result<Vec<ContextHandle>> {
        let mut handles = vec![ContextHandle("main".to_string())];
        handles.extend(self.contexts.iter().map(|(h, _)| h.clone()));
        Ok(handles)
    }

    async fn restart(&mut self) -> Result<()> {
        self.log.lock().unwrap().restarts += 1;
        self.contexts.clear();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.log.lock().unwrap().closes += 1;
        Ok(())
    }

    fn download_dir(&self) -> &Path {
        &self.download_dir
    }
}

impl FakeSession {
    fn new_handle(&mut self) -> ContextHandle {
        self.next_context += 1;
        ContextHandle(format!("ctx-{}", self.next_context))
    }

    /// 仍然打开的非主上下文数
    pub fn open_contexts(&self) -> usize {
        self.contexts.len()
    }
}

pub struct FakeLauncher {
    pub script: Arc<SiteScript>,
    pub log: Arc<Mutex<SessionLog>>,
    /// 下载目录名为此值的 worker 启动失败
    pub fail_for: Option<String>,
}

impl FakeLauncher {
    pub fn new(script: SiteScript) -> Self {
        Self {
            script: Arc::new(script),
            log: Arc::new(Mutex::new(SessionLog::default())),
            fail_for: None,
        }
    }
}

#[async_trait]
impl SessionLauncher for FakeLauncher {
    type Session = FakeSession;

    async fn launch(&self, options: SessionOptions) -> Result<FakeSession> {
        let dir_name = options
            .download_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.fail_for.as_deref() == Some(dir_name.as_str()) {
            bail!("chrome failed to start");
        }
        fs::create_dir_all(&options.download_dir)?;
        self.log.lock().unwrap().launches += 1;
        Ok(FakeSession {
            script: self.script.clone(),
            log: self.log.clone(),
            download_dir: options.download_dir,
            current: "about:blank".to_string(),
            contexts: Vec::new(),
            next_context: 0,
        })
    }
}

// ========== 配置 ==========

pub fn live_config(data_dir: &Path, ids: Vec<u64>) -> Config {
    Config {
        mode: Mode::Live,
        ids,
        data_dir: data_dir.to_path_buf(),
        general_url_template: GENERAL_URL.to_string(),
        documents_url_template: DOCUMENTS_URL.to_string(),
        per_id_timeout_secs: 0,
        sleep_min: 0.0,
        sleep_max: 0.0,
        long_sleep_min: 0.0,
        long_sleep_max: 0.0,
        download_stable_secs: 1,
        download_stall_secs: 10,
        download_poll_ms: 500,
        ..Config::default()
    }
}

pub fn offline_config(data_dir: &Path, ids: Vec<u64>) -> Config {
    Config {
        mode: Mode::Offline,
        ids,
        data_dir: data_dir.to_path_buf(),
        ..Config::default()
    }
}

/// 为每个 ID 写一对离线样本（文档页带一个附件）
pub fn write_samples(data_dir: &Path, ids: impl IntoIterator<Item = u64>) {
    let samples = data_dir.join("samples");
    fs::create_dir_all(&samples).unwrap();
    for id in ids {
        fs::write(samples.join(format!("generalInformation_{}.html", id)), general_page()).unwrap();
        fs::write(samples.join(format!("document-info_{}.html", id)), documents_page(id, 1)).unwrap();
    }
}

/// 一个 `pages` 页的最小 PDF
pub fn pdf_bytes(pages: usize) -> Vec<u8> {
    use lopdf::{dictionary, Document, Object};

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let kids: Vec<Object> = (0..pages)
        .map(|_| {
            doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            })
            .into()
        })
        .collect();
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

// ========== 输出读取 ==========

fn parquet_files(data_dir: &Path, table: &str, prefix: &str) -> Vec<PathBuf> {
    let dir = data_dir.join("processed").join(table);
    let Ok(entries) = fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .map(|e| e.unwrap().path())
        .filter(|p| {
            let name = p.file_name().unwrap().to_string_lossy();
            name.starts_with(prefix) && name.ends_with(".parquet")
        })
        .collect();
    files.sort();
    files
}

fn batches(data_dir: &Path, table: &str, prefix: &str) -> Vec<RecordBatch> {
    parquet_files(data_dir, table, prefix)
        .into_iter()
        .flat_map(|path| {
            ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap())
                .unwrap()
                .build()
                .unwrap()
                .map(|b| b.unwrap())
                .collect::<Vec<_>>()
        })
        .collect()
}

/// 表中所有文件的行数
pub fn row_count(data_dir: &Path, table: &str) -> usize {
    batches(data_dir, table, table).iter().map(|b| b.num_rows()).sum()
}

pub fn parquet_file_count(data_dir: &Path, table: &str) -> usize {
    parquet_files(data_dir, table, table).len()
}

pub fn string_column(data_dir: &Path, table: &str, prefix: &str, column: &str) -> Vec<String> {
    let mut values = Vec::new();
    for batch in batches(data_dir, table, prefix) {
        let array = batch
            .column_by_name(column)
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap()
            .clone();
        values.extend((0..array.len()).map(|i| array.value(i).to_string()));
    }
    values
}

pub fn u32_column(data_dir: &Path, table: &str, prefix: &str, column: &str) -> Vec<u32> {
    let mut values = Vec::new();
    for batch in batches(data_dir, table, prefix) {
        let array = batch
            .column_by_name(column)
            .unwrap()
            .as_any()
            .downcast_ref::<UInt32Array>()
            .unwrap()
            .clone();
        values.extend(array.values().iter().copied());
    }
    values
}

pub fn id_column(data_dir: &Path, table: &str, prefix: &str) -> Vec<u64> {
    let mut values = Vec::new();
    for batch in batches(data_dir, table, prefix) {
        let array = batch
            .column_by_name("id")
            .unwrap()
            .as_any()
            .downcast_ref::<UInt64Array>()
            .unwrap()
            .clone();
        values.extend(array.values().iter().copied());
    }
    values
}

/// guarantee 表：(id, status, warnings)
pub fn guarantee_rows(data_dir: &Path) -> Vec<(u64, String, Vec<String>)> {
    let mut rows = Vec::new();
    for batch in batches(data_dir, "guarantees", "guarantees") {
        let ids = batch
            .column_by_name("id")
            .unwrap()
            .as_any()
            .downcast_ref::<UInt64Array>()
            .unwrap()
            .clone();
        let statuses = batch
            .column_by_name("status")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap()
            .clone();
        let warnings = batch
            .column_by_name("warnings")
            .unwrap()
            .as_any()
            .downcast_ref::<ListArray>()
            .unwrap()
            .clone();
        for i in 0..batch.num_rows() {
            let list = warnings.value(i);
            let list = list.as_any().downcast_ref::<StringArray>().unwrap();
            let items = (0..list.len()).map(|j| list.value(j).to_string()).collect();
            rows.push((ids.value(i), statuses.value(i).to_string(), items));
        }
    }
    rows.sort_by_key(|row| row.0);
    rows
}

pub fn processed_ids(data_dir: &Path) -> Vec<u64> {
    let content = fs::read_to_string(data_dir.join("state/processed_ids.txt")).unwrap_or_default();
    let mut ids: Vec<u64> = content.lines().filter_map(|l| l.trim().parse().ok()).collect();
    ids.sort_unstable();
    ids
}
