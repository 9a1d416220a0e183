//! 基于 chromiumoxide 的浏览器会话

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use super::session::{BrowserSession, ContextHandle, SessionLauncher, SessionOptions};

/// 等待类操作的轮询间隔
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// 关闭浏览器的最长等待
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// 启动本地 Chrome 的启动器
#[derive(Debug, Default, Clone)]
pub struct ChromiumLauncher;

#[async_trait]
impl SessionLauncher for ChromiumLauncher {
    type Session = ChromiumSession;

    async fn launch(&self, options: SessionOptions) -> Result<ChromiumSession> {
        ChromiumSession::launch(options).await
    }
}

/// 一个 Chrome 进程 + 主页面 + 临时打开的附件上下文
pub struct ChromiumSession {
    options: SessionOptions,
    browser: Browser,
    handler_task: JoinHandle<()>,
    page: Page,
    contexts: HashMap<String, Page>,
}

impl ChromiumSession {
    /// 启动浏览器并设置下载目录
    pub async fn launch(options: SessionOptions) -> Result<Self> {
        info!("🚀 启动浏览器 (下载目录: {})", options.download_dir.display());
        std::fs::create_dir_all(&options.download_dir)
            .with_context(|| format!("无法创建下载目录: {}", options.download_dir.display()))?;

        let (browser, handler_task) = launch_browser(&options).await?;

        let download_path = options.download_dir.canonicalize()?.to_string_lossy().into_owned();
        let behavior = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Allow)
            .download_path(download_path)
            .build()
            .map_err(|e| anyhow!("配置下载行为失败: {}", e))?;
        browser.execute(behavior).await.context("设置下载目录失败")?;

        let page = browser.new_page("about:blank").await.map_err(|e| {
            error!("创建页面失败: {}", e);
            anyhow!("创建页面失败: {}", e)
        })?;
        debug!("浏览器启动成功");

        Ok(Self {
            options,
            browser,
            handler_task,
            page,
            contexts: HashMap::new(),
        })
    }

    fn handle_of(page: &Page) -> ContextHandle {
        ContextHandle(page.target_id().inner().clone())
    }

    async fn shutdown(&mut self) {
        for (_, page) in self.contexts.drain() {
            let _ = page.close().await;
        }
        match timeout(SHUTDOWN_TIMEOUT, self.browser.close()).await {
            Ok(Ok(_)) => {
                let _ = timeout(SHUTDOWN_TIMEOUT, self.browser.wait()).await;
            }
            Ok(Err(e)) => debug!("关闭浏览器失败（忽略）: {}", e),
            Err(_) => debug!("关闭浏览器超时（忽略）"),
        }
        self.handler_task.abort();
    }
}

async fn launch_browser(options: &SessionOptions) -> Result<(Browser, JoinHandle<()>)> {
    let mut builder = BrowserConfig::builder()
        .user_data_dir(&options.profile_dir)
        .request_timeout(Duration::from_secs(60))
        .args(vec![
            "--start-maximized".to_string(),
            "--disable-blink-features=AutomationControlled".to_string(),
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            format!("--user-agent={}", options.user_agent),
        ]);
    builder = if options.headless {
        builder.new_headless_mode()
    } else {
        builder.with_head()
    };
    if options.block_images {
        builder = builder.arg("--blink-settings=imagesEnabled=false");
    }
    let config = builder.build().map_err(|e| {
        error!("配置浏览器失败: {}", e);
        anyhow!("配置浏览器失败: {}", e)
    })?;

    let (browser, mut handler) = Browser::launch(config).await.map_err(|e| {
        error!("启动浏览器失败: {}", e);
        anyhow!("启动浏览器失败: {}", e)
    })?;

    // 在后台处理浏览器事件
    let handler_task = tokio::spawn(async move {
        while let Some(h) = handler.next().await {
            if h.is_err() {
                break;
            }
        }
    });

    // 添加短暂延迟以等待浏览器状态同步
    sleep(Duration::from_millis(300)).await;

    Ok((browser, handler_task))
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn navigate(&mut self, url: &str, limit: Duration) -> Result<()> {
        debug!("导航到: {}", url);
        match timeout(limit, self.page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(anyhow!("导航到 {} 失败: {}", url, e)),
            Err(_) => bail!("导航到 {} 超时 ({}s)", url, limit.as_secs()),
        }
    }

    async fn wait_ready(&mut self, limit: Duration) -> Result<()> {
        let until = Instant::now() + limit;
        loop {
            let state = self
                .page
                .evaluate("document.readyState")
                .await
                .map_err(|e| anyhow!("读取 readyState 失败: {}", e))?
                .into_value::<String>()
                .unwrap_or_default();
            if state == "complete" {
                return Ok(());
            }
            if Instant::now() >= until {
                bail!("页面未就绪 ({}s, readyState={})", limit.as_secs(), state);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_for_any_selector(&mut self, selectors: &[&str], limit: Duration) -> Result<()> {
        let until = Instant::now() + limit;
        loop {
            for selector in selectors {
                if self.page.find_element(*selector).await.is_ok() {
                    return Ok(());
                }
            }
            if Instant::now() >= until {
                bail!("等待选择器超时 ({}s): {:?}", limit.as_secs(), selectors);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn current_page_source(&mut self) -> Result<String> {
        self.page
            .content()
            .await
            .map_err(|e| anyhow!("读取页面内容失败: {}", e))
    }

    async fn open_in_new_context(&mut self, url: &str) -> Result<ContextHandle> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| anyhow!("创建下载页面失败: {}", e))?;
        let handle = Self::handle_of(&page);
        // 触发下载的导航会被浏览器中止，不等待导航结果
        let script = format!("window.location.href = {};", serde_json::to_string(url)?);
        if let Err(e) = page.evaluate(script).await {
            debug!("打开附件链接返回错误（下载可能已开始）: {}", e);
        }
        self.contexts.insert(handle.0.clone(), page);
        Ok(handle)
    }

    async fn context_page_source(&mut self, handle: &ContextHandle) -> Result<Option<String>> {
        match self.contexts.get(handle.as_str()) {
            Some(page) => Ok(page.content().await.ok()),
            None => Ok(None),
        }
    }

    async fn close_context(&mut self, handle: &ContextHandle) -> Result<()> {
        if handle == &Self::handle_of(&self.page) {
            return Ok(());
        }
        if let Some(page) = self.contexts.remove(handle.as_str()) {
            if let Err(e) = page.close().await {
                debug!("关闭上下文失败（可能已自行关闭）: {}", e);
            }
        } else if let Ok(pages) = self.browser.pages().await {
            for page in pages {
                if Self::handle_of(&page) == *handle {
                    let _ = page.close().await;
                }
            }
        }
        let _ = self.page.bring_to_front().await;
        Ok(())
    }

    async fn list_contexts(&mut self) -> Result<Vec<ContextHandle>> {
        let primary = Self::handle_of(&self.page);
        let mut handles = vec![primary.clone()];
        let pages = self
            .browser
            .pages()
            .await
            .map_err(|e| anyhow!("获取页面列表失败: {}", e))?;
        for page in pages {
            let handle = Self::handle_of(&page);
            if handle != primary {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    async fn restart(&mut self) -> Result<()> {
        warn!("♻️ 重启浏览器...");
        self.shutdown().await;
        let fresh = ChromiumSession::launch(self.options.clone()).await?;
        *self = fresh;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.shutdown().await;
        Ok(())
    }

    fn download_dir(&self) -> &Path {
        &self.options.download_dir
    }
}
