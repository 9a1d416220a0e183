//! 浏览器会话能力
//!
//! 一个 worker 持有一个会话，会话绑定 worker 私有的下载目录。
//! 会话不对页面内容做判断（例如"记录不存在"），那是调用方借助 Extractor 完成的。

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

/// 浏览器上下文（窗口/标签页）句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub String);

impl ContextHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 会话构造参数
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// 浏览器下载目录（worker 私有）
    pub download_dir: PathBuf,
    /// 浏览器用户数据目录（worker 私有）
    pub profile_dir: PathBuf,
    pub headless: bool,
    pub block_images: bool,
    pub user_agent: String,
}

/// 浏览器会话
#[async_trait]
pub trait BrowserSession: Send {
    /// 主上下文导航到 URL
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()>;

    /// 等待 `document.readyState == "complete"`
    async fn wait_ready(&mut self, timeout: Duration) -> Result<()>;

    /// 等待任一选择器出现
    async fn wait_for_any_selector(&mut self, selectors: &[&str], timeout: Duration) -> Result<()>;

    /// 主上下文当前 HTML
    async fn current_page_source(&mut self) -> Result<String>;

    /// 在新上下文中打开 URL（附件下载用）
    async fn open_in_new_context(&mut self, url: &str) -> Result<ContextHandle>;

    /// 指定上下文的 HTML；上下文已自行关闭时返回 `None`
    async fn context_page_source(&mut self, handle: &ContextHandle) -> Result<Option<String>>;

    /// 关闭上下文并把焦点还给主上下文；上下文已关闭时不报错
    async fn close_context(&mut self, handle: &ContextHandle) -> Result<()>;

    /// 当前打开的全部上下文（第一个为主上下文）
    async fn list_contexts(&mut self) -> Result<Vec<ContextHandle>>;

    /// 丢弃当前浏览器进程，用相同配置重新启动
    async fn restart(&mut self) -> Result<()>;

    /// 关闭浏览器
    async fn close(&mut self) -> Result<()>;

    fn download_dir(&self) -> &Path;
}

/// 会话启动器（worker 启动时调用）
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    type Session: BrowserSession + 'static;

    async fn launch(&self, options: SessionOptions) -> Result<Self::Session>;
}
