//! 程序配置
//!
//! 解析顺序：内置默认值 → `HARVESTER_CONFIG` 指向的 TOML 文件 → 环境变量覆盖。
//! 核心只接收一个 `Config` 值对象，不做命令行解析。

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 默认样本 ID（未指定 ID 列表和区间时使用）
pub const DEFAULT_SAMPLE_IDS: [u64; 4] = [1962721, 11, 1, 196221];

/// 运行模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// 从 samples/ 读取本地 HTML，不启动浏览器
    Offline,
    /// 驱动真实浏览器抓取
    Live,
}

impl Mode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "offline" => Some(Mode::Offline),
            "live" => Some(Mode::Live),
            _ => None,
        }
    }

    pub fn is_live(self) -> bool {
        self == Mode::Live
    }
}

/// 程序配置
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 运行模式
    pub mode: Mode,
    /// 显式 ID 列表（优先于区间）
    pub ids: Vec<u64>,
    /// 区间起点（含）
    pub start_id: Option<u64>,
    /// 区间终点（含）
    pub end_id: Option<u64>,
    /// 截断 ID 列表（在合并重试队列之前）
    pub max_ids: Option<usize>,
    /// 并发 worker 数量
    pub workers: usize,
    /// 单个 ID 的处理时限（秒），0 表示不限
    pub per_id_timeout_secs: u64,
    /// 单个附件的下载时限（秒）
    pub download_timeout_secs: u64,
    /// 下载中文件多久不增长视为卡死（秒）
    pub download_stall_secs: u64,
    /// 完成文件大小保持不变多久视为下载完成（秒）
    pub download_stable_secs: u64,
    /// 下载目录轮询间隔（毫秒）
    pub download_poll_ms: u64,
    /// 最大重试次数
    pub max_retries: u32,
    /// 强制重新处理已完成的 ID
    pub force: bool,
    /// 不合并重试队列
    pub skip_retries: bool,
    /// 无头模式
    pub headless: bool,
    /// 禁止加载图片
    pub block_images: bool,
    /// 请求间隔下限（秒）
    pub sleep_min: f64,
    /// 请求间隔上限（秒）
    pub sleep_max: f64,
    /// 每处理多少个 ID 做一次长暂停
    pub long_sleep_every: usize,
    pub long_sleep_min: f64,
    pub long_sleep_max: f64,
    /// worker 启动错峰（秒 × (worker_id - 1)）
    pub worker_start_delay: f64,
    /// 总是保存 HTML 快照
    pub save_html: bool,
    /// 每个 worker 前 N 个 ID 保存 HTML 快照
    pub save_html_first_n: usize,
    /// 输出批大小
    pub batch_size: usize,
    /// 数据根目录
    pub data_dir: PathBuf,
    /// 是否显示详细日志
    pub verbose: bool,
    /// 基本信息页 URL 模板（`{id}` 占位）
    pub general_url_template: String,
    /// 文档页 URL 模板（`{id}` 占位）
    pub documents_url_template: String,
    /// 浏览器 User-Agent
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Offline,
            ids: Vec::new(),
            start_id: None,
            end_id: None,
            max_ids: None,
            workers: 1,
            per_id_timeout_secs: 30,
            download_timeout_secs: 300,
            download_stall_secs: 120,
            download_stable_secs: 3,
            download_poll_ms: 1000,
            max_retries: 3,
            force: false,
            skip_retries: false,
            headless: false,
            block_images: false,
            sleep_min: 5.0,
            sleep_max: 15.0,
            long_sleep_every: 25,
            long_sleep_min: 30.0,
            long_sleep_max: 60.0,
            worker_start_delay: 0.0,
            save_html: false,
            save_html_first_n: 10,
            batch_size: 200,
            data_dir: PathBuf::from("data"),
            verbose: false,
            general_url_template: "https://zakupki.gov.ru/epz/bankguarantee/guaranteeCard/generalInformation.html?guaranteeInfoId={id}".to_string(),
            documents_url_template: "https://zakupki.gov.ru/epz/bankguarantee/guaranteeCard/document-info.html?guaranteeInfoId={id}".to_string(),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".to_string(),
        }
    }
}

impl Config {
    /// 加载配置：默认值 → TOML 文件（可选）→ 环境变量
    pub fn load() -> Result<Self> {
        let base = match std::env::var("HARVESTER_CONFIG") {
            Ok(path) => Self::from_toml_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        Ok(base.with_env_overrides())
    }

    /// 从 TOML 文件读取配置，缺省字段取默认值
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("无法读取配置文件: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("无法解析配置文件: {}", path.display()))
    }

    /// 仅从环境变量构建配置
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    fn with_env_overrides(self) -> Self {
        let d = self;
        Self {
            mode: env_var("HARVEST_MODE").and_then(|v| Mode::parse(&v)).unwrap_or(d.mode),
            ids: env_var("HARVEST_IDS").map(|v| parse_id_list(&v)).unwrap_or(d.ids),
            start_id: env_parse("HARVEST_START_ID").or(d.start_id),
            end_id: env_parse("HARVEST_END_ID").or(d.end_id),
            max_ids: env_parse("HARVEST_MAX_IDS").or(d.max_ids),
            workers: env_parse("HARVEST_WORKERS").unwrap_or(d.workers),
            per_id_timeout_secs: env_parse("HARVEST_PER_ID_TIMEOUT").unwrap_or(d.per_id_timeout_secs),
            download_timeout_secs: env_parse("HARVEST_DOWNLOAD_TIMEOUT").unwrap_or(d.download_timeout_secs),
            download_stall_secs: env_parse("HARVEST_DOWNLOAD_STALL").unwrap_or(d.download_stall_secs),
            download_stable_secs: env_parse("HARVEST_DOWNLOAD_STABLE").unwrap_or(d.download_stable_secs),
            download_poll_ms: env_parse("HARVEST_DOWNLOAD_POLL_MS").unwrap_or(d.download_poll_ms),
            max_retries: env_parse("HARVEST_MAX_RETRIES").unwrap_or(d.max_retries),
            force: env_parse("HARVEST_FORCE").unwrap_or(d.force),
            skip_retries: env_parse("HARVEST_SKIP_RETRIES").unwrap_or(d.skip_retries),
            headless: env_parse("HARVEST_HEADLESS").unwrap_or(d.headless),
            block_images: env_parse("HARVEST_BLOCK_IMAGES").unwrap_or(d.block_images),
            sleep_min: env_parse("HARVEST_SLEEP_MIN").unwrap_or(d.sleep_min),
            sleep_max: env_parse("HARVEST_SLEEP_MAX").unwrap_or(d.sleep_max),
            long_sleep_every: env_parse("HARVEST_LONG_SLEEP_EVERY").unwrap_or(d.long_sleep_every),
            long_sleep_min: env_parse("HARVEST_LONG_SLEEP_MIN").unwrap_or(d.long_sleep_min),
            long_sleep_max: env_parse("HARVEST_LONG_SLEEP_MAX").unwrap_or(d.long_sleep_max),
            worker_start_delay: env_parse("HARVEST_WORKER_START_DELAY").unwrap_or(d.worker_start_delay),
            save_html: env_parse("HARVEST_SAVE_HTML").unwrap_or(d.save_html),
            save_html_first_n: env_parse("HARVEST_SAVE_HTML_FIRST_N").unwrap_or(d.save_html_first_n),
            batch_size: env_parse("HARVEST_BATCH_SIZE").unwrap_or(d.batch_size),
            data_dir: env_var("HARVEST_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            verbose: env_parse("VERBOSE_LOGGING").unwrap_or(d.verbose),
            general_url_template: env_var("HARVEST_GENERAL_URL").unwrap_or(d.general_url_template),
            documents_url_template: env_var("HARVEST_DOCUMENTS_URL").unwrap_or(d.documents_url_template),
            user_agent: env_var("HARVEST_USER_AGENT").unwrap_or(d.user_agent),
        }
    }

    /// 目录布局
    pub fn paths(&self) -> Paths {
        Paths::new(&self.data_dir)
    }

    pub fn general_url(&self, id: u64) -> String {
        self.general_url_template.replace("{id}", &id.to_string())
    }

    pub fn documents_url(&self, id: u64) -> String {
        self.documents_url_template.replace("{id}", &id.to_string())
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// 数据目录布局
#[derive(Clone, Debug)]
pub struct Paths {
    pub raw_html: PathBuf,
    pub attachments: PathBuf,
    pub processed: PathBuf,
    pub state: PathBuf,
    pub samples: PathBuf,
    pub logs: PathBuf,
    profiles: PathBuf,
}

impl Paths {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            raw_html: data_dir.join("raw").join("html"),
            attachments: data_dir.join("raw").join("attachments"),
            processed: data_dir.join("processed"),
            state: data_dir.join("state"),
            samples: data_dir.join("samples"),
            logs: data_dir.join("logs"),
            profiles: data_dir.join("raw").join("profiles"),
        }
    }

    /// worker 私有的浏览器下载目录
    pub fn incoming_dir(&self, worker_id: usize) -> PathBuf {
        self.attachments.join("_incoming").join(format!("worker_{}", worker_id))
    }

    /// worker 私有的浏览器用户数据目录
    pub fn profile_dir(&self, worker_id: usize) -> PathBuf {
        self.profiles.join(format!("worker_{}", worker_id))
    }

    pub fn attribute_union(&self) -> PathBuf {
        self.processed.join("attribute_union.json")
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.trim().parse().ok())
}

/// 解析逗号分隔的 ID 列表，忽略无法解析的项
pub fn parse_id_list(value: &str) -> Vec<u64> {
    value
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_list_skips_garbage() {
        assert_eq!(parse_id_list("1, 2,,x, 30"), vec![1, 2, 30]);
        assert!(parse_id_list("").is_empty());
    }

    #[test]
    fn test_toml_partial_config_keeps_defaults() {
        let config: Config = toml::from_str("mode = \"live\"\nworkers = 4\nids = [5, 6]\n").unwrap();
        assert_eq!(config.mode, Mode::Live);
        assert_eq!(config.workers, 4);
        assert_eq!(config.ids, vec![5, 6]);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.batch_size, 200);
    }

    #[test]
    fn test_url_templates() {
        let config = Config {
            general_url_template: "http://x/g?id={id}".to_string(),
            documents_url_template: "http://x/d?id={id}".to_string(),
            ..Config::default()
        };
        assert_eq!(config.general_url(42), "http://x/g?id=42");
        assert_eq!(config.documents_url(42), "http://x/d?id=42");
    }

    #[test]
    fn test_worker_dirs_are_namespaced() {
        let paths = Paths::new(Path::new("/tmp/data"));
        assert_ne!(paths.incoming_dir(1), paths.incoming_dir(2));
        assert!(paths.incoming_dir(3).ends_with("_incoming/worker_3"));
    }
}
