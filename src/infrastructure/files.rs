//! 附件文件工具：内容哈希、PDF 页数、MIME 类型、下载目录清理

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use sha2::{Digest, Sha256};
use tracing::debug;

/// 清空下载目录中的文件（目录不存在则创建）
pub fn clean_download_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// 目录中当前所有文件名
pub fn file_names(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

/// 文件内容的 SHA-256（十六进制）
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// 在阻塞线程池上计算 SHA-256，附件可能很大
pub async fn sha256_file_blocking(path: &Path) -> io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

/// 根据文件名猜测 MIME 类型，未知为空串
pub fn guess_mime(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_default()
}

/// 文件扩展名（带点），无扩展名为空串
pub fn dotted_extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case("pdf"))
}

fn read_page_count(path: &Path) -> Result<u32> {
    let document = lopdf::Document::load(path)?;
    Ok(document.get_pages().len() as u32)
}

async fn read_page_count_blocking(path: &Path) -> Result<u32> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || read_page_count(&path)).await?
}

/// PDF 页数；非 PDF 为 0
///
/// 文件句柄可能短暂被占用，失败时按间隔重试，全部失败返回 0。
pub async fn pdf_page_count(path: &Path, retries: u32, delay: Duration) -> u32 {
    if !is_pdf(path) {
        return 0;
    }
    let attempts = retries.max(1);
    for attempt in 1..=attempts {
        match read_page_count_blocking(path).await {
            Ok(count) => return count,
            Err(e) => {
                debug!("读取 PDF 页数失败 ({}/{}): {} - {:#}", attempt, attempts, path.display(), e);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    0
}
