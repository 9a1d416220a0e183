use anyhow::Result;
use guarantee_harvester::utils::logging;
use guarantee_harvester::{App, Config};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置
    let config = Config::load()?;

    // 初始化日志（guard 保持到程序结束）
    let (_log_guard, log_file) = logging::init(&config)?;

    // 初始化并运行应用
    App::initialize(config).await?.run().await?;

    info!("\n日志已保存至: {}", log_file.display());
    Ok(())
}
