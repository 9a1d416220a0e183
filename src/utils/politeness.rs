//! 请求间隔

use rand::Rng;
use std::time::Duration;
use tracing::debug;

use crate::config::Config;
use crate::models::Status;

/// 在 [min, max] 秒内均匀取一个时长
pub fn jitter(min_secs: f64, max_secs: f64) -> Duration {
    let (low, high) = if min_secs <= max_secs {
        (min_secs, max_secs)
    } else {
        (max_secs, min_secs)
    };
    let low = low.max(0.0);
    let high = high.max(low);
    let secs = if high > low {
        rand::thread_rng().gen_range(low..=high)
    } else {
        low
    };
    Duration::from_secs_f64(secs)
}

/// 处理完第 `position` 条（从 1 开始）之后的暂停区间
pub fn pause_bounds(config: &Config, status: Status, position: usize) -> (f64, f64) {
    if status == Status::Missing {
        (1.0, 2.0)
    } else if config.long_sleep_every > 0 && position % config.long_sleep_every == 0 {
        (config.long_sleep_min, config.long_sleep_max)
    } else {
        (config.sleep_min, config.sleep_max)
    }
}

/// 模拟人工浏览节奏的暂停
pub async fn human_sleep(min_secs: f64, max_secs: f64) {
    let pause = jitter(min_secs, max_secs);
    debug!("暂停 {:.1}s", pause.as_secs_f64());
    tokio::time::sleep(pause).await;
}
