//! 运行状态存储 - 基础设施层
//!
//! 持久化：运行计数器、已处理 ID 日志、重试队列、检查点、字段并集。
//! 本身不加锁，所有写操作由调用方在共享运行锁内执行。

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{AttributeRecord, Checkpoint, Run};

/// ID → 已尝试次数
pub type RetryState = BTreeMap<u64, u32>;

/// 分区 → 出现过的全部字段名
pub type AttributeUnion = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Serialize, Deserialize)]
struct RunCounter {
    last_run_id: u64,
    /// 最近一次运行的开始时间
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    updated_at: String,
}

/// 运行状态存储
#[derive(Debug, Clone)]
pub struct RunStateStore {
    run_counter_path: PathBuf,
    processed_ids_path: PathBuf,
    retry_state_path: PathBuf,
    checkpoint_path: PathBuf,
    attribute_union_path: PathBuf,
}

impl RunStateStore {
    /// `state_dir` 存放计数器/日志/重试/检查点，`attribute_union_path` 存放字段并集
    pub fn new(state_dir: &Path, attribute_union_path: PathBuf) -> Self {
        Self {
            run_counter_path: state_dir.join("run_state.json"),
            processed_ids_path: state_dir.join("processed_ids.txt"),
            retry_state_path: state_dir.join("retry_queue.json"),
            checkpoint_path: state_dir.join("checkpoint.json"),
            attribute_union_path,
        }
    }

    /// 读取已处理 ID 集合，忽略空行和无法解析的行
    pub fn load_processed_ids(&self) -> Result<HashSet<u64>> {
        if !self.processed_ids_path.exists() {
            return Ok(HashSet::new());
        }
        let content = fs::read_to_string(&self.processed_ids_path)
            .with_context(|| format!("无法读取: {}", self.processed_ids_path.display()))?;
        Ok(content
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    /// 追加一个已处理 ID（每行一个整数）
    pub fn append_processed_id(&self, id: u64) -> Result<()> {
        ensure_parent(&self.processed_ids_path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.processed_ids_path)
            .with_context(|| format!("无法打开: {}", self.processed_ids_path.display()))?;
        writeln!(file, "{}", id)?;
        file.sync_data()?;
        Ok(())
    }

    pub fn load_retry_state(&self) -> Result<RetryState> {
        load_json(&self.retry_state_path)
    }

    pub fn save_retry_state(&self, state: &RetryState) -> Result<()> {
        save_json(&self.retry_state_path, state)
    }

    /// 递增运行计数器并登记开始时间
    pub fn start_run(&self) -> Result<Run> {
        let last = self.last_run()?.map(|run| run.run_id).unwrap_or(0);
        let run = Run {
            run_id: last + 1,
            started_at: Utc::now(),
        };
        save_json(
            &self.run_counter_path,
            &RunCounter {
                last_run_id: run.run_id,
                started_at: Some(run.started_at),
                updated_at: run.started_at.to_rfc3339(),
            },
        )?;
        debug!("分配运行 ID: {} ({})", run.run_id, run.started_at);
        Ok(run)
    }

    /// 最近一次登记的运行；旧格式的计数器没有开始时间，按更新时间补齐
    pub fn last_run(&self) -> Result<Option<Run>> {
        if !self.run_counter_path.exists() {
            return Ok(None);
        }
        let counter: RunCounter = load_json_strict(&self.run_counter_path)?;
        let started_at = counter.started_at.unwrap_or_else(|| {
            DateTime::parse_from_rfc3339(&counter.updated_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_default()
        });
        Ok(Some(Run {
            run_id: counter.last_run_id,
            started_at,
        }))
    }

    pub fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        if !self.checkpoint_path.exists() {
            return Ok(None);
        }
        load_json_strict(&self.checkpoint_path).map(Some)
    }

    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        save_json(&self.checkpoint_path, checkpoint)
    }

    pub fn load_attribute_union(&self) -> Result<AttributeUnion> {
        load_json(&self.attribute_union_path)
    }

    /// 把新字段并入字段并集，有变化时落盘；返回是否有变化
    pub fn merge_attribute_union(
        &self,
        union: &mut AttributeUnion,
        rows: &[AttributeRecord],
    ) -> Result<bool> {
        let mut changed = false;
        for row in rows {
            if row.section.is_empty() || row.field_name.is_empty() {
                continue;
            }
            changed |= union
                .entry(row.section.clone())
                .or_default()
                .insert(row.field_name.clone());
        }
        if changed || !self.attribute_union_path.exists() {
            save_json(&self.attribute_union_path, union)?;
        }
        Ok(changed)
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("无法创建目录: {}", parent.display()))?;
    }
    Ok(())
}

/// 文件不存在或内容损坏时返回默认值
fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    match load_json_strict(path) {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!("状态文件无法解析，使用空状态: {} ({:#})", path.display(), e);
            Ok(T::default())
        }
    }
}

fn load_json_strict<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        fs::read_to_string(path).with_context(|| format!("无法读取: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("无法解析: {}", path.display()))
}

/// 先写临时文件再改名，读者不会看到写了一半的文件
fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(value)?;
    fs::write(&tmp, payload).with_context(|| format!("无法写入: {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("无法替换: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunStats;
    use tempfile::tempdir;

    fn store(dir: &Path) -> RunStateStore {
        RunStateStore::new(&dir.join("state"), dir.join("processed").join("attribute_union.json"))
    }

    fn attr(section: &str, field: &str) -> AttributeRecord {
        AttributeRecord {
            run_id: 1,
            id: 1,
            section: section.to_string(),
            field_name: field.to_string(),
            field_value: "v".to_string(),
            document_index: None,
            document_number: None,
        }
    }

    #[test]
    fn test_run_ids_are_monotonic() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.last_run().unwrap().is_none());
        assert_eq!(store.start_run().unwrap().run_id, 1);
        assert_eq!(store.start_run().unwrap().run_id, 2);
        let third = store.start_run().unwrap();
        assert_eq!(third.run_id, 3);
        assert_eq!(store.last_run().unwrap(), Some(third));
    }

    #[test]
    fn test_counter_without_start_time_still_loads() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        fs::create_dir_all(dir.path().join("state")).unwrap();
        fs::write(
            dir.path().join("state/run_state.json"),
            r#"{"last_run_id": 4, "updated_at": "2024-03-01T10:00:00+00:00"}"#,
        )
        .unwrap();

        let last = store.last_run().unwrap().unwrap();
        assert_eq!(last.run_id, 4);
        assert_eq!(last.started_at.to_rfc3339(), "2024-03-01T10:00:00+00:00");
        assert_eq!(store.start_run().unwrap().run_id, 5);
    }

    #[test]
    fn test_processed_ids_append_and_reload() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.load_processed_ids().unwrap().is_empty());
        store.append_processed_id(7).unwrap();
        store.append_processed_id(9).unwrap();
        store.append_processed_id(7).unwrap();
        let ids = store.load_processed_ids().unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&7) && ids.contains(&9));
    }

    #[test]
    fn test_processed_ids_tolerate_garbage_lines() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        fs::create_dir_all(dir.path().join("state")).unwrap();
        fs::write(dir.path().join("state/processed_ids.txt"), "1\n\nabc\n 2 \n").unwrap();
        let ids = store.load_processed_ids().unwrap();
        assert_eq!(ids, HashSet::from([1, 2]));
    }

    #[test]
    fn test_retry_state_round_trip() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.load_retry_state().unwrap().is_empty());
        let state = RetryState::from([(11, 1), (1962721, 2)]);
        store.save_retry_state(&state).unwrap();
        assert_eq!(store.load_retry_state().unwrap(), state);
    }

    #[test]
    fn test_checkpoint_overwrites() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.load_checkpoint().unwrap().is_none());
        for last in [3, 4] {
            store
                .save_checkpoint(&Checkpoint {
                    run_id: 1,
                    last_processed_id: last,
                    stats: RunStats::default(),
                    updated_at: Utc::now(),
                })
                .unwrap();
        }
        assert_eq!(store.load_checkpoint().unwrap().unwrap().last_processed_id, 4);
    }

    #[test]
    fn test_attribute_union_grows_monotonically() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut union = store.load_attribute_union().unwrap();
        assert!(store
            .merge_attribute_union(&mut union, &[attr("A", "x"), attr("A", "y")])
            .unwrap());
        assert!(!store.merge_attribute_union(&mut union, &[attr("A", "x")]).unwrap());
        assert!(store
            .merge_attribute_union(&mut union, &[attr("B", "z"), attr("", "ignored")])
            .unwrap());

        let reloaded = store.load_attribute_union().unwrap();
        assert_eq!(reloaded["A"].len(), 2);
        assert_eq!(reloaded["B"].len(), 1);
        assert_eq!(reloaded.len(), 2);
    }
}
