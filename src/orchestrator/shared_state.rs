//! 运行级共享状态
//!
//! 所有 worker 共用一把锁，保护四样东西：已处理 ID 集合、重试计数、字段并集、检查点统计。
//! 锁只在每条记录结束时的同步提交里持有，从不跨越 `.await`。

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use chrono::Utc;
use tracing::debug;

use crate::infrastructure::{AttributeUnion, RetryState, RunStateStore};
use crate::models::{AttributeRecord, Checkpoint, RunStats, Status};

struct Ledger {
    processed: HashSet<u64>,
    retry: RetryState,
    union: AttributeUnion,
    stats: RunStats,
}

/// 注入每个 worker 的共享运行状态
pub struct SharedRunState {
    store: RunStateStore,
    force: bool,
    /// 忽略重试队列：已处理的 ID 一律跳过
    skip_retries: bool,
    max_retries: u32,
    ledger: Mutex<Ledger>,
}

impl SharedRunState {
    /// 从存储中载入已处理集合、重试计数和字段并集
    pub fn load(store: RunStateStore, force: bool, skip_retries: bool, max_retries: u32) -> Result<Self> {
        let ledger = Ledger {
            processed: store.load_processed_ids()?,
            retry: store.load_retry_state()?,
            union: store.load_attribute_union()?,
            stats: RunStats::default(),
        };
        debug!(
            "载入运行状态: 已处理 {} 条, 待重试 {} 条",
            ledger.processed.len(),
            ledger.retry.len()
        );
        Ok(Self {
            store,
            force,
            skip_retries,
            max_retries,
            ledger: Mutex::new(ledger),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &RunStateStore {
        &self.store
    }

    /// 已处理且未强制的 ID 跳过，除非它在重试队列中且本次不忽略重试
    pub fn should_skip(&self, id: u64) -> bool {
        if self.force {
            return false;
        }
        let ledger = self.lock();
        ledger.processed.contains(&id) && (self.skip_retries || !ledger.retry.contains_key(&id))
    }

    /// 仍可重试的 ID（升序）
    pub fn retry_ids(&self) -> Vec<u64> {
        self.lock()
            .retry
            .iter()
            .filter(|(_, attempts)| **attempts < self.max_retries)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn retry_snapshot(&self) -> RetryState {
        self.lock().retry.clone()
    }

    pub fn is_processed(&self, id: u64) -> bool {
        self.lock().processed.contains(&id)
    }

    /// 本次运行的累计统计
    pub fn stats(&self) -> RunStats {
        self.lock().stats
    }

    /// 行没有写出的 ID 放回重试队列，下次运行不会跳过它们
    ///
    /// 已有的尝试次数保留。
    pub fn requeue(&self, ids: &[u64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut ledger = self.lock();
        for &id in ids {
            ledger.retry.entry(id).or_insert(0);
        }
        self.store.save_retry_state(&ledger.retry)
    }

    /// 提交一条记录的最终结果
    ///
    /// 每一步都会执行；任何一步落盘失败时返回第一个错误，内存状态仍然更新。
    pub fn commit(
        &self,
        run_id: u64,
        id: u64,
        status: Status,
        attributes: &[AttributeRecord],
        file_count: usize,
    ) -> Result<()> {
        let mut guard = self.lock();
        let ledger = &mut *guard;
        let mut first_error: Option<anyhow::Error> = None;
        let mut keep = |result: Result<()>| {
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        };

        keep(self
            .store
            .merge_attribute_union(&mut ledger.union, attributes)
            .map(|_| ()));

        if ledger.processed.insert(id) {
            keep(self.store.append_processed_id(id));
        }

        ledger.stats.record(status, file_count);

        if status.is_retryable() {
            let attempts = ledger.retry.get(&id).copied().unwrap_or(0) + 1;
            if attempts < self.max_retries {
                ledger.retry.insert(id, attempts);
            } else {
                ledger.retry.remove(&id);
            }
        } else {
            ledger.retry.remove(&id);
        }
        keep(self.store.save_retry_state(&ledger.retry));

        keep(self.store.save_checkpoint(&Checkpoint {
            run_id,
            last_processed_id: id,
            stats: ledger.stats,
            updated_at: Utc::now(),
        }));

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn state(dir: &std::path::Path, force: bool, max_retries: u32) -> SharedRunState {
        let store = RunStateStore::new(&dir.join("state"), dir.join("union.json"));
        SharedRunState::load(store, force, false, max_retries).unwrap()
    }

    fn attr(section: &str, field: &str) -> AttributeRecord {
        AttributeRecord {
            run_id: 1,
            id: 9,
            section: section.to_string(),
            field_name: field.to_string(),
            field_value: "v".to_string(),
            document_index: None,
            document_number: None,
        }
    }

    #[test]
    fn test_retry_bound() {
        let dir = tempdir().unwrap();
        let shared = state(dir.path(), false, 3);

        shared.commit(1, 9, Status::Error, &[], 0).unwrap();
        assert_eq!(shared.retry_snapshot().get(&9), Some(&1));
        assert!(!shared.should_skip(9));

        shared.commit(2, 9, Status::Timeout, &[], 0).unwrap();
        assert_eq!(shared.retry_snapshot().get(&9), Some(&2));

        shared.commit(3, 9, Status::Partial, &[], 0).unwrap();
        assert!(shared.retry_snapshot().is_empty());
        assert!(shared.should_skip(9));

        let reloaded = state(dir.path(), false, 3);
        assert!(reloaded.retry_ids().is_empty());
        assert!(reloaded.should_skip(9));
    }

    #[test]
    fn test_skip_retries_skips_processed_retry_entries() {
        let dir = tempdir().unwrap();
        let shared = state(dir.path(), false, 3);
        shared.commit(1, 6, Status::Error, &[], 0).unwrap();
        assert!(!shared.should_skip(6));

        let store = RunStateStore::new(&dir.path().join("state"), dir.path().join("union.json"));
        let ignoring = SharedRunState::load(store, false, true, 3).unwrap();
        assert!(ignoring.should_skip(6));
        assert!(!ignoring.should_skip(8));
        // 队列本身不受影响
        assert_eq!(ignoring.retry_ids(), vec![6]);
    }

    #[test]
    fn test_requeue_keeps_attempts_and_persists() {
        let dir = tempdir().unwrap();
        let shared = state(dir.path(), false, 3);
        shared.commit(1, 1, Status::Ok, &[], 0).unwrap();
        shared.commit(1, 2, Status::Timeout, &[], 0).unwrap();
        assert!(shared.should_skip(1));

        shared.requeue(&[1, 2]).unwrap();
        assert!(!shared.should_skip(1));
        assert!(!shared.should_skip(2));

        let reloaded = state(dir.path(), false, 3);
        assert_eq!(reloaded.retry_snapshot(), RetryState::from([(1, 0), (2, 1)]));
        assert_eq!(reloaded.retry_ids(), vec![1, 2]);
    }

    #[test]
    fn test_success_clears_retry_entry() {
        let dir = tempdir().unwrap();
        let shared = state(dir.path(), false, 3);
        shared.commit(1, 4, Status::Error, &[], 0).unwrap();
        shared.commit(1, 4, Status::Missing, &[], 0).unwrap();
        assert!(shared.retry_ids().is_empty());
    }

    #[test]
    fn test_processed_log_is_appended_once() {
        let dir = tempdir().unwrap();
        let shared = state(dir.path(), true, 3);
        shared.commit(1, 7, Status::Ok, &[], 2).unwrap();
        shared.commit(1, 7, Status::Ok, &[], 1).unwrap();

        let log = std::fs::read_to_string(dir.path().join("state/processed_ids.txt")).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(!shared.should_skip(7));
        assert_eq!(shared.stats().ok, 2);
        assert_eq!(shared.stats().files, 3);
    }

    #[test]
    fn test_commit_writes_checkpoint_and_union() {
        let dir = tempdir().unwrap();
        let shared = state(dir.path(), false, 3);
        shared
            .commit(5, 9, Status::Ok, &[attr("A", "x"), attr("A", "y"), attr("B", "x")], 0)
            .unwrap();

        let checkpoint = shared.store().load_checkpoint().unwrap().unwrap();
        assert_eq!(checkpoint.run_id, 5);
        assert_eq!(checkpoint.last_processed_id, 9);
        assert_eq!(checkpoint.stats.ok, 1);

        let union = shared.store().load_attribute_union().unwrap();
        assert_eq!(union["A"].len(), 2);
        assert!(union["B"].contains("x"));
    }
}
