//! 准入控制
//!
//! `DedupRegistry` 保证同一实验同时最多一个运行在处理;
//! `CancelSet` 记录尚未见到作业消息的取消请求。
//! 两者都由 Dispatcher 实例持有, 临界区只是常数时间的集合操作。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use autoreduce_core::{ExperimentId, RunIdentity};
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// 实验 -> 正在占用该实验的运行
///
/// 以规范化的实验编号为键, 整数形式的字符串与整数视为同一实验。
#[derive(Debug, Default)]
pub struct DedupRegistry {
    slots: Mutex<HashMap<ExperimentId, RunIdentity>>,
}

impl DedupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 运行所属实验空闲时登记并返回 true, 已被占用时返回 false
    pub fn try_acquire(&self, identity: &RunIdentity) -> bool {
        let mut slots = lock(&self.slots);
        if let Some(holder) = slots.get(&identity.experiment) {
            debug!("实验 {} 已被 {} 占用, {} 需要等待", identity.experiment, holder, identity);
            return false;
        }
        slots.insert(identity.experiment.clone(), identity.clone());
        true
    }

    pub fn release(&self, experiment_id: &ExperimentId) {
        lock(&self.slots).remove(&experiment_id.normalized());
    }

    pub fn holder(&self, experiment_id: &ExperimentId) -> Option<RunIdentity> {
        lock(&self.slots).get(&experiment_id.normalized()).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 获取槽位, 返回的守卫析构时释放
    pub fn try_claim(self: &Arc<Self>, identity: &RunIdentity) -> Option<AdmissionSlot> {
        self.try_acquire(identity).then(|| AdmissionSlot {
            registry: Arc::clone(self),
            experiment_id: identity.experiment.clone(),
        })
    }
}

/// 已占用的实验槽位
#[derive(Debug)]
pub struct AdmissionSlot {
    registry: Arc<DedupRegistry>,
    experiment_id: ExperimentId,
}

impl AdmissionSlot {
    pub fn experiment_id(&self) -> &ExperimentId {
        &self.experiment_id
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.registry.release(&self.experiment_id);
    }
}

/// 先于作业消息到达的取消请求
#[derive(Debug, Default)]
pub struct CancelSet {
    pending: Mutex<HashSet<RunIdentity>>,
}

impl CancelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: RunIdentity) {
        lock(&self.pending).insert(identity);
    }

    /// 命中时移除该条目, 每个取消请求只生效一次
    pub fn consume_if_cancelled(&self, identity: &RunIdentity) -> bool {
        lock(&self.pending).remove(identity)
    }

    pub fn contains(&self, identity: &RunIdentity) -> bool {
        lock(&self.pending).contains(identity)
    }
}
