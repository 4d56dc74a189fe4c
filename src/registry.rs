//! 任务注册表
//!
//! 分组、任务与瞬态传输/合流状态的内存权威存储，界面视图的唯一数据源。
//! 所有修改收敛为同一把锁内的原子操作：操作短小、同步、锁内不做 I/O。
//! 变更通过广播通道对外通知，落后的订阅者丢弃中间进度、自行拉取快照补齐。

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::task::{DownloadTask, MergeState, TaskGroup, TaskStatus, TransferState};

/// 事件通道容量。进度事件高频，落后的消费者丢弃旧事件即可
const EVENT_CAPACITY: usize = 256;

/// 引擎事件（变更通知）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// 任务创建
    TaskCreated { task_id: i64, group_id: i64 },
    /// 进度更新
    Progress {
        task_id: i64,
        downloaded: u64,
        total: u64,
        speed: u64,
        progress: f64,
    },
    /// 状态变更
    StatusChanged {
        task_id: i64,
        old_status: TaskStatus,
        new_status: TaskStatus,
    },
    /// 任务移除
    TaskRemoved { task_id: i64 },
    /// 分组移除（最后一个任务被删除，或整组删除）
    GroupRemoved { group_id: i64 },
}

/// 注册表快照：观察者与持久化共用的深拷贝视图
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub groups: Vec<TaskGroup>,
    pub transfer_states: Vec<TransferState>,
    pub merge_states: Vec<MergeState>,
}

#[derive(Default)]
struct RegistryInner {
    /// group_id -> 分组（含其任务）
    groups: HashMap<i64, TaskGroup>,
    /// task_id -> group_id 反向索引，与分组内任务列表保持一致
    task_index: HashMap<i64, i64>,
    /// 单流任务续传状态
    transfer_states: HashMap<i64, TransferState>,
    /// 合流任务状态
    merge_states: HashMap<i64, MergeState>,
}

/// 任务注册表
pub struct TaskRegistry {
    inner: RwLock<RegistryInner>,
    events: broadcast::Sender<EngineEvent>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: RwLock::new(RegistryInner::default()),
            events,
        }
    }

    /// 订阅变更通知
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: EngineEvent) {
        // 没有订阅者时发送失败，属正常情况
        let _ = self.events.send(event);
    }

    // ==================== 分组 ====================

    /// 插入新分组
    pub fn insert_group(&self, group: TaskGroup) {
        let mut inner = self.inner.write();
        for task in &group.tasks {
            inner.task_index.insert(task.id, group.id);
        }
        inner.groups.insert(group.id, group);
    }

    /// 按外部引用（其次标题）查找已有分组
    pub fn find_group_id(&self, external_ref: Option<&str>, title: &str) -> Option<i64> {
        let inner = self.inner.read();
        if let Some(ext) = external_ref {
            if let Some(group) = inner
                .groups
                .values()
                .find(|g| g.external_ref.as_deref() == Some(ext))
            {
                return Some(group.id);
            }
        }
        inner
            .groups
            .values()
            .find(|g| g.external_ref.is_none() && g.title == title)
            .map(|g| g.id)
    }

    /// 当前所有分组的文件夹名集合（命名去重用）
    pub fn folder_names(&self) -> HashSet<String> {
        self.inner
            .read()
            .groups
            .values()
            .map(|g| g.folder_name.clone())
            .collect()
    }

    pub fn group(&self, group_id: i64) -> Option<TaskGroup> {
        self.inner.read().groups.get(&group_id).cloned()
    }

    /// 所有分组，按创建时间倒序（最新在前，与展示顺序一致）
    pub fn groups(&self) -> Vec<TaskGroup> {
        let mut groups: Vec<TaskGroup> = self.inner.read().groups.values().cloned().collect();
        groups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        groups
    }

    /// 移除整个分组，返回其任务（调用方负责清理文件与作业）
    pub fn remove_group(&self, group_id: i64) -> Option<TaskGroup> {
        let mut inner = self.inner.write();
        let group = inner.groups.remove(&group_id)?;
        for task in &group.tasks {
            inner.task_index.remove(&task.id);
            inner.transfer_states.remove(&task.id);
            inner.merge_states.remove(&task.id);
        }
        drop(inner);
        self.publish(EngineEvent::GroupRemoved { group_id });
        Some(group)
    }

    // ==================== 任务 ====================

    /// 向分组插入任务。分组必须已存在
    pub fn insert_task(&self, task: DownloadTask) -> bool {
        let mut inner = self.inner.write();
        let group_id = task.group_id;
        let Some(group) = inner.groups.get_mut(&group_id) else {
            return false;
        };
        let task_id = task.id;
        group.tasks.push(task);
        inner.task_index.insert(task_id, group_id);
        drop(inner);
        self.publish(EngineEvent::TaskCreated { task_id, group_id });
        true
    }

    pub fn get_task(&self, task_id: i64) -> Option<DownloadTask> {
        let inner = self.inner.read();
        let group_id = inner.task_index.get(&task_id)?;
        inner.groups.get(group_id)?.task(task_id).cloned()
    }

    /// 分组内所有任务 ID（分组操作的遍历基础）
    pub fn task_ids_of_group(&self, group_id: i64) -> Vec<i64> {
        self.inner
            .read()
            .groups
            .get(&group_id)
            .map(|g| g.tasks.iter().map(|t| t.id).collect())
            .unwrap_or_default()
    }

    /// 原子修改任务。状态发生变化时自动广播 StatusChanged
    pub fn update_task<F>(&self, task_id: i64, f: F) -> Option<DownloadTask>
    where
        F: FnOnce(&mut DownloadTask),
    {
        let (updated, old_status) = {
            let mut inner = self.inner.write();
            let group_id = *inner.task_index.get(&task_id)?;
            let task = inner.groups.get_mut(&group_id)?.task_mut(task_id)?;
            let old_status = task.status;
            f(task);
            (task.clone(), old_status)
        };
        if updated.status != old_status {
            debug!(
                "任务 {} 状态变更: {} -> {}",
                task_id, old_status, updated.status
            );
            self.publish(EngineEvent::StatusChanged {
                task_id,
                old_status,
                new_status: updated.status,
            });
        }
        Some(updated)
    }

    /// 进度专用更新：刷新计数并广播 Progress 事件
    pub fn update_progress(
        &self,
        task_id: i64,
        downloaded: u64,
        total: u64,
        speed: u64,
        eta_secs: Option<u64>,
    ) {
        let updated = self.update_task(task_id, |t| {
            t.set_progress(downloaded, total, speed, eta_secs);
        });
        if let Some(task) = updated {
            self.publish(EngineEvent::Progress {
                task_id,
                downloaded,
                total,
                speed,
                progress: task.progress,
            });
        }
    }

    /// 移除任务并维护一致性：清掉索引与状态，分组空了就删除分组
    pub fn remove_task(&self, task_id: i64) -> Option<DownloadTask> {
        let (removed, group_emptied) = {
            let mut inner = self.inner.write();
            let group_id = inner.task_index.remove(&task_id)?;
            inner.transfer_states.remove(&task_id);
            inner.merge_states.remove(&task_id);

            let group = inner.groups.get_mut(&group_id)?;
            let pos = group.tasks.iter().position(|t| t.id == task_id)?;
            let removed = group.tasks.remove(pos);
            let emptied = group.tasks.is_empty();
            if emptied {
                inner.groups.remove(&group_id);
            }
            (removed, emptied.then_some(group_id))
        };

        self.publish(EngineEvent::TaskRemoved { task_id });
        if let Some(group_id) = group_emptied {
            debug!("分组 {} 已无任务，自动移除", group_id);
            self.publish(EngineEvent::GroupRemoved { group_id });
        }
        Some(removed)
    }

    // ==================== 续传/合流状态 ====================

    pub fn set_transfer_state(&self, state: TransferState) {
        self.inner.write().transfer_states.insert(state.task_id, state);
    }

    pub fn get_transfer_state(&self, task_id: i64) -> Option<TransferState> {
        self.inner.read().transfer_states.get(&task_id).cloned()
    }

    /// 原子修改续传状态。状态已被移除（任务删除/取消）时是 no-op，
    /// 作业收尾不会复活已清理的状态
    pub fn update_transfer_state<F>(&self, task_id: i64, f: F) -> Option<TransferState>
    where
        F: FnOnce(&mut TransferState),
    {
        let mut inner = self.inner.write();
        let state = inner.transfer_states.get_mut(&task_id)?;
        f(state);
        Some(state.clone())
    }

    pub fn remove_transfer_state(&self, task_id: i64) -> Option<TransferState> {
        self.inner.write().transfer_states.remove(&task_id)
    }

    pub fn set_merge_state(&self, state: MergeState) {
        self.inner.write().merge_states.insert(state.task_id, state);
    }

    pub fn get_merge_state(&self, task_id: i64) -> Option<MergeState> {
        self.inner.read().merge_states.get(&task_id).cloned()
    }

    /// 原子修改合流状态，返回修改后的副本
    pub fn update_merge_state<F>(&self, task_id: i64, f: F) -> Option<MergeState>
    where
        F: FnOnce(&mut MergeState),
    {
        let mut inner = self.inner.write();
        let state = inner.merge_states.get_mut(&task_id)?;
        f(state);
        Some(state.clone())
    }

    pub fn remove_merge_state(&self, task_id: i64) -> Option<MergeState> {
        self.inner.write().merge_states.remove(&task_id)
    }

    /// 一次性武装合流触发器。
    /// 只有首个看到「双分支完成且未在合流」的调用者得到 true；
    /// 合流已在进行或已完成时重复触发是 no-op
    pub fn try_arm_merge(&self, task_id: i64) -> bool {
        let mut inner = self.inner.write();
        let Some(state) = inner.merge_states.get_mut(&task_id) else {
            return false;
        };
        if state.ready_to_merge() {
            state.merging = true;
            true
        } else {
            false
        }
    }

    // ==================== 快照与恢复 ====================

    /// 深拷贝快照（持久化与观察者共用）
    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.read();
        let mut groups: Vec<TaskGroup> = inner.groups.values().cloned().collect();
        groups.sort_by_key(|g| g.id);
        let mut transfer_states: Vec<TransferState> =
            inner.transfer_states.values().cloned().collect();
        transfer_states.sort_by_key(|s| s.task_id);
        let mut merge_states: Vec<MergeState> = inner.merge_states.values().cloned().collect();
        merge_states.sort_by_key(|s| std::cmp::Reverse(s.task_id));
        RegistrySnapshot {
            groups,
            transfer_states,
            merge_states,
        }
    }

    /// 启动恢复：整体装载对账后的数据。只在任何作业启动前调用
    pub fn restore(
        &self,
        groups: Vec<TaskGroup>,
        transfer_states: Vec<TransferState>,
        merge_states: Vec<MergeState>,
    ) {
        let mut inner = self.inner.write();
        inner.groups.clear();
        inner.task_index.clear();
        inner.transfer_states.clear();
        inner.merge_states.clear();
        for group in groups {
            for task in &group.tasks {
                inner.task_index.insert(task.id, group.id);
            }
            inner.groups.insert(group.id, group);
        }
        for state in transfer_states {
            inner.transfer_states.insert(state.task_id, state);
        }
        for state in merge_states {
            inner.merge_states.insert(state.task_id, state);
        }
    }

    /// 清空一切（硬重置）
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.groups.clear();
        inner.task_index.clear();
        inner.transfer_states.clear();
        inner.merge_states.clear();
    }

    /// 快照里的 ID 最值，用于播种分配器：
    /// (最大单流任务 ID, 最小合流 ID, 最小附属 ID, 最大分组 ID)
    pub fn id_bounds(&self) -> (i64, i64, i64, i64) {
        use crate::task::{classify_id, TaskIdClass, EXTRA_ID_START, MERGE_ID_START};
        let inner = self.inner.read();
        let mut max_single = 0i64;
        let mut min_merge = MERGE_ID_START + 1;
        let mut min_extra = EXTRA_ID_START + 1;
        let mut max_group = 0i64;
        for group in inner.groups.values() {
            max_group = max_group.max(group.id);
            for task in &group.tasks {
                match classify_id(task.id) {
                    TaskIdClass::Single => max_single = max_single.max(task.id),
                    TaskIdClass::Merge => min_merge = min_merge.min(task.id),
                    TaskIdClass::Extra => min_extra = min_extra.min(task.id),
                }
            }
        }
        (max_single, min_merge, min_extra, max_group)
    }
}
