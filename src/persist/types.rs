//! 持久化快照结构
//!
//! 快照是进程重启后唯一幸存的数据：全部分组（各自带任务）、
//! 单流续传状态与合流分支状态。结构变更时递增版本号

use serde::{Deserialize, Serialize};

use crate::registry::RegistrySnapshot;
use crate::task::{MergeState, TaskGroup, TransferState};

/// 当前快照版本
pub const SNAPSHOT_VERSION: u32 = 1;

/// 持久化快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// 快照版本
    pub version: u32,
    /// 全部分组（各自携带任务）
    #[serde(default)]
    pub groups: Vec<TaskGroup>,
    /// 单流任务续传状态（按任务 ID）
    #[serde(default)]
    pub resumable_states: Vec<TransferState>,
    /// 合流任务状态（按任务 ID）
    #[serde(default)]
    pub merge_states: Vec<MergeState>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            groups: Vec::new(),
            resumable_states: Vec::new(),
            merge_states: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl From<RegistrySnapshot> for Snapshot {
    fn from(snapshot: RegistrySnapshot) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            groups: snapshot.groups,
            resumable_states: snapshot.transfer_states,
            merge_states: snapshot.merge_states,
        }
    }
}
