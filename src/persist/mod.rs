//! 持久化与启动恢复
//!
//! - `types`: 版本化快照结构（重启后唯一幸存的数据）
//! - `store`: 去抖动的快照存储，终态变更走强制落盘
//! - `recovery`: 启动时的一次性对账

pub mod recovery;
pub mod store;
pub mod types;

pub use recovery::{reconcile, RecoveryOutcome};
pub use store::SnapshotStore;
pub use types::{Snapshot, SNAPSHOT_VERSION};
