// Bili Download Rust Library
// 哔哩哔哩媒体获取引擎核心库：可续传下载与音视频合流的编排引擎

// 配置管理模块
pub mod config;

// 日志系统
pub mod logging;

// 任务错误分类
pub mod error;

// 任务数据模型
pub mod task;

// 文件与文件夹命名辅助
pub mod naming;

// 传输单元（可续传 HTTP 下载）
pub mod transfer;

// 合流单元（MP4 样本级复用）
pub mod merge;

// 任务注册表
pub mod registry;

// 下载编排器
pub mod manager;

// 持久化与启动恢复
pub mod persist;

// 外部协作方接口
pub mod collab;

// 测试专用工具（本地 HTTP 服务器、MP4 素材）
#[cfg(test)]
pub(crate) mod testutil;

// 导出常用类型
pub use collab::{LocalStorageSink, MetadataTagger, StorageSink, TagMeta};
pub use config::{DownloadConfig, EngineConfig, LogConfig, PersistenceConfig};
pub use error::TaskError;
pub use manager::{DownloadManager, GroupSpec, RecoverySummary};
pub use merge::{merge_streams, MergeError, MergeReport};
pub use persist::{reconcile, RecoveryOutcome, Snapshot, SnapshotStore, SNAPSHOT_VERSION};
pub use registry::{EngineEvent, RegistrySnapshot, TaskRegistry};
pub use task::{
    classify_id, DownloadTask, MergePart, MergeState, TaskGroup, TaskIdAllocator, TaskIdClass,
    TaskKind, TaskStatus, TransferState, EXTRA_ID_START, MERGE_ID_START,
};
pub use transfer::{TransferEngine, TransferOutcome};
