//! 快照存储
//!
//! 单个后台作业负责写盘：脏标记把一段静默期内的多次变更合并成一次
//! 原子写入（临时文件 + rename），任务到达成功/取消终态时调用
//! `flush_now` 立即落盘，避免崩溃丢掉一次完成。

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::types::{Snapshot, SNAPSHOT_VERSION};
use crate::registry::TaskRegistry;

pub struct SnapshotStore {
    path: PathBuf,
    registry: Arc<TaskRegistry>,
    quiet_period: Duration,
    dirty: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    flush_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SnapshotStore {
    pub fn new(path: PathBuf, quiet_period: Duration, registry: Arc<TaskRegistry>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            path,
            registry,
            quiet_period,
            dirty: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            flush_task: parking_lot::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// 标记注册表有变更待落盘
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// 启动后台去抖动写盘作业。重复调用是 no-op
    pub fn start(&self) {
        let mut guard = self.flush_task.lock();
        if guard.is_some() {
            return;
        }
        let path = self.path.clone();
        let registry = self.registry.clone();
        let dirty = self.dirty.clone();
        let quiet_period = self.quiet_period;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(quiet_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if dirty.swap(false, Ordering::AcqRel) {
                            if let Err(err) = write_snapshot(&path, &registry).await {
                                error!("定期写快照失败: {}", err);
                                dirty.store(true, Ordering::Release);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        // 关停前把挂着的变更写完
                        if dirty.swap(false, Ordering::AcqRel) {
                            if let Err(err) = write_snapshot(&path, &registry).await {
                                error!("关停前写快照失败: {}", err);
                            }
                        }
                        break;
                    }
                }
            }
        });
        *guard = Some(handle);
        info!(
            "快照存储已启动: {:?} (静默期 {}ms)",
            self.path,
            self.quiet_period.as_millis()
        );
    }

    /// 立即落盘，绕过去抖动。终态变更专用
    pub async fn flush_now(&self) -> std::io::Result<()> {
        self.dirty.store(false, Ordering::Release);
        write_snapshot(&self.path, &self.registry).await
    }

    /// 读取上次的快照。文件缺失、损坏或版本不符都按「无快照」处理
    pub async fn load(&self) -> Option<Snapshot> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(c) => c,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!("读取快照失败 {:?}: {}", self.path, err);
                return None;
            }
        };
        match serde_json::from_slice::<Snapshot>(&content) {
            Ok(snapshot) if snapshot.version == SNAPSHOT_VERSION => Some(snapshot),
            Ok(snapshot) => {
                warn!(
                    "快照版本不符: 文件 {} != 当前 {}，忽略",
                    snapshot.version, SNAPSHOT_VERSION
                );
                None
            }
            Err(err) => {
                warn!("解析快照失败 {:?}: {}", self.path, err);
                None
            }
        }
    }

    /// 关停后台作业并完成最后一次写入
    pub async fn shutdown(&self) {
        let handle = self.flush_task.lock().take();
        if let Some(handle) = handle {
            let _ = self.shutdown_tx.send(true);
            let _ = handle.await;
        }
    }

}

/// 原子写入：写临时文件再 rename，崩溃也不会留下半个快照
async fn write_snapshot(path: &std::path::Path, registry: &TaskRegistry) -> std::io::Result<()> {
    let snapshot: Snapshot = registry.snapshot().into();
    let content = serde_json::to_vec_pretty(&snapshot)?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let temp_path = path.with_extension("json.tmp");
    tokio::fs::write(&temp_path, &content).await?;
    tokio::fs::rename(&temp_path, path).await?;
    debug!(
        "快照已写入: {} 个分组, {} 字节",
        snapshot.groups.len(),
        content.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{DownloadTask, TaskGroup, TaskKind};

    fn registry_with_one_task() -> Arc<TaskRegistry> {
        let registry = Arc::new(TaskRegistry::new());
        registry.insert_group(TaskGroup::new(
            1,
            "标题".into(),
            String::new(),
            None,
            None,
            "标题".into(),
        ));
        registry.insert_task(DownloadTask::new(
            1,
            1,
            TaskKind::Video,
            "任务".into(),
            "v.mp4".into(),
            "https://example.com/v.m4s".into(),
        ));
        registry
    }

    #[tokio::test]
    async fn test_flush_now_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_one_task();
        let store = SnapshotStore::new(
            dir.path().join("tasks.json"),
            Duration::from_millis(50),
            registry,
        );

        store.flush_now().await.unwrap();
        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.groups.len(), 1);
        assert_eq!(snapshot.groups[0].tasks.len(), 1);
        // 临时文件不残留
        assert!(!dir.path().join("tasks.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_load_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(TaskRegistry::new());
        let store = SnapshotStore::new(
            dir.path().join("tasks.json"),
            Duration::from_millis(50),
            registry,
        );

        assert!(store.load().await.is_none());

        tokio::fs::write(store.path(), b"{ not json").await.unwrap();
        assert!(store.load().await.is_none());

        tokio::fs::write(store.path(), br#"{"version": 99, "groups": []}"#)
            .await
            .unwrap();
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn test_debounce_coalesces_marks() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_one_task();
        let store = Arc::new(SnapshotStore::new(
            dir.path().join("tasks.json"),
            Duration::from_millis(100),
            registry,
        ));
        store.start();

        // 静默期内的多次标记只产生一次写盘
        store.mark_dirty();
        store.mark_dirty();
        store.mark_dirty();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(store.load().await.is_some());
        assert!(!store.dirty.load(Ordering::Acquire));

        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_changes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_one_task();
        let store = Arc::new(SnapshotStore::new(
            dir.path().join("tasks.json"),
            Duration::from_secs(3600),
            registry,
        ));
        store.start();
        store.mark_dirty();

        // 静默期远未到，但关停要把挂着的变更写完
        store.shutdown().await;
        assert!(store.load().await.is_some());
    }
}
