//! 下载编排器
//!
//! 每个活动任务持有一个可取消的作业槽位（合流任务最多三个：视频分支、
//! 音频分支、合流阶段），实现任务/分组状态机与暂停/恢复/重试/取消语义。
//! 编排器方法从不阻塞调用方：作业体全部异步执行，经任务注册表回报。
//!
//! 同一任务 ID 任一时刻至多一个作业：启动任务会先取消并废弃该 ID
//! 已有的作业句柄。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collab::{MetadataTagger, StorageSink, TagMeta};
use crate::config::EngineConfig;
use crate::error::TaskError;
use crate::merge;
use crate::naming;
use crate::persist::{reconcile, Snapshot, SnapshotStore};
use crate::registry::{EngineEvent, TaskRegistry};
use crate::task::{
    classify_id, DownloadTask, MergePart, MergeState, TaskGroup, TaskIdAllocator, TaskIdClass,
    TaskKind, TaskStatus, TransferState,
};
use crate::transfer::{TransferEngine, TransferOutcome};

/// 新任务的分组归属描述。相同外部引用（其次标题）的任务落进同一分组
#[derive(Debug, Clone, Default)]
pub struct GroupSpec {
    /// 标题
    pub title: String,
    /// 副标题
    pub subtitle: String,
    /// 外部引用 ID（稿件号等）
    pub external_ref: Option<String>,
    /// 封面引用
    pub cover: Option<String>,
}

impl GroupSpec {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }
}

/// 启动恢复的结果摘要
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoverySummary {
    /// 恢复的分组数
    pub groups: usize,
    /// 自动续传的任务数
    pub auto_resumed: usize,
    /// 自动重新合流的任务数
    pub auto_merged: usize,
}

/// 作业槽位键：单流/附属任务一个，合流任务按分支与阶段区分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum JobKey {
    Task(i64),
    MergeVideo(i64),
    MergeAudio(i64),
    MergePhase(i64),
}

impl JobKey {
    fn all_for(task_id: i64) -> [JobKey; 4] {
        [
            JobKey::Task(task_id),
            JobKey::MergeVideo(task_id),
            JobKey::MergeAudio(task_id),
            JobKey::MergePhase(task_id),
        ]
    }
}

struct JobSlot {
    token: CancellationToken,
    gen: u64,
    handle: Option<tokio::task::JoinHandle<()>>,
}

/// 作业槽位表。gen 让收尾的旧作业不会误删新作业的槽位
struct JobTable {
    slots: parking_lot::Mutex<HashMap<JobKey, JobSlot>>,
    next_gen: AtomicU64,
}

impl JobTable {
    fn new() -> Self {
        Self {
            slots: parking_lot::Mutex::new(HashMap::new()),
            next_gen: AtomicU64::new(1),
        }
    }

    /// 取消一个槽位并等待旧作业真正退出。
    /// 等待保证同一临时文件任一时刻至多一个写者
    async fn cancel_and_wait(&self, key: JobKey) {
        let slot = self.slots.lock().remove(&key);
        if let Some(slot) = slot {
            slot.token.cancel();
            if let Some(handle) = slot.handle {
                handle.await.ok();
            }
        }
    }

    /// 武装一个槽位：已有作业先取消并等它退出，再替换
    async fn arm(&self, key: JobKey) -> (CancellationToken, u64) {
        self.cancel_and_wait(key).await;
        let token = CancellationToken::new();
        let gen = self.next_gen.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().insert(
            key,
            JobSlot {
                token: token.clone(),
                gen,
                handle: None,
            },
        );
        (token, gen)
    }

    /// spawn 之后补挂作业句柄。槽位已被替换时直接丢弃（令牌已取消）
    fn attach(&self, key: JobKey, gen: u64, handle: tokio::task::JoinHandle<()>) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&key) {
            if slot.gen == gen {
                slot.handle = Some(handle);
            }
        }
    }

    /// 只取消不等待。用于兄弟分支互相叫停：两个分支同时失败时
    /// 互相等待会死锁，而它们写的本就是不同的临时文件
    fn cancel(&self, key: JobKey) {
        if let Some(slot) = self.slots.lock().remove(&key) {
            slot.token.cancel();
        }
    }

    /// 作业收尾释放自己的槽位；槽位已被新作业占用时不动
    fn release(&self, key: JobKey, gen: u64) {
        let mut slots = self.slots.lock();
        if slots.get(&key).map(|s| s.gen) == Some(gen) {
            slots.remove(&key);
        }
    }

    /// 取消一个任务名下的全部作业并等待它们退出。
    /// 合流阶段的键放在最后：分支作业的收尾可能又武装了合流阶段
    async fn cancel_task(&self, task_id: i64) {
        for key in JobKey::all_for(task_id) {
            self.cancel_and_wait(key).await;
        }
    }

    async fn cancel_all(&self) {
        let drained: Vec<JobSlot> = {
            let mut slots = self.slots.lock();
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in drained {
            slot.token.cancel();
            if let Some(handle) = slot.handle {
                handle.await.ok();
            }
        }
    }
}

/// 合流任务的流分支
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamPart {
    Video,
    Audio,
}

impl StreamPart {
    fn key(&self, task_id: i64) -> JobKey {
        match self {
            StreamPart::Video => JobKey::MergeVideo(task_id),
            StreamPart::Audio => JobKey::MergeAudio(task_id),
        }
    }

    fn sibling(&self) -> StreamPart {
        match self {
            StreamPart::Video => StreamPart::Audio,
            StreamPart::Audio => StreamPart::Video,
        }
    }

    fn part_mut<'a>(&self, state: &'a mut MergeState) -> &'a mut MergePart {
        match self {
            StreamPart::Video => &mut state.video,
            StreamPart::Audio => &mut state.audio,
        }
    }

    fn part<'a>(&self, state: &'a MergeState) -> &'a MergePart {
        match self {
            StreamPart::Video => &state.video,
            StreamPart::Audio => &state.audio,
        }
    }
}

fn single_temp_name(task_id: i64) -> String {
    format!("task_{}.part", task_id)
}

fn merge_part_temp_name(task_id: i64, part: StreamPart) -> String {
    match part {
        StreamPart::Video => format!("task_{}.video.part", task_id),
        StreamPart::Audio => format!("task_{}.audio.part", task_id),
    }
}

fn merge_output_temp_name(task_id: i64) -> String {
    format!("task_{}.merged.mp4", task_id)
}

fn extra_temp_name(task_id: i64) -> String {
    format!("task_{}.extra", task_id)
}

/// 下载编排器
pub struct DownloadManager {
    registry: Arc<TaskRegistry>,
    ids: Arc<TaskIdAllocator>,
    engine: Arc<TransferEngine>,
    store: Arc<SnapshotStore>,
    sink: Arc<dyn StorageSink>,
    tagger: Option<Arc<dyn MetadataTagger>>,
    jobs: Arc<JobTable>,
    /// 引擎独占的临时目录，文件名都内嵌任务 ID
    temp_dir: PathBuf,
    /// 自引用：作业体需要把编排器带进 spawn 的闭包
    me: std::sync::Weak<Self>,
}

impl DownloadManager {
    pub fn new(
        config: &EngineConfig,
        temp_dir: PathBuf,
        data_dir: PathBuf,
        sink: Arc<dyn StorageSink>,
        tagger: Option<Arc<dyn MetadataTagger>>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&temp_dir).context("创建临时目录失败")?;
        std::fs::create_dir_all(&data_dir).context("创建数据目录失败")?;

        let registry = Arc::new(TaskRegistry::new());
        let engine = Arc::new(TransferEngine::new(config.download.clone())?);
        let store = Arc::new(SnapshotStore::new(
            data_dir.join(&config.persistence.snapshot_file),
            Duration::from_millis(config.persistence.flush_quiet_ms),
            registry.clone(),
        ));

        Ok(Arc::new_cyclic(|me| Self {
            registry,
            ids: Arc::new(TaskIdAllocator::new()),
            engine,
            store,
            sink,
            tagger,
            jobs: Arc::new(JobTable::new()),
            temp_dir,
            me: me.clone(),
        }))
    }

    /// 启动：加载上次快照、运行恢复对账、启动持久化作业，
    /// 然后按对账结果自动续传/自动合流。必须在任何 enqueue 之前调用一次
    pub async fn start(&self) -> Result<RecoverySummary> {
        let snapshot = self.store.load().await.unwrap_or_else(Snapshot::empty);
        let outcome = reconcile(snapshot, &self.temp_dir, self.sink.as_ref()).await;

        let summary = RecoverySummary {
            groups: outcome.groups.len(),
            auto_resumed: outcome.auto_resume.len(),
            auto_merged: outcome.auto_merge.len(),
        };

        self.registry.restore(
            outcome.groups,
            outcome.transfer_states,
            outcome.merge_states,
        );
        let (max_single, min_merge, min_extra, max_group) = self.registry.id_bounds();
        self.ids.seed(max_single, min_merge, min_extra, max_group);

        self.store.start();
        // 对账结果本身也要落盘
        self.store.mark_dirty();

        for task_id in outcome.auto_resume {
            match classify_id(task_id) {
                TaskIdClass::Single => self.spawn_transfer(task_id).await,
                TaskIdClass::Merge => self.spawn_merge_parts(task_id).await,
                TaskIdClass::Extra => {}
            }
        }
        for task_id in outcome.auto_merge {
            if self.registry.try_arm_merge(task_id) {
                self.spawn_merge_phase(task_id).await;
            }
        }

        info!(
            "编排器已启动: {} 个分组, 自动续传 {}, 自动合流 {}",
            summary.groups, summary.auto_resumed, summary.auto_merged
        );
        Ok(summary)
    }

    /// 优雅关停：取消所有作业并完成最后一次快照写入
    pub async fn shutdown(&self) {
        self.jobs.cancel_all().await;
        self.store.shutdown().await;
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// 订阅变更事件
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.registry.subscribe()
    }

    /// 当前全部分组（展示顺序）
    pub fn groups(&self) -> Vec<TaskGroup> {
        self.registry.groups()
    }

    /// 分组进度：字节加权平均，合流中封顶 99%
    pub fn group_progress(&self, group_id: i64) -> Option<f64> {
        self.registry.group(group_id).map(|g| g.progress())
    }

    // ==================== 入列 ====================

    /// 入列一个单流下载任务并立即开始传输
    pub async fn enqueue(
        &self,
        group: GroupSpec,
        kind: TaskKind,
        title: impl Into<String>,
        file_name: impl Into<String>,
        url: impl Into<String>,
    ) -> Result<DownloadTask> {
        anyhow::ensure!(
            matches!(kind, TaskKind::Video | TaskKind::Audio),
            "单流任务只接受视频或音频类型"
        );
        let url = url.into();
        let group_id = self.ensure_group(&group);
        let task_id = self.ids.next_single();
        let task = DownloadTask::new(
            task_id,
            group_id,
            kind,
            title.into(),
            naming::sanitize_file_name(&file_name.into()),
            url.clone(),
        );
        self.registry.insert_task(task.clone());
        self.registry.set_transfer_state(TransferState::new(
            task_id,
            url,
            single_temp_name(task_id),
        ));
        self.store.mark_dirty();
        self.spawn_transfer(task_id).await;
        Ok(self.registry.get_task(task_id).unwrap_or(task))
    }

    /// 入列一个音视频合流任务：两路分支下载完成后自动合流恰好一次
    pub async fn enqueue_merge(
        &self,
        group: GroupSpec,
        title: impl Into<String>,
        output_name: impl Into<String>,
        video_url: impl Into<String>,
        audio_url: impl Into<String>,
    ) -> Result<DownloadTask> {
        let video_url = video_url.into();
        let audio_url = audio_url.into();
        let group_id = self.ensure_group(&group);
        let task_id = self.ids.next_merge();
        let output_name = naming::sanitize_file_name(&output_name.into());

        let task = DownloadTask::new(
            task_id,
            group_id,
            TaskKind::Merged,
            title.into(),
            output_name.clone(),
            video_url.clone(),
        );
        let state = MergeState::new(
            task_id,
            output_name,
            MergePart::new(
                video_url,
                merge_part_temp_name(task_id, StreamPart::Video),
            ),
            MergePart::new(
                audio_url,
                merge_part_temp_name(task_id, StreamPart::Audio),
            ),
        );
        self.registry.insert_task(task.clone());
        self.registry.set_merge_state(state);
        self.store.mark_dirty();
        self.spawn_merge_parts(task_id).await;
        Ok(self.registry.get_task(task_id).unwrap_or(task))
    }

    /// 入列一个附属任务（字幕、封面等）：内容由调用方提供，直接写入成品位置
    pub async fn enqueue_extra(
        &self,
        group: GroupSpec,
        kind: TaskKind,
        title: impl Into<String>,
        file_name: impl Into<String>,
        content: Vec<u8>,
    ) -> Result<DownloadTask> {
        anyhow::ensure!(!kind.is_managed(), "受管类型请使用 enqueue / enqueue_merge");
        let group_id = self.ensure_group(&group);
        let task_id = self.ids.next_extra();
        let mut task = DownloadTask::new(
            task_id,
            group_id,
            kind,
            title.into(),
            naming::sanitize_file_name(&file_name.into()),
            String::new(),
        );
        task.total = content.len() as u64;
        self.registry.insert_task(task.clone());
        self.store.mark_dirty();

        let (token, gen) = self.jobs.arm(JobKey::Task(task_id)).await;
        if let Some(manager) = self.me.upgrade() {
            let handle = tokio::spawn(async move {
                manager.run_extra_job(task_id, content, token, gen).await;
            });
            self.jobs.attach(JobKey::Task(task_id), gen, handle);
        }
        Ok(self.registry.get_task(task_id).unwrap_or(task))
    }

    fn ensure_group(&self, spec: &GroupSpec) -> i64 {
        if let Some(group_id) = self
            .registry
            .find_group_id(spec.external_ref.as_deref(), &spec.title)
        {
            return group_id;
        }
        let folder_name = naming::resolve_folder_name(
            &spec.title,
            spec.external_ref.as_deref(),
            &self.registry.folder_names(),
        );
        let group_id = self.ids.next_group();
        self.registry.insert_group(TaskGroup::new(
            group_id,
            spec.title.clone(),
            spec.subtitle.clone(),
            spec.external_ref.clone(),
            spec.cover.clone(),
            folder_name,
        ));
        group_id
    }

    // ==================== 任务操作 ====================

    /// 暂停任务：取消作业但保留临时文件，标记为用户暂停
    pub async fn pause(&self, task_id: i64) -> Result<()> {
        let task = self.registry.get_task(task_id).context("任务不存在")?;
        anyhow::ensure!(task.kind.is_managed(), "该类型任务不支持暂停");
        anyhow::ensure!(!task.status.is_terminal(), "任务已结束");

        self.jobs.cancel_task(task_id).await;
        self.registry.update_task(task_id, |t| t.mark_paused());
        if classify_id(task_id) == TaskIdClass::Merge {
            self.registry.update_merge_state(task_id, |m| {
                m.video.running = false;
                m.audio.running = false;
                m.merging = false;
            });
        }
        self.store.mark_dirty();
        info!("任务 {} 已暂停", task_id);
        Ok(())
    }

    /// 恢复任务：只对用户暂停的任务有效，从临时文件当前长度续传
    pub async fn resume(&self, task_id: i64) -> Result<()> {
        let task = self.registry.get_task(task_id).context("任务不存在")?;
        anyhow::ensure!(
            task.status == TaskStatus::Paused && task.user_paused,
            "只有用户暂停的任务可以继续"
        );

        self.registry.update_task(task_id, |t| {
            t.status = TaskStatus::Pending;
            t.user_paused = false;
        });
        match classify_id(task_id) {
            TaskIdClass::Single => self.spawn_transfer(task_id).await,
            TaskIdClass::Merge => self.resume_merge(task_id).await?,
            TaskIdClass::Extra => anyhow::bail!("附属任务不支持继续"),
        }
        self.store.mark_dirty();
        info!("任务 {} 已继续", task_id);
        Ok(())
    }

    /// 重试失败任务。单流任务以磁盘半成品长度为准重建续传状态；
    /// 合流任务按分支完成度决定重下分支、重跑合流还是重新提交
    pub async fn retry(&self, task_id: i64) -> Result<()> {
        let task = self.registry.get_task(task_id).context("任务不存在")?;
        anyhow::ensure!(task.status == TaskStatus::Failed, "只有失败任务可以重试");

        match classify_id(task_id) {
            TaskIdClass::Single => {
                let mut state = self
                    .registry
                    .get_transfer_state(task_id)
                    .unwrap_or_else(|| {
                        TransferState::new(task_id, task.url.clone(), single_temp_name(task_id))
                    });
                let temp_path = self.temp_dir.join(&state.file_name);
                state.downloaded = tokio::fs::metadata(&temp_path)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
                self.registry.set_transfer_state(state);
                self.spawn_transfer(task_id).await;
            }
            TaskIdClass::Merge => {
                let state = self
                    .registry
                    .update_merge_state(task_id, |m| {
                        m.video.failed = false;
                        m.audio.failed = false;
                        m.merge_failed = false;
                        m.merging = false;
                    })
                    .context("合流状态缺失")?;
                if state.merge_completed {
                    // 复用已完成但提交失败过：只需重新提交成品
                    self.spawn_merge_phase(task_id).await;
                } else if state.both_completed() {
                    if self.registry.try_arm_merge(task_id) {
                        self.spawn_merge_phase(task_id).await;
                    }
                } else {
                    self.spawn_merge_parts(task_id).await;
                }
            }
            TaskIdClass::Extra => anyhow::bail!("附属任务的内容已丢失，请重新入列"),
        }
        self.store.mark_dirty();
        info!("任务 {} 开始重试", task_id);
        Ok(())
    }

    /// 取消任务：终止作业、删除临时文件，不可逆
    pub async fn cancel(&self, task_id: i64) -> Result<()> {
        let task = self.registry.get_task(task_id).context("任务不存在")?;
        anyhow::ensure!(!task.status.is_terminal(), "任务已结束");

        self.jobs.cancel_task(task_id).await;
        self.remove_temp_files(task_id).await;
        self.registry.remove_transfer_state(task_id);
        self.registry.remove_merge_state(task_id);
        self.registry.update_task(task_id, |t| t.mark_cancelled());
        // 终态强制落盘
        if let Err(err) = self.store.flush_now().await {
            error!("取消任务 {} 后写快照失败: {}", task_id, err);
        }
        info!("任务 {} 已取消", task_id);
        Ok(())
    }

    /// 删除任务：停止作业、删除临时文件，可选删除已提交的成品。
    /// 分组的最后一个任务被删除时分组一并移除
    pub async fn delete_task(&self, task_id: i64, delete_committed: bool) -> Result<()> {
        self.jobs.cancel_task(task_id).await;
        let Some(task) = self.registry.get_task(task_id) else {
            // 任务不存在：删除是幂等的清理路径
            return Ok(());
        };
        self.remove_temp_files(task_id).await;
        if delete_committed {
            if let Some(handle) = &task.committed {
                if let Err(err) = self.sink.delete(handle).await {
                    warn!("删除任务 {} 的成品失败: {}", task_id, err);
                }
            }
        }
        self.registry.remove_task(task_id);
        if let Err(err) = self.store.flush_now().await {
            error!("删除任务 {} 后写快照失败: {}", task_id, err);
        }
        info!("任务 {} 已删除", task_id);
        Ok(())
    }

    /// 删除整个分组。对已空或不存在的分组也成功（幂等清理路径）
    pub async fn delete_group(&self, group_id: i64, delete_committed: bool) -> Result<()> {
        let task_ids = self.registry.task_ids_of_group(group_id);
        for task_id in task_ids {
            self.delete_task(task_id, delete_committed).await?;
        }
        // 组内任务删完时分组已自动消失；显式移除兜底
        self.registry.remove_group(group_id);
        Ok(())
    }

    /// 暂停分组内所有可暂停的任务，返回实际暂停的数量
    pub async fn pause_group(&self, group_id: i64) -> usize {
        let mut affected = 0;
        for task_id in self.registry.task_ids_of_group(group_id) {
            if self.pause(task_id).await.is_ok() {
                affected += 1;
            }
        }
        affected
    }

    /// 恢复分组内所有用户暂停的任务，返回实际恢复的数量
    pub async fn resume_group(&self, group_id: i64) -> usize {
        let mut affected = 0;
        for task_id in self.registry.task_ids_of_group(group_id) {
            if self.resume(task_id).await.is_ok() {
                affected += 1;
            }
        }
        affected
    }

    /// 清除所有任务全部成功的分组，返回清除的分组数
    pub async fn clear_completed_groups(&self) -> usize {
        let mut removed = 0;
        for group in self.registry.groups() {
            if group.is_all_success() {
                self.registry.remove_group(group.id);
                removed += 1;
            }
        }
        if removed > 0 {
            if let Err(err) = self.store.flush_now().await {
                error!("清除已完成分组后写快照失败: {}", err);
            }
        }
        removed
    }

    /// 硬重置：取消一切作业、删除全部临时文件、清空注册表
    pub async fn clear_all(&self) {
        self.jobs.cancel_all().await;
        let snapshot = self.registry.snapshot();
        for state in &snapshot.transfer_states {
            tokio::fs::remove_file(self.temp_dir.join(&state.file_name))
                .await
                .ok();
        }
        for state in &snapshot.merge_states {
            tokio::fs::remove_file(self.temp_dir.join(&state.video.file_name))
                .await
                .ok();
            tokio::fs::remove_file(self.temp_dir.join(&state.audio.file_name))
                .await
                .ok();
            tokio::fs::remove_file(self.temp_dir.join(merge_output_temp_name(state.task_id)))
                .await
                .ok();
        }
        self.registry.clear();
        if let Err(err) = self.store.flush_now().await {
            error!("清空后写快照失败: {}", err);
        }
        info!("已清空全部任务");
    }

    /// 重新检查成品可用性：用户可能在外部删除了文件。
    /// 返回成品当前是否存在
    pub async fn refresh_availability(&self, task_id: i64) -> Result<bool> {
        let task = self.registry.get_task(task_id).context("任务不存在")?;
        let Some(handle) = task.committed else {
            return Ok(false);
        };
        let exists = self.sink.exists(&handle).await;
        self.registry
            .update_task(task_id, |t| t.output_missing = !exists);
        Ok(exists)
    }

    // ==================== 单流作业 ====================

    async fn spawn_transfer(&self, task_id: i64) {
        let Some(state) = self.registry.get_transfer_state(task_id) else {
            warn!("任务 {} 缺少续传状态，无法启动", task_id);
            return;
        };
        let (token, gen) = self.jobs.arm(JobKey::Task(task_id)).await;
        self.registry.update_task(task_id, |t| t.mark_running());
        self.store.mark_dirty();

        if let Some(manager) = self.me.upgrade() {
            let handle = tokio::spawn(async move {
                manager.run_transfer_job(task_id, state, token, gen).await;
            });
            self.jobs.attach(JobKey::Task(task_id), gen, handle);
        }
    }

    async fn run_transfer_job(
        self: Arc<Self>,
        task_id: i64,
        mut state: TransferState,
        token: CancellationToken,
        gen: u64,
    ) {
        let temp_path = self.temp_dir.join(&state.file_name);
        let registry = self.registry.clone();
        let store = self.store.clone();
        let result = self
            .engine
            .download(&temp_path, &mut state, &token, |p| {
                registry.update_progress(task_id, p.downloaded, p.total, p.speed, p.eta_secs);
                store.mark_dirty();
            })
            .await;

        // 任务可能在传输途中被删除；状态只更新不复活
        self.registry
            .update_transfer_state(task_id, |s| *s = state.clone());

        match result {
            Ok(TransferOutcome::Completed) => {
                self.jobs.release(JobKey::Task(task_id), gen);
                self.finish_single(task_id, &temp_path).await;
            }
            Ok(TransferOutcome::Cancelled) => {
                // 状态与文件的处置由发起方（暂停/取消/删除）负责
                self.store.mark_dirty();
            }
            Err(err) => {
                self.jobs.release(JobKey::Task(task_id), gen);
                warn!("任务 {} 传输失败: {}", task_id, err);
                self.registry.update_task(task_id, |t| {
                    t.mark_failed(TaskError::Network(err.to_string()).to_string())
                });
                self.store.mark_dirty();
            }
        }
    }

    /// 单流传输完成后的收尾：嵌入元数据（可失败）、提交成品、清理
    async fn finish_single(&self, task_id: i64, temp_path: &Path) {
        let Some(task) = self.registry.get_task(task_id) else {
            return;
        };
        let Some(group) = self.registry.group(task.group_id) else {
            return;
        };

        if let Some(tagger) = &self.tagger {
            let meta = TagMeta {
                title: task.title.clone(),
                group_title: group.title.clone(),
                cover: group.cover.clone(),
            };
            if let Err(err) = tagger.tag(temp_path, &meta).await {
                warn!("任务 {} 嵌入元数据失败（忽略）: {}", task_id, err);
            }
        }

        match self
            .sink
            .commit(temp_path, &task.file_name, &group.folder_name)
            .await
        {
            Ok(handle) => {
                self.registry
                    .update_task(task_id, |t| t.mark_success(Some(handle)));
                self.registry.remove_transfer_state(task_id);
                tokio::fs::remove_file(temp_path).await.ok();
                if let Err(err) = self.store.flush_now().await {
                    error!("任务 {} 完成后写快照失败: {}", task_id, err);
                }
                info!("任务 {} 完成并已提交", task_id);
            }
            Err(err) => {
                // 提交结果不明：临时文件保留，重试可直接重新提交
                warn!("任务 {} 提交成品失败: {}", task_id, err);
                self.registry.update_task(task_id, |t| {
                    t.mark_failed(TaskError::Commit(err.to_string()).to_string())
                });
                self.store.mark_dirty();
            }
        }
    }

    // ==================== 合流作业 ====================

    async fn resume_merge(&self, task_id: i64) -> Result<()> {
        let state = self
            .registry
            .get_merge_state(task_id)
            .context("合流状态缺失")?;
        if state.merge_completed {
            self.spawn_merge_phase(task_id).await;
        } else if state.both_completed() {
            if self.registry.try_arm_merge(task_id) {
                self.spawn_merge_phase(task_id).await;
            }
        } else {
            self.spawn_merge_parts(task_id).await;
        }
        Ok(())
    }

    /// 启动合流任务中所有未完成分支的传输；分支都已完成时直接进入合流
    async fn spawn_merge_parts(&self, task_id: i64) {
        let Some(state) = self.registry.get_merge_state(task_id) else {
            warn!("任务 {} 缺少合流状态，无法启动", task_id);
            return;
        };
        let mut spawned = false;
        for part in [StreamPart::Video, StreamPart::Audio] {
            if !part.part(&state).completed {
                self.spawn_merge_part(task_id, part).await;
                spawned = true;
            }
        }
        if !spawned {
            if self.registry.try_arm_merge(task_id) {
                self.spawn_merge_phase(task_id).await;
            }
            return;
        }
        self.sync_merge_status(task_id);
        self.store.mark_dirty();
    }

    async fn spawn_merge_part(&self, task_id: i64, part: StreamPart) {
        let (token, gen) = self.jobs.arm(part.key(task_id)).await;
        self.registry.update_merge_state(task_id, |m| {
            let slot = part.part_mut(m);
            slot.running = true;
            slot.failed = false;
        });
        if let Some(manager) = self.me.upgrade() {
            let handle = tokio::spawn(async move {
                manager.run_merge_part_job(task_id, part, token, gen).await;
            });
            self.jobs.attach(part.key(task_id), gen, handle);
        }
    }

    async fn run_merge_part_job(
        self: Arc<Self>,
        task_id: i64,
        part: StreamPart,
        token: CancellationToken,
        gen: u64,
    ) {
        let Some(merge_state) = self.registry.get_merge_state(task_id) else {
            return;
        };
        let mut state = part.part(&merge_state).to_transfer_state(task_id);
        let temp_path = self.temp_dir.join(&state.file_name);

        let registry = self.registry.clone();
        let store = self.store.clone();
        let result = self
            .engine
            .download(&temp_path, &mut state, &token, |p| {
                let merged = registry.update_merge_state(task_id, |m| {
                    let slot = part.part_mut(m);
                    slot.downloaded = p.downloaded;
                    if p.total > 0 {
                        slot.total = p.total;
                    }
                    slot.speed = p.speed;
                });
                if let Some(m) = merged {
                    let downloaded = m.video.downloaded + m.audio.downloaded;
                    let total = if m.video.total > 0 && m.audio.total > 0 {
                        m.video.total + m.audio.total
                    } else {
                        0
                    };
                    let speed = m.video.speed + m.audio.speed;
                    let eta = if speed > 0 && total > downloaded {
                        Some((total - downloaded) / speed)
                    } else {
                        None
                    };
                    registry.update_progress(task_id, downloaded, total, speed, eta);
                }
                store.mark_dirty();
            })
            .await;

        self.registry.update_merge_state(task_id, |m| {
            part.part_mut(m).absorb(&state);
        });

        match result {
            Ok(TransferOutcome::Completed) => {
                self.jobs.release(part.key(task_id), gen);
                self.registry.update_merge_state(task_id, |m| {
                    let slot = part.part_mut(m);
                    slot.completed = true;
                    slot.running = false;
                    slot.speed = 0;
                });
                self.sync_merge_status(task_id);
                self.store.mark_dirty();
                // 双分支齐活时启动合流，触发器保证恰好一次
                if self.registry.try_arm_merge(task_id) {
                    self.spawn_merge_phase(task_id).await;
                }
            }
            Ok(TransferOutcome::Cancelled) => {
                self.registry.update_merge_state(task_id, |m| {
                    part.part_mut(m).running = false;
                });
                self.store.mark_dirty();
            }
            Err(err) => {
                self.jobs.release(part.key(task_id), gen);
                warn!("任务 {} 的{}分支传输失败: {}", task_id, part_name(part), err);
                self.registry.update_merge_state(task_id, |m| {
                    let slot = part.part_mut(m);
                    slot.failed = true;
                    slot.running = false;
                });
                // 凑不齐配对，另一个分支继续传也没有意义
                self.jobs.cancel(part.sibling().key(task_id));
                self.registry.update_merge_state(task_id, |m| {
                    part.sibling().part_mut(m).running = false;
                });
                self.registry.update_task(task_id, |t| {
                    t.mark_failed(TaskError::Network(err.to_string()).to_string())
                });
                self.store.mark_dirty();
            }
        }
    }

    /// 按分支状态同步合流任务的可见状态
    fn sync_merge_status(&self, task_id: i64) {
        let Some(state) = self.registry.get_merge_state(task_id) else {
            return;
        };
        let Some(task) = self.registry.get_task(task_id) else {
            return;
        };
        let derived = state.derive_status(task.user_paused);
        if derived != task.status {
            self.registry.update_task(task_id, |t| t.status = derived);
        }
    }

    async fn spawn_merge_phase(&self, task_id: i64) {
        let (token, gen) = self.jobs.arm(JobKey::MergePhase(task_id)).await;
        self.registry.update_task(task_id, |t| {
            t.status = TaskStatus::Merging;
            t.error = None;
        });
        self.store.mark_dirty();

        if let Some(manager) = self.me.upgrade() {
            let handle = tokio::spawn(async move {
                manager.run_merge_phase_job(task_id, token, gen).await;
            });
            self.jobs.attach(JobKey::MergePhase(task_id), gen, handle);
        }
    }

    async fn run_merge_phase_job(self: Arc<Self>, task_id: i64, token: CancellationToken, gen: u64) {
        let Some(state) = self.registry.get_merge_state(task_id) else {
            return;
        };
        // 合流开始前的取消直接退场
        if token.is_cancelled() {
            self.registry.update_merge_state(task_id, |m| m.merging = false);
            return;
        }
        let video_path = self.temp_dir.join(&state.video.file_name);
        let audio_path = self.temp_dir.join(&state.audio.file_name);
        let out_path = self.temp_dir.join(merge_output_temp_name(task_id));

        let already_merged = state.merge_completed
            && tokio::fs::try_exists(&out_path).await.unwrap_or(false);

        if !already_merged {
            // 复用是整段阻塞操作，没有中途的挂起点；
            // 取消只能在它结束之后生效，这样输出文件不会出现第二个写者
            let merge_result =
                merge::merge_streams(video_path.clone(), audio_path.clone(), out_path.clone())
                    .await;

            if token.is_cancelled() {
                if self.registry.get_merge_state(task_id).is_none() {
                    // 任务已被取消/删除：合流产物一并清掉
                    tokio::fs::remove_file(&out_path).await.ok();
                    return;
                }
                // 用户暂停：复用已经做完就把结果记下来，恢复后只需提交
                if merge_result.is_ok() {
                    self.registry.update_merge_state(task_id, |m| {
                        m.merging = false;
                        m.merge_completed = true;
                        m.merge_failed = false;
                    });
                    tokio::fs::remove_file(&video_path).await.ok();
                    tokio::fs::remove_file(&audio_path).await.ok();
                } else {
                    self.registry.update_merge_state(task_id, |m| m.merging = false);
                }
                self.store.mark_dirty();
                return;
            }

            match merge_result {
                Ok(report) => {
                    debug!(
                        "任务 {} 合流完成: 视频 {} 样本, 音频 {} 样本",
                        task_id, report.video_samples, report.audio_samples
                    );
                    self.registry.update_merge_state(task_id, |m| {
                        m.merging = false;
                        m.merge_completed = true;
                        m.merge_failed = false;
                    });
                    // 复用成功即不可逆：源临时文件删除，此后重试不再重新下载
                    tokio::fs::remove_file(&video_path).await.ok();
                    tokio::fs::remove_file(&audio_path).await.ok();
                    self.store.mark_dirty();
                }
                Err(err) => {
                    self.jobs.release(JobKey::MergePhase(task_id), gen);
                    warn!("任务 {} 合流失败: {}", task_id, err);
                    self.registry.update_merge_state(task_id, |m| {
                        m.merging = false;
                        m.merge_failed = true;
                    });
                    self.registry.update_task(task_id, |t| {
                        t.mark_failed(TaskError::Merge(err.to_string()).to_string())
                    });
                    self.store.mark_dirty();
                    return;
                }
            }
        }

        self.jobs.release(JobKey::MergePhase(task_id), gen);
        self.commit_merge_output(task_id, &out_path).await;
    }

    /// 提交合流成品。失败时输出保留，重试只会重新提交
    async fn commit_merge_output(&self, task_id: i64, out_path: &Path) {
        let Some(task) = self.registry.get_task(task_id) else {
            return;
        };
        let Some(group) = self.registry.group(task.group_id) else {
            return;
        };

        if let Some(tagger) = &self.tagger {
            let meta = TagMeta {
                title: task.title.clone(),
                group_title: group.title.clone(),
                cover: group.cover.clone(),
            };
            if let Err(err) = tagger.tag(out_path, &meta).await {
                warn!("任务 {} 嵌入元数据失败（忽略）: {}", task_id, err);
            }
        }

        match self
            .sink
            .commit(out_path, &task.file_name, &group.folder_name)
            .await
        {
            Ok(handle) => {
                self.registry
                    .update_task(task_id, |t| t.mark_success(Some(handle)));
                self.registry.remove_merge_state(task_id);
                tokio::fs::remove_file(out_path).await.ok();
                if let Err(err) = self.store.flush_now().await {
                    error!("任务 {} 完成后写快照失败: {}", task_id, err);
                }
                info!("合流任务 {} 完成并已提交", task_id);
            }
            Err(err) => {
                warn!("任务 {} 提交合流成品失败: {}", task_id, err);
                self.registry.update_task(task_id, |t| {
                    t.mark_failed(TaskError::Commit(err.to_string()).to_string())
                });
                self.store.mark_dirty();
            }
        }
    }

    // ==================== 附属作业 ====================

    async fn run_extra_job(
        self: Arc<Self>,
        task_id: i64,
        content: Vec<u8>,
        token: CancellationToken,
        gen: u64,
    ) {
        self.registry.update_task(task_id, |t| t.mark_running());
        let temp_path = self.temp_dir.join(extra_temp_name(task_id));

        let result: Result<String> = async {
            tokio::fs::write(&temp_path, &content).await?;
            anyhow::ensure!(!token.is_cancelled(), "任务已取消");
            let task = self.registry.get_task(task_id).context("任务不存在")?;
            let group = self.registry.group(task.group_id).context("分组不存在")?;
            self.sink
                .commit(&temp_path, &task.file_name, &group.folder_name)
                .await
        }
        .await;

        self.jobs.release(JobKey::Task(task_id), gen);
        match result {
            Ok(handle) => {
                self.registry
                    .update_task(task_id, |t| t.mark_success(Some(handle)));
                if let Err(err) = self.store.flush_now().await {
                    error!("任务 {} 完成后写快照失败: {}", task_id, err);
                }
            }
            Err(err) => {
                tokio::fs::remove_file(&temp_path).await.ok();
                self.registry.update_task(task_id, |t| {
                    t.mark_failed(TaskError::Commit(err.to_string()).to_string())
                });
                self.store.mark_dirty();
            }
        }
    }

    // ==================== 清理 ====================

    /// 删除一个任务名下的全部临时文件
    async fn remove_temp_files(&self, task_id: i64) {
        if let Some(state) = self.registry.get_transfer_state(task_id) {
            tokio::fs::remove_file(self.temp_dir.join(&state.file_name))
                .await
                .ok();
        }
        if let Some(state) = self.registry.get_merge_state(task_id) {
            tokio::fs::remove_file(self.temp_dir.join(&state.video.file_name))
                .await
                .ok();
            tokio::fs::remove_file(self.temp_dir.join(&state.audio.file_name))
                .await
                .ok();
        }
        tokio::fs::remove_file(self.temp_dir.join(merge_output_temp_name(task_id)))
            .await
            .ok();
        tokio::fs::remove_file(self.temp_dir.join(extra_temp_name(task_id)))
            .await
            .ok();
    }
}

fn part_name(part: StreamPart) -> &'static str {
    match part {
        StreamPart::Video => "视频",
        StreamPart::Audio => "音频",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::LocalStorageSink;
    use crate::persist::SNAPSHOT_VERSION;
    use crate::task::{EXTRA_ID_START, MERGE_ID_START};
    use crate::testutil::{body_bytes, write_audio_source, write_video_source, TestServer};
    use std::io::BufReader;
    use tempfile::TempDir;

    struct TestEnv {
        dir: TempDir,
        manager: Arc<DownloadManager>,
    }

    impl TestEnv {
        fn library(&self) -> PathBuf {
            self.dir.path().join("library")
        }

        fn temp_dir(&self) -> PathBuf {
            self.dir.path().join("temp")
        }

        fn data_dir(&self) -> PathBuf {
            self.dir.path().join("data")
        }
    }

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.download.progress_interval_ms = 0;
        config.persistence.flush_quiet_ms = 50;
        config
    }

    async fn build_env() -> TestEnv {
        let dir = TempDir::new().unwrap();
        build_env_in(dir).await
    }

    /// 在既有目录上构建并启动编排器（用于恢复测试的“重启”）
    async fn build_env_in(dir: TempDir) -> TestEnv {
        let library = dir.path().join("library");
        let manager = DownloadManager::new(
            &test_config(),
            dir.path().join("temp"),
            dir.path().join("data"),
            Arc::new(LocalStorageSink::new(library)),
            None,
        )
        .unwrap();
        manager.start().await.unwrap();
        TestEnv { dir, manager }
    }

    fn spec() -> GroupSpec {
        GroupSpec {
            title: "我的视频".to_string(),
            subtitle: String::new(),
            external_ref: Some("BV1xx".to_string()),
            cover: None,
        }
    }

    async fn wait_status(env: &TestEnv, task_id: i64, wanted: TaskStatus) -> DownloadTask {
        for _ in 0..400 {
            if let Some(task) = env.manager.registry().get_task(task_id) {
                if task.status == wanted {
                    return task;
                }
                if task.status.is_terminal() && wanted != task.status {
                    panic!(
                        "任务 {} 意外进入终态 {:?}: {:?}",
                        task_id, task.status, task.error
                    );
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("等待任务 {} 进入 {} 超时", task_id, wanted);
    }

    /// 轮询直到任务有下载进度
    async fn wait_some_progress(env: &TestEnv, task_id: i64) {
        for _ in 0..200 {
            if let Some(task) = env.manager.registry().get_task(task_id) {
                if task.downloaded > 0 {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("等待任务 {} 产生进度超时", task_id);
    }

    #[tokio::test]
    async fn test_enqueue_single_to_success() {
        let server = TestServer::start().await;
        let env = build_env().await;

        let task = env
            .manager
            .enqueue(spec(), TaskKind::Video, "标题", "video.mp4", server.url("/ok"))
            .await
            .unwrap();
        assert_eq!(task.id, 1);

        let done = wait_status(&env, task.id, TaskStatus::Success).await;
        assert!(done.committed.is_some());
        assert_eq!(done.progress, 100.0);
        assert!(done.error.is_none());
        // 给收尾的清理与强制落盘一点时间
        tokio::time::sleep(Duration::from_millis(150)).await;

        // 成品落在分组文件夹内，内容与参照一致
        let committed = env.library().join("我的视频-BV1xx").join("video.mp4");
        assert_eq!(tokio::fs::read(&committed).await.unwrap(), body_bytes());
        // 临时文件与续传状态都已清理
        assert!(!env.temp_dir().join("task_1.part").exists());
        assert!(env.manager.registry().get_transfer_state(task.id).is_none());
        // 终态强制落盘
        assert!(env.data_dir().join("tasks.json").exists());
        // 分组进度 100%
        assert_eq!(env.manager.group_progress(done.group_id), Some(100.0));

        env.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_resume_produces_identical_file() {
        let server = TestServer::start().await;
        let env = build_env().await;

        let task = env
            .manager
            .enqueue(spec(), TaskKind::Video, "标题", "video.mp4", server.url("/slow"))
            .await
            .unwrap();
        wait_some_progress(&env, task.id).await;

        env.manager.pause(task.id).await.unwrap();
        let paused = env.manager.registry().get_task(task.id).unwrap();
        assert_eq!(paused.status, TaskStatus::Paused);
        assert!(paused.user_paused);

        // 作业停下后半成品保留
        tokio::time::sleep(Duration::from_millis(100)).await;
        let temp = env.temp_dir().join("task_1.part");
        let partial = tokio::fs::metadata(&temp).await.unwrap().len();
        assert!(partial > 0 && partial < 1000, "partial = {}", partial);

        env.manager.resume(task.id).await.unwrap();
        wait_status(&env, task.id, TaskStatus::Success).await;

        // 暂停再恢复的结果与一次性下载逐字节一致
        let committed = env.library().join("我的视频-BV1xx").join("video.mp4");
        assert_eq!(tokio::fs::read(&committed).await.unwrap(), body_bytes());

        env.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_resume_rejects_non_user_paused() {
        let server = TestServer::start().await;
        let env = build_env().await;
        let task = env
            .manager
            .enqueue(spec(), TaskKind::Video, "标题", "video.mp4", server.url("/ok"))
            .await
            .unwrap();
        wait_status(&env, task.id, TaskStatus::Success).await;

        // 成功任务既不能暂停也不能恢复
        assert!(env.manager.pause(task.id).await.is_err());
        assert!(env.manager.resume(task.id).await.is_err());

        env.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_after_failure_resumes_from_disk() {
        let server = TestServer::start().await;
        let env = build_env().await;

        let task = env
            .manager
            .enqueue(spec(), TaskKind::Video, "标题", "video.mp4", server.url("/flaky"))
            .await
            .unwrap();
        let failed = wait_status(&env, task.id, TaskStatus::Failed).await;
        assert!(failed.error.is_some());

        // 半成品还在磁盘上
        let temp = env.temp_dir().join("task_1.part");
        assert_eq!(tokio::fs::metadata(&temp).await.unwrap().len(), 400);

        env.manager.retry(task.id).await.unwrap();
        wait_status(&env, task.id, TaskStatus::Success).await;

        let committed = env.library().join("我的视频-BV1xx").join("video.mp4");
        assert_eq!(tokio::fs::read(&committed).await.unwrap(), body_bytes());
        // 第二次请求确实是续传
        let requests = server.requests_for("/flaky");
        assert_eq!(requests[1].header("range"), Some("bytes=400-"));

        env.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_deletes_temp_and_is_final() {
        let server = TestServer::start().await;
        let env = build_env().await;

        let task = env
            .manager
            .enqueue(spec(), TaskKind::Video, "标题", "video.mp4", server.url("/slow"))
            .await
            .unwrap();
        wait_some_progress(&env, task.id).await;

        env.manager.cancel(task.id).await.unwrap();
        let cancelled = env.manager.registry().get_task(task.id).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        // 临时文件与续传状态一并清除
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!env.temp_dir().join("task_1.part").exists());
        assert!(env.manager.registry().get_transfer_state(task.id).is_none());
        // 取消不可逆
        assert!(env.manager.cancel(task.id).await.is_err());
        assert!(env.manager.resume(task.id).await.is_err());

        env.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_last_task_removes_group() {
        let server = TestServer::start().await;
        let env = build_env().await;

        let task = env
            .manager
            .enqueue(spec(), TaskKind::Video, "标题", "video.mp4", server.url("/ok"))
            .await
            .unwrap();
        let done = wait_status(&env, task.id, TaskStatus::Success).await;
        let committed = env.library().join("我的视频-BV1xx").join("video.mp4");
        assert!(committed.exists());

        env.manager.delete_task(task.id, true).await.unwrap();
        // 最后一个任务删除后分组消失，成品按要求一并删除
        assert!(env.manager.registry().group(done.group_id).is_none());
        assert!(!committed.exists());

        // 删除不存在的任务/分组是幂等的
        env.manager.delete_task(task.id, true).await.unwrap();
        env.manager.delete_group(done.group_id, false).await.unwrap();
        env.manager.delete_group(9999, false).await.unwrap();

        env.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_enqueue_merge_end_to_end() {
        let env = build_env().await;
        let media_dir = env.dir.path().join("media");
        std::fs::create_dir_all(&media_dir).unwrap();
        write_video_source(&media_dir.join("video.m4s"), 30);
        write_audio_source(&media_dir.join("audio.m4s"), 10);
        let server = TestServer::start_with_dir(Some(media_dir)).await;

        let task = env
            .manager
            .enqueue_merge(
                spec(),
                "第1话",
                "episode.mp4",
                server.url("/file/video.m4s"),
                server.url("/file/audio.m4s"),
            )
            .await
            .unwrap();
        assert_eq!(task.id, MERGE_ID_START);
        assert_eq!(task.kind, TaskKind::Merged);

        let done = wait_status(&env, task.id, TaskStatus::Success).await;
        assert!(done.committed.is_some());
        tokio::time::sleep(Duration::from_millis(150)).await;

        // 成品是双轨容器，样本数与来源一致
        let committed = env.library().join("我的视频-BV1xx").join("episode.mp4");
        let file = std::fs::File::open(&committed).unwrap();
        let size = file.metadata().unwrap().len();
        let reader = mp4::Mp4Reader::read_header(BufReader::new(file), size).unwrap();
        assert_eq!(reader.tracks().len(), 2);
        let counts: Vec<u32> = {
            let mut ids: Vec<u32> = reader.tracks().keys().copied().collect();
            ids.sort_unstable();
            ids.iter().map(|id| reader.tracks()[id].sample_count()).collect()
        };
        assert!(counts.contains(&30) && counts.contains(&10), "counts = {:?}", counts);

        // 合流不可逆：源分支与输出临时文件都已清理，状态移除
        let vid_temp = env.temp_dir().join(format!("task_{}.video.part", task.id));
        let aud_temp = env.temp_dir().join(format!("task_{}.audio.part", task.id));
        assert!(!vid_temp.exists());
        assert!(!aud_temp.exists());
        assert!(env.manager.registry().get_merge_state(task.id).is_none());

        env.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_merge_part_failure_cancels_sibling() {
        let env = build_env().await;
        let server = TestServer::start().await;

        // 视频分支 404，音频分支慢速：失败要把另一分支的作业一并取消
        let task = env
            .manager
            .enqueue_merge(
                spec(),
                "第1话",
                "episode.mp4",
                server.url("/missing"),
                server.url("/slow"),
            )
            .await
            .unwrap();

        let failed = wait_status(&env, task.id, TaskStatus::Failed).await;
        assert!(failed.error.as_deref().unwrap_or("").contains("下载失败"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        let state = env.manager.registry().get_merge_state(task.id).unwrap();
        assert!(state.video.failed);
        assert!(!state.video.running);
        assert!(!state.audio.running);

        env.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_completed_groups() {
        let server = TestServer::start().await;
        let env = build_env().await;

        let task = env
            .manager
            .enqueue(spec(), TaskKind::Video, "标题", "video.mp4", server.url("/ok"))
            .await
            .unwrap();
        wait_status(&env, task.id, TaskStatus::Success).await;

        assert_eq!(env.manager.clear_completed_groups().await, 1);
        assert!(env.manager.groups().is_empty());
        // 再清一次没有可清的
        assert_eq!(env.manager.clear_completed_groups().await, 0);

        env.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_refresh_availability_flags_missing_output() {
        let server = TestServer::start().await;
        let env = build_env().await;

        let task = env
            .manager
            .enqueue(spec(), TaskKind::Video, "标题", "video.mp4", server.url("/ok"))
            .await
            .unwrap();
        wait_status(&env, task.id, TaskStatus::Success).await;
        assert!(env.manager.refresh_availability(task.id).await.unwrap());

        // 用户在外部删掉了成品：不是错误，只是打上缺失标记
        let committed = env.library().join("我的视频-BV1xx").join("video.mp4");
        tokio::fs::remove_file(&committed).await.unwrap();
        assert!(!env.manager.refresh_availability(task.id).await.unwrap());
        let refreshed = env.manager.registry().get_task(task.id).unwrap();
        assert_eq!(refreshed.status, TaskStatus::Success);
        assert!(refreshed.output_missing);

        env.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_enqueue_extra_writes_content() {
        let env = build_env().await;

        let task = env
            .manager
            .enqueue_extra(
                spec(),
                TaskKind::Subtitle,
                "字幕",
                "episode.srt",
                b"1\n00:00:00,000 --> 00:00:01,000\nhello\n".to_vec(),
            )
            .await
            .unwrap();
        assert_eq!(task.id, EXTRA_ID_START);

        wait_status(&env, task.id, TaskStatus::Success).await;
        let committed = env.library().join("我的视频-BV1xx").join("episode.srt");
        assert!(committed.exists());
        // 附属任务从不持有续传状态
        assert!(env.manager.registry().get_transfer_state(task.id).is_none());

        env.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_group_operations() {
        let server = TestServer::start().await;
        let env = build_env().await;

        let a = env
            .manager
            .enqueue(spec(), TaskKind::Video, "视频A", "a.mp4", server.url("/slow"))
            .await
            .unwrap();
        let b = env
            .manager
            .enqueue(spec(), TaskKind::Audio, "音频B", "b.m4a", server.url("/slow"))
            .await
            .unwrap();
        // 相同外部引用进入同一分组
        assert_eq!(a.group_id, b.group_id);
        wait_some_progress(&env, a.id).await;

        assert_eq!(env.manager.pause_group(a.group_id).await, 2);
        assert_eq!(
            env.manager.registry().get_task(b.id).unwrap().status,
            TaskStatus::Paused
        );

        assert_eq!(env.manager.resume_group(a.group_id).await, 2);
        wait_status(&env, a.id, TaskStatus::Success).await;
        wait_status(&env, b.id, TaskStatus::Success).await;

        env.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_all_wipes_everything() {
        let server = TestServer::start().await;
        let env = build_env().await;

        let task = env
            .manager
            .enqueue(spec(), TaskKind::Video, "标题", "video.mp4", server.url("/slow"))
            .await
            .unwrap();
        wait_some_progress(&env, task.id).await;

        env.manager.clear_all().await;
        assert!(env.manager.groups().is_empty());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!env.temp_dir().join("task_1.part").exists());

        env.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_recovers_running_task_as_unsafe_exit() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        let temp_dir = dir.path().join("temp");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::create_dir_all(&temp_dir).unwrap();

        // 手工构造「死在下载途中」的上次快照
        let mut group =
            TaskGroup::new(1, "标题".into(), String::new(), Some("BV1xx".into()), None, "标题-BV1xx".into());
        let mut task = DownloadTask::new(
            1,
            1,
            TaskKind::Video,
            "标题".into(),
            "video.mp4".into(),
            "http://127.0.0.1:9/unreachable".into(),
        );
        task.status = TaskStatus::Running;
        group.tasks.push(task);
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            groups: vec![group],
            resumable_states: vec![TransferState::new(
                1,
                "http://127.0.0.1:9/unreachable".into(),
                "task_1.part".into(),
            )],
            merge_states: vec![],
        };
        std::fs::write(
            data_dir.join("tasks.json"),
            serde_json::to_vec_pretty(&snapshot).unwrap(),
        )
        .unwrap();
        std::fs::write(temp_dir.join("task_1.part"), vec![0u8; 123]).unwrap();

        let env = build_env_in(dir).await;

        // 非安全退出：失败 + 临时文件消失，不自动续传
        let task = env.manager.registry().get_task(1).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.error.as_deref(),
            Some(&*TaskError::UnsafeExit.to_string())
        );
        assert!(!env.temp_dir().join("task_1.part").exists());

        // 新任务的 ID 不会与恢复的任务冲突
        let server = TestServer::start().await;
        let fresh = env
            .manager
            .enqueue(spec(), TaskKind::Video, "新任务", "new.mp4", server.url("/ok"))
            .await
            .unwrap();
        assert_eq!(fresh.id, 2);

        env.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_auto_resumes_pending_task() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        let server = TestServer::start().await;

        let mut group =
            TaskGroup::new(1, "我的视频".into(), String::new(), Some("BV1xx".into()), None, "我的视频-BV1xx".into());
        let task = DownloadTask::new(
            1,
            1,
            TaskKind::Video,
            "标题".into(),
            "video.mp4".into(),
            server.url("/ok"),
        );
        group.tasks.push(task);
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            groups: vec![group],
            resumable_states: vec![TransferState::new(1, server.url("/ok"), "task_1.part".into())],
            merge_states: vec![],
        };
        std::fs::write(
            data_dir.join("tasks.json"),
            serde_json::to_vec_pretty(&snapshot).unwrap(),
        )
        .unwrap();

        let env = build_env_in(dir).await;
        // Pending 任务自动续传直到完成
        wait_status(&env, 1, TaskStatus::Success).await;
        let committed = env.library().join("我的视频-BV1xx").join("video.mp4");
        assert_eq!(tokio::fs::read(&committed).await.unwrap(), body_bytes());

        env.manager.shutdown().await;
    }
}
