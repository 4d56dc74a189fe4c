//! 任务数据模型
//!
//! 定义下载任务、任务分组、续传/合流状态与任务 ID 分配器。
//! 所有字段只由编排器修改，观察者只读。

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// 合流任务 ID 段起始值（从此向下递减分配）
pub const MERGE_ID_START: i64 = -1_000_000;

/// 附属任务 ID 段起始值（从此向下递减分配）
pub const EXTRA_ID_START: i64 = -2_000_000;

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// 单流视频
    Video,
    /// 单流音频
    Audio,
    /// 音视频合流
    Merged,
    /// 字幕文件
    Subtitle,
    /// 封面图片
    Cover,
    /// 其他附属文件
    Other,
}

impl TaskKind {
    /// 是否为受管的网络媒体任务（受管任务才持有续传/合流状态）
    pub fn is_managed(&self) -> bool {
        matches!(self, Self::Video | Self::Audio | Self::Merged)
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 等待中
    Pending,
    /// 下载中
    Running,
    /// 合流中
    Merging,
    /// 已暂停
    Paused,
    /// 已完成
    Success,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl TaskStatus {
    /// 是否为终态（不再有任何作业在跑）
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// 正常完结的终态。失败任务保留续传状态以便重试，不算在内
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Success | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Merging => write!(f, "merging"),
            Self::Paused => write!(f, "paused"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// 下载任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    /// 任务 ID（正数=单流，-1000000 以下=合流，-2000000 以下=附属）
    pub id: i64,
    /// 所属分组 ID
    pub group_id: i64,
    /// 任务类型
    pub kind: TaskKind,
    /// 展示标题
    pub title: String,
    /// 目标文件名
    pub file_name: String,
    /// 源地址
    pub url: String,
    /// 生命周期状态
    pub status: TaskStatus,
    /// 进度百分比 (0-100)
    pub progress: f64,
    /// 已下载字节数
    pub downloaded: u64,
    /// 总字节数（0 表示未知）
    pub total: u64,
    /// 即时速度 (bytes/s)
    #[serde(skip)]
    pub speed: u64,
    /// 预计剩余时间（秒）
    #[serde(skip)]
    pub eta_secs: Option<u64>,
    /// 成品句柄（提交成功后由存储接收端返回）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub committed: Option<String>,
    /// 用户主动暂停标记。区分用户暂停与其他非运行态：
    /// 启动时发现 Paused 且此标记为 false，说明进程曾非安全退出
    #[serde(default)]
    pub user_paused: bool,
    /// 成品文件已在外部被删除
    #[serde(default)]
    pub output_missing: bool,
    /// 最近一次错误信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
}

impl DownloadTask {
    pub fn new(
        id: i64,
        group_id: i64,
        kind: TaskKind,
        title: String,
        file_name: String,
        url: String,
    ) -> Self {
        Self {
            id,
            group_id,
            kind,
            title,
            file_name,
            url,
            status: TaskStatus::Pending,
            progress: 0.0,
            downloaded: 0,
            total: 0,
            speed: 0,
            eta_secs: None,
            committed: None,
            user_paused: false,
            output_missing: false,
            error: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// 更新进度计数并重算百分比
    pub fn set_progress(&mut self, downloaded: u64, total: u64, speed: u64, eta_secs: Option<u64>) {
        self.downloaded = downloaded;
        self.total = total;
        self.speed = speed;
        self.eta_secs = eta_secs;
        self.progress = if total > 0 {
            (downloaded as f64 / total as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
    }

    /// 标记为运行中
    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.user_paused = false;
        self.error = None;
    }

    /// 标记为已完成，记录成品句柄
    pub fn mark_success(&mut self, committed: Option<String>) {
        self.status = TaskStatus::Success;
        self.progress = 100.0;
        if self.total == 0 {
            self.total = self.downloaded;
        }
        self.downloaded = self.total;
        self.speed = 0;
        self.eta_secs = None;
        self.error = None;
        if committed.is_some() {
            self.committed = committed;
        }
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        self.status = TaskStatus::Failed;
        self.speed = 0;
        self.eta_secs = None;
        self.error = Some(error);
    }

    /// 标记为用户暂停
    pub fn mark_paused(&mut self) {
        self.status = TaskStatus::Paused;
        self.user_paused = true;
        self.speed = 0;
        self.eta_secs = None;
    }

    /// 标记为已取消
    pub fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.speed = 0;
        self.eta_secs = None;
    }
}

/// 任务分组
///
/// 一次逻辑获取（一个视频、一集番剧）创建一个分组，组内任务共享目标文件夹。
/// 没有任何任务的分组会被删除，对观察者不可见。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroup {
    /// 分组 ID
    pub id: i64,
    /// 标题
    pub title: String,
    /// 副标题（分 P 名、集数等）
    #[serde(default)]
    pub subtitle: String,
    /// 外部引用 ID（稿件号等）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
    /// 封面引用
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 解析后的目标文件夹名
    pub folder_name: String,
    /// 组内任务
    #[serde(default)]
    pub tasks: Vec<DownloadTask>,
}

impl TaskGroup {
    pub fn new(
        id: i64,
        title: String,
        subtitle: String,
        external_ref: Option<String>,
        cover: Option<String>,
        folder_name: String,
    ) -> Self {
        Self {
            id,
            title,
            subtitle,
            external_ref,
            cover,
            created_at: chrono::Utc::now().timestamp(),
            folder_name,
            tasks: Vec::new(),
        }
    }

    pub fn task(&self, task_id: i64) -> Option<&DownloadTask> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: i64) -> Option<&mut DownloadTask> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    /// 组内任务是否全部成功
    pub fn is_all_success(&self) -> bool {
        !self.tasks.is_empty()
            && self
                .tasks
                .iter()
                .all(|t| t.status == TaskStatus::Success)
    }

    /// 分组进度：按字节加权平均；没有任何任务知道总大小时退化为百分比简单平均。
    /// 只要有成员在合流中，结果封顶 99%，避免过早显示完成
    pub fn progress(&self) -> f64 {
        if self.tasks.is_empty() {
            return 0.0;
        }

        let total: u64 = self.tasks.iter().map(|t| t.total).sum();
        let value = if total > 0 {
            let weighted: f64 = self
                .tasks
                .iter()
                .filter(|t| t.total > 0)
                .map(|t| t.progress * t.total as f64)
                .sum();
            weighted / total as f64
        } else {
            self.tasks.iter().map(|t| t.progress).sum::<f64>() / self.tasks.len() as f64
        };

        let merging = self.tasks.iter().any(|t| t.status == TaskStatus::Merging);
        if merging {
            value.min(99.0)
        } else {
            value
        }
    }
}

/// 单流任务的续传状态
///
/// 仅当任务类型受管且状态不是正常完结的终态时存在。
/// 失败任务保留此状态，重试才能从磁盘上的半成品继续
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferState {
    /// 任务 ID
    pub task_id: i64,
    /// 源地址
    pub url: String,
    /// 临时文件名（位于引擎独占的临时目录内）
    pub file_name: String,
    /// 总字节数（一旦得知）
    #[serde(default)]
    pub total: u64,
    /// 续传校验值：ETag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// 续传校验值：Last-Modified
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    /// 已下载字节数。不持久化：恢复时以磁盘文件长度为准
    #[serde(skip)]
    pub downloaded: u64,
    /// 即时速度，不持久化
    #[serde(skip)]
    pub speed: u64,
}

impl TransferState {
    pub fn new(task_id: i64, url: String, file_name: String) -> Self {
        Self {
            task_id,
            url,
            file_name,
            total: 0,
            etag: None,
            last_modified: None,
            downloaded: 0,
            speed: 0,
        }
    }
}

/// 合流任务的单个分支（视频或音频）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergePart {
    /// 源地址
    pub url: String,
    /// 临时文件名
    pub file_name: String,
    /// 总字节数
    #[serde(default)]
    pub total: u64,
    /// 续传校验值：ETag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// 续传校验值：Last-Modified
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    /// 分支已下载完成
    #[serde(default)]
    pub completed: bool,
    /// 已下载字节数。恢复时以磁盘文件长度为准
    #[serde(skip)]
    pub downloaded: u64,
    /// 即时速度
    #[serde(skip)]
    pub speed: u64,
    /// 分支作业正在传输
    #[serde(skip)]
    pub running: bool,
    /// 分支传输失败
    #[serde(skip)]
    pub failed: bool,
}

impl MergePart {
    pub fn new(url: String, file_name: String) -> Self {
        Self {
            url,
            file_name,
            total: 0,
            etag: None,
            last_modified: None,
            completed: false,
            downloaded: 0,
            speed: 0,
            running: false,
            failed: false,
        }
    }

    /// 导出为独立的续传状态，供传输单元使用
    pub fn to_transfer_state(&self, task_id: i64) -> TransferState {
        TransferState {
            task_id,
            url: self.url.clone(),
            file_name: self.file_name.clone(),
            total: self.total,
            etag: self.etag.clone(),
            last_modified: self.last_modified.clone(),
            downloaded: self.downloaded,
            speed: self.speed,
        }
    }

    /// 用传输单元回写的状态更新分支
    pub fn absorb(&mut self, state: &TransferState) {
        self.total = state.total;
        self.etag = state.etag.clone();
        self.last_modified = state.last_modified.clone();
        self.downloaded = state.downloaded;
        self.speed = state.speed;
    }
}

/// 合流任务状态：两个分支加合流阶段标记
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeState {
    /// 任务 ID（合流段负数）
    pub task_id: i64,
    /// 合流输出文件名
    pub output_name: String,
    /// 视频分支
    pub video: MergePart,
    /// 音频分支
    pub audio: MergePart,
    /// 合流进行中
    #[serde(default)]
    pub merging: bool,
    /// 合流（复用）已完成。此后源临时文件已删除，重试只会重新提交成品
    #[serde(default)]
    pub merge_completed: bool,
    /// 合流失败。源临时文件保留，重试只重跑合流
    #[serde(default)]
    pub merge_failed: bool,
}

impl MergeState {
    pub fn new(task_id: i64, output_name: String, video: MergePart, audio: MergePart) -> Self {
        Self {
            task_id,
            output_name,
            video,
            audio,
            merging: false,
            merge_completed: false,
            merge_failed: false,
        }
    }

    /// 两个分支是否都已下载完成
    pub fn both_completed(&self) -> bool {
        self.video.completed && self.audio.completed
    }

    /// 是否满足启动合流的条件（触发方仍需通过注册表的一次性武装）
    pub fn ready_to_merge(&self) -> bool {
        self.both_completed()
            && !self.merging
            && !self.merge_completed
            && !self.merge_failed
            && !self.video.failed
            && !self.audio.failed
    }

    /// 由分支状态推导合流任务的可见状态。
    /// 优先级：用户暂停 > 分支失败/合流失败 > 合流中 > 合流完成 >
    /// 双分支完成（即将合流）> 分支传输中 > 等待
    pub fn derive_status(&self, user_paused: bool) -> TaskStatus {
        if user_paused {
            return TaskStatus::Paused;
        }
        if self.video.failed || self.audio.failed || self.merge_failed {
            return TaskStatus::Failed;
        }
        if self.merging {
            return TaskStatus::Merging;
        }
        if self.merge_completed {
            return TaskStatus::Success;
        }
        if self.both_completed() {
            return TaskStatus::Merging;
        }
        if self.video.running || self.audio.running {
            return TaskStatus::Running;
        }
        TaskStatus::Pending
    }
}

/// 任务 ID 段分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskIdClass {
    /// 单流任务（正数）
    Single,
    /// 合流任务
    Merge,
    /// 附属任务（字幕、封面等）
    Extra,
}

/// 仅凭 ID 判断任务所属的段。
/// 各段只会从起始值向下（或向上）分配，段之间互不相交
pub fn classify_id(id: i64) -> TaskIdClass {
    if id > 0 {
        TaskIdClass::Single
    } else if id <= EXTRA_ID_START {
        TaskIdClass::Extra
    } else {
        TaskIdClass::Merge
    }
}

/// 任务/分组 ID 分配器
///
/// 三段互不相交的单调 ID：正数分配给单流任务，合流与附属任务各占一段
/// 很大的负数区间向下递减。恢复时用快照里的最值播种，重启不会复用 ID
#[derive(Debug)]
pub struct TaskIdAllocator {
    next_single: AtomicI64,
    next_merge: AtomicI64,
    next_extra: AtomicI64,
    next_group: AtomicI64,
}

impl Default for TaskIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskIdAllocator {
    pub fn new() -> Self {
        Self {
            next_single: AtomicI64::new(1),
            next_merge: AtomicI64::new(MERGE_ID_START),
            next_extra: AtomicI64::new(EXTRA_ID_START),
            next_group: AtomicI64::new(1),
        }
    }

    pub fn next_single(&self) -> i64 {
        self.next_single.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_merge(&self) -> i64 {
        self.next_merge.fetch_sub(1, Ordering::SeqCst)
    }

    pub fn next_extra(&self) -> i64 {
        self.next_extra.fetch_sub(1, Ordering::SeqCst)
    }

    pub fn next_group(&self) -> i64 {
        self.next_group.fetch_add(1, Ordering::SeqCst)
    }

    /// 从恢复的快照播种。只在启动恢复时调用一次，早于任何分配
    pub fn seed(&self, max_single: i64, min_merge: i64, min_extra: i64, max_group: i64) {
        if max_single >= 1 {
            self.next_single.store(max_single + 1, Ordering::SeqCst);
        }
        if min_merge <= MERGE_ID_START {
            self.next_merge.store(min_merge - 1, Ordering::SeqCst);
        }
        if min_extra <= EXTRA_ID_START {
            self.next_extra.store(min_extra - 1, Ordering::SeqCst);
        }
        if max_group >= 1 {
            self.next_group.store(max_group + 1, Ordering::SeqCst);
        }
    }
}
