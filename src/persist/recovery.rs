//! 启动恢复对账
//!
//! 进程启动时、任何作业开始之前，对上次快照做一次性分类：
//!
//! 1. 目标位置已有同名成品 → 此前已完成，状态强制为成功，丢弃续传状态
//! 2. Pending → 尚无任何写入，安全自动续传
//! 3. Running、或 Paused 且非用户暂停 → 进程死在写入途中，
//!    临时文件不可信，删掉并标记失败（带「非安全退出」错误），等用户重试
//! 4. 合流任务死在 Merging → 宽大处理：只有复用步骤被打断，
//!    两个源文件保留，标记失败让重试只重跑合流
//! 5. 双分支都已完成且任务未失败/未暂停 → 排队自动重新合流而非重新下载
//!
//! 对同一快照重复对账得到相同结果（幂等）。

use std::collections::HashMap;
use std::path::Path;

use tracing::{info, warn};

use super::types::Snapshot;
use crate::collab::StorageSink;
use crate::error::TaskError;
use crate::task::{
    classify_id, MergeState, TaskGroup, TaskIdClass, TaskStatus, TransferState,
};

/// 对账结果：恢复后的内存状态 + 待自动执行的工作清单
#[derive(Debug, Default)]
pub struct RecoveryOutcome {
    /// 恢复后的分组（各自带任务）
    pub groups: Vec<TaskGroup>,
    /// 恢复后的单流续传状态
    pub transfer_states: Vec<TransferState>,
    /// 恢复后的合流状态
    pub merge_states: Vec<MergeState>,
    /// 自动续传的任务 ID
    pub auto_resume: Vec<i64>,
    /// 自动重新合流的任务 ID
    pub auto_merge: Vec<i64>,
}

/// 对上次快照做一次性对账
pub async fn reconcile(
    snapshot: Snapshot,
    temp_dir: &Path,
    sink: &dyn StorageSink,
) -> RecoveryOutcome {
    let mut transfer_map: HashMap<i64, TransferState> = snapshot
        .resumable_states
        .into_iter()
        .map(|s| (s.task_id, s))
        .collect();
    let mut merge_map: HashMap<i64, MergeState> = snapshot
        .merge_states
        .into_iter()
        .map(|s| (s.task_id, s))
        .collect();

    let mut outcome = RecoveryOutcome::default();

    for mut group in snapshot.groups {
        for task in &mut group.tasks {
            // 规则 1：目标位置已有成品，此前已在别处完成
            if sink.exists_in(&group.folder_name, &task.file_name).await {
                info!(
                    "任务 {} 的成品已存在于 {:?}，直接判定成功",
                    task.id, group.folder_name
                );
                cleanup_task_temps(temp_dir, task.id, &transfer_map, &merge_map).await;
                transfer_map.remove(&task.id);
                merge_map.remove(&task.id);
                task.status = TaskStatus::Success;
                task.error = None;
                task.user_paused = false;
                task.progress = 100.0;
                continue;
            }

            if !task.kind.is_managed() {
                // 附属任务的内容来自调用方，断了就无法续传
                if !task.status.is_terminal() {
                    task.mark_failed(TaskError::UnsafeExit.to_string());
                }
                continue;
            }

            match classify_id(task.id) {
                TaskIdClass::Single => {
                    reconcile_single(task, temp_dir, &mut transfer_map, &mut outcome.auto_resume)
                        .await;
                }
                TaskIdClass::Merge => {
                    reconcile_merge(
                        task,
                        temp_dir,
                        &mut merge_map,
                        &mut outcome.auto_resume,
                        &mut outcome.auto_merge,
                    )
                    .await;
                }
                TaskIdClass::Extra => {
                    // 受管类型不会落在附属 ID 段；防御性失败
                    warn!("任务 {} 的 ID 段与类型不符", task.id);
                    if !task.status.is_terminal() {
                        task.mark_failed(TaskError::UnsafeExit.to_string());
                    }
                }
            }
        }
        outcome.groups.push(group);
    }

    // 只保留仍有对应任务、且任务未正常完结的状态
    let live_ids: std::collections::HashSet<i64> = outcome
        .groups
        .iter()
        .flat_map(|g| g.tasks.iter())
        .filter(|t| !t.status.is_settled())
        .map(|t| t.id)
        .collect();
    outcome.transfer_states = transfer_map
        .into_values()
        .filter(|s| live_ids.contains(&s.task_id))
        .collect();
    outcome.transfer_states.sort_by_key(|s| s.task_id);
    outcome.merge_states = merge_map
        .into_values()
        .filter(|s| live_ids.contains(&s.task_id))
        .collect();
    outcome.merge_states.sort_by_key(|s| std::cmp::Reverse(s.task_id));
    outcome.auto_resume.sort_unstable();
    outcome.auto_merge.sort_unstable();

    info!(
        "启动对账完成: {} 个分组, 自动续传 {} 个, 自动合流 {} 个",
        outcome.groups.len(),
        outcome.auto_resume.len(),
        outcome.auto_merge.len()
    );
    outcome
}

/// 单流任务对账
async fn reconcile_single(
    task: &mut crate::task::DownloadTask,
    temp_dir: &Path,
    transfer_map: &mut HashMap<i64, TransferState>,
    auto_resume: &mut Vec<i64>,
) {
    match task.status {
        TaskStatus::Pending => {
            // 规则 2：还没开始写，安全自动续传
            task.error = None;
            auto_resume.push(task.id);
        }
        TaskStatus::Running | TaskStatus::Merging => {
            unsafe_exit_single(task, temp_dir, transfer_map).await;
        }
        TaskStatus::Paused if !task.user_paused => {
            // 非用户暂停的 Paused 只会来自非安全退出
            unsafe_exit_single(task, temp_dir, transfer_map).await;
        }
        TaskStatus::Paused | TaskStatus::Failed => {
            // 用户暂停/失败：原样保留，等用户继续或重试
        }
        TaskStatus::Success | TaskStatus::Cancelled => {
            // 正常完结不该有状态残留；防御性清理
            transfer_map.remove(&task.id);
        }
    }
}

/// 规则 3：单流任务死在写入途中
async fn unsafe_exit_single(
    task: &mut crate::task::DownloadTask,
    temp_dir: &Path,
    transfer_map: &mut HashMap<i64, TransferState>,
) {
    if let Some(state) = transfer_map.get_mut(&task.id) {
        let temp = temp_dir.join(&state.file_name);
        tokio::fs::remove_file(&temp).await.ok();
        state.downloaded = 0;
        state.etag = None;
        state.last_modified = None;
    }
    warn!("任务 {} 在上次运行中非安全退出，临时文件已删除", task.id);
    task.mark_failed(TaskError::UnsafeExit.to_string());
    task.user_paused = false;
    task.downloaded = 0;
    task.progress = 0.0;
}

/// 合流任务对账
async fn reconcile_merge(
    task: &mut crate::task::DownloadTask,
    temp_dir: &Path,
    merge_map: &mut HashMap<i64, MergeState>,
    auto_resume: &mut Vec<i64>,
    auto_merge: &mut Vec<i64>,
) {
    let Some(state) = merge_map.get_mut(&task.id) else {
        // 状态丢了就无从恢复
        if !task.status.is_terminal() {
            task.mark_failed(TaskError::UnsafeExit.to_string());
        }
        return;
    };
    // 运行期标记不跨进程
    state.merging = false;
    state.video.running = false;
    state.audio.running = false;

    match task.status {
        TaskStatus::Merging => {
            // 规则 4：只有复用步骤被打断，源文件保留，重试只重跑合流
            state.merge_failed = true;
            warn!("合流任务 {} 死在合流阶段，源文件保留待重试", task.id);
            task.mark_failed(TaskError::Merge("合流被进程退出打断".to_string()).to_string());
            task.user_paused = false;
        }
        TaskStatus::Pending | TaskStatus::Running => {
            if state.both_completed() {
                // 规则 5：双分支完好，排队自动重新合流
                task.error = None;
                task.user_paused = false;
                auto_merge.push(task.id);
            } else if task.status == TaskStatus::Pending {
                // 规则 2：尚未开始写
                task.error = None;
                auto_resume.push(task.id);
            } else {
                // 规则 3：未完成的分支死在写入途中
                for part in [&mut state.video, &mut state.audio] {
                    if !part.completed {
                        let temp = temp_dir.join(&part.file_name);
                        tokio::fs::remove_file(&temp).await.ok();
                        part.downloaded = 0;
                        part.etag = None;
                        part.last_modified = None;
                    }
                }
                warn!(
                    "合流任务 {} 非安全退出，未完成分支的临时文件已删除",
                    task.id
                );
                task.mark_failed(TaskError::UnsafeExit.to_string());
                task.user_paused = false;
            }
        }
        TaskStatus::Paused if !task.user_paused => {
            if state.both_completed() {
                task.error = None;
                auto_merge.push(task.id);
            } else {
                for part in [&mut state.video, &mut state.audio] {
                    if !part.completed {
                        let temp = temp_dir.join(&part.file_name);
                        tokio::fs::remove_file(&temp).await.ok();
                        part.downloaded = 0;
                        part.etag = None;
                        part.last_modified = None;
                    }
                }
                task.mark_failed(TaskError::UnsafeExit.to_string());
                task.user_paused = false;
            }
        }
        TaskStatus::Paused | TaskStatus::Failed => {
            // 用户暂停/失败：原样保留
        }
        TaskStatus::Success | TaskStatus::Cancelled => {
            merge_map.remove(&task.id);
        }
    }
}

/// 清理一个任务名下的全部临时文件
async fn cleanup_task_temps(
    temp_dir: &Path,
    task_id: i64,
    transfer_map: &HashMap<i64, TransferState>,
    merge_map: &HashMap<i64, MergeState>,
) {
    if let Some(state) = transfer_map.get(&task_id) {
        tokio::fs::remove_file(temp_dir.join(&state.file_name))
            .await
            .ok();
    }
    if let Some(state) = merge_map.get(&task_id) {
        tokio::fs::remove_file(temp_dir.join(&state.video.file_name))
            .await
            .ok();
        tokio::fs::remove_file(temp_dir.join(&state.audio.file_name))
            .await
            .ok();
    }
}
