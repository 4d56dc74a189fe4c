//! 外部协作方接口
//!
//! 引擎核心对外部世界的全部依赖都收敛在这里：成品存储接收端与
//! 可选的元数据标记器。网络与临时文件由引擎自己管，不走抽象。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// 成品存储接收端
///
/// `commit` 把引擎临时目录里的完成文件落到用户可见的位置，
/// 返回的不透明句柄此后用于删除与存在性检查
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// 提交临时文件到目标文件夹，返回成品句柄
    async fn commit(&self, temp: &Path, file_name: &str, folder: &str) -> anyhow::Result<String>;

    /// 删除已提交的成品
    async fn delete(&self, handle: &str) -> anyhow::Result<()>;

    /// 成品是否仍存在（用户可能在外部删除了它）
    async fn exists(&self, handle: &str) -> bool;

    /// 目标文件夹内是否已有该名字的文件（启动恢复的去重判定用）
    async fn exists_in(&self, folder: &str, file_name: &str) -> bool;
}

/// 嵌入成品文件的元数据记录
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagMeta {
    /// 任务标题
    pub title: String,
    /// 分组标题
    pub group_title: String,
    /// 封面引用
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
}

/// 元数据标记器（可选协作方）。失败只记日志，从不影响下载结果
#[async_trait]
pub trait MetadataTagger: Send + Sync {
    async fn tag(&self, file: &Path, meta: &TagMeta) -> anyhow::Result<()>;
}

/// 本地文件系统存储实现：句柄即成品的最终路径
pub struct LocalStorageSink {
    root: PathBuf,
}

impl LocalStorageSink {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl StorageSink for LocalStorageSink {
    async fn commit(&self, temp: &Path, file_name: &str, folder: &str) -> anyhow::Result<String> {
        let dir = self.root.join(folder);
        tokio::fs::create_dir_all(&dir).await?;
        let dest = dir.join(file_name);

        // 优先 rename；跨设备时回退为拷贝+删除
        if tokio::fs::rename(temp, &dest).await.is_err() {
            if let Err(err) = tokio::fs::copy(temp, &dest).await {
                // 半拉子的拷贝产物要清掉
                tokio::fs::remove_file(&dest).await.ok();
                return Err(err.into());
            }
            tokio::fs::remove_file(temp).await.ok();
        }
        debug!("成品已提交: {:?}", dest);
        Ok(dest.to_string_lossy().into_owned())
    }

    async fn delete(&self, handle: &str) -> anyhow::Result<()> {
        match tokio::fs::remove_file(handle).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                warn!("删除成品失败 {}: {}", handle, err);
                Err(err.into())
            }
        }
    }

    async fn exists(&self, handle: &str) -> bool {
        tokio::fs::try_exists(handle).await.unwrap_or(false)
    }

    async fn exists_in(&self, folder: &str, file_name: &str) -> bool {
        let path = self.root.join(folder).join(file_name);
        tokio::fs::try_exists(&path).await.unwrap_or(false)
    }
}
