//! 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 引擎配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

impl EngineConfig {
    /// 从 toml 文件加载配置；文件不存在时返回默认值
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;
        let config: Self = toml::from_str(&content).context("解析配置文件失败")?;
        Ok(config)
    }

    /// 保存配置到 toml 文件
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.ok();
        }
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, content)
            .await
            .with_context(|| format!("写入配置文件失败: {:?}", path))?;
        Ok(())
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 进度上报最小间隔（毫秒）。测速滑动窗口与此一致
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// User-Agent 请求头
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Referer 请求头。部分媒体 CDN 缺少此头会返回 403
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
}

fn default_progress_interval_ms() -> u64 {
    500
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string()
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: default_user_agent(),
            referer: None,
        }
    }
}

/// 持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 快照文件名（位于数据目录内）
    #[serde(default = "default_snapshot_file")]
    pub snapshot_file: String,
    /// 去抖动静默期（毫秒）：此时间内的多次变更合并为一次写盘
    #[serde(default = "default_flush_quiet_ms")]
    pub flush_quiet_ms: u64,
}

fn default_snapshot_file() -> String {
    "tasks.json".to_string()
}

fn default_flush_quiet_ms() -> u64 {
    1000
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_file: default_snapshot_file(),
            flush_quiet_ms: default_flush_quiet_ms(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化（控制台输出始终开启）
    #[serde(default)]
    pub file_enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file_enabled: false,
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}
