//! 任务错误分类
//!
//! 面向观察者展示的错误文案。引擎内部的失败细节（HTTP 状态、IO 错误）
//! 在传输/合流单元各自的错误类型里，到达任务层时折叠成这里的分类。

/// 任务级错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// 网络传输失败。可重试，重试从磁盘已有字节续传
    Network(String),
    /// 进程非安全退出。只在启动恢复时判定，必须用户显式重试
    UnsafeExit,
    /// 合流失败。源临时文件保留，重试只重跑合流
    Merge(String),
    /// 成品提交失败
    Commit(String),
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::Network(msg) => write!(f, "下载失败: {}", msg),
            TaskError::UnsafeExit => write!(f, "进程异常退出，临时文件不可信，请重试"),
            TaskError::Merge(msg) => write!(f, "音视频合并失败: {}", msg),
            TaskError::Commit(msg) => write!(f, "保存失败: {}", msg),
        }
    }
}

impl std::error::Error for TaskError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            TaskError::Network("连接超时".to_string()).to_string(),
            "下载失败: 连接超时"
        );
        assert!(TaskError::UnsafeExit.to_string().contains("异常退出"));
        assert!(TaskError::Merge("无音频轨".to_string())
            .to_string()
            .starts_with("音视频合并失败"));
    }
}
