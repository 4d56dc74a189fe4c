//! 日志系统配置
//!
//! 控制台输出始终开启，可选按天滚动的文件持久化

use crate::config::LogConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 初始化日志系统。
///
/// 返回的 guard 必须在进程存活期间持有，否则文件写入线程会提前退出。
/// 重复初始化（例如测试里）是无害的 no-op
pub fn init(config: &LogConfig) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string());
    let console_layer = fmt::layer().with_timer(timer.clone());

    if config.file_enabled {
        let appender = tracing_appender::rolling::daily(&config.log_dir, "engine.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_timer(timer)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .ok();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init()
            .ok();
        None
    }
}
