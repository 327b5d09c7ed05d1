//! 日志初始化
//!
//! 统一的 tracing 订阅器初始化。环境变量 RUST_LOG 优先于配置文件的
//! 日志级别。

use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;

/// 从配置初始化日志系统
///
/// `logging_config` 为 None 时使用默认配置（info 级别）。
pub fn init_tracing_from_config(logging_config: Option<&LoggingConfig>) {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level = logging_config.map(|c| c.level.as_str()).unwrap_or("info");
            EnvFilter::new(level)
        }
    };

    let default_config = LoggingConfig::default();
    let config = logging_config.unwrap_or(&default_config);

    let _ = fmt::Subscriber::builder()
        .with_target(config.with_target)
        .with_file(config.with_file)
        .with_line_number(config.with_line_number)
        .with_env_filter(env_filter)
        .try_init();
}
