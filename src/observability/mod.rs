//! 日志初始化：EnvFilter（默认 info，可用 RUST_LOG 覆盖）+ fmt 输出到 stderr

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局 subscriber；重复调用时忽略
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
