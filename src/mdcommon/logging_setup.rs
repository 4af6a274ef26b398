//! 统一日志系统初始化模块

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// 初始化tracing订阅者
///
/// 日志级别来自RUST_LOG，默认info；压低依赖库的噪音。
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,hyper=warn,reqwest=warn,rusqlite=warn,tungstenite=warn")
    });

    Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}
