// 导出共享模块
pub mod config;
pub mod db;
pub mod error;
pub mod logging_setup;
pub mod models;
pub mod store;
pub mod timeframe;

// 重新导出常用类型，方便使用
pub use config::ServerConfig;
pub use db::{open_db_pool, BarCache, ClearFilter, DbPool};
pub use error::{AppError, Result};
pub use models::{Bar, BarSource, SubscriptionKey, Trade};
pub use store::{AncillaryStore, Annotation, Strategy};
pub use timeframe::{bucket_start, parse_timeframe, DAY_MS, HOUR_MS, MINUTE_MS};
