// 导出模块
pub mod mdcommon;
pub mod mddata;
pub mod mdserver;

// Re-export error types
pub use mdcommon::error::{AppError, Result};
