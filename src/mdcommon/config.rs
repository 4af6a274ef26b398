//! 服务配置模块

use crate::mdcommon::error::{AppError, Result};
use serde::{Deserialize, Serialize};

/// 系统常量
pub mod constants {
    /// 取数时的早侧容忍窗口：缓存最早点早于请求起点超过3天才向上游补取
    pub const EARLY_CUSHION_MS: i64 = 3 * 24 * 60 * 60 * 1000;

    /// 取数时的晚侧容忍窗口：请求终点为"现在"时，3小时内的尾部缺口不补取
    pub const LATE_CUSHION_MS: i64 = 3 * 60 * 60 * 1000;

    /// 实时1分钟流一次性拉取的静默超时（毫秒）
    pub const LIVE_IDLE_TIMEOUT_MS: u64 = 500;

    /// 可纠正的上游错误（如"Invalid start time"）的最大尝试次数
    pub const VENDOR_RETRY_CAP: usize = 4;

    /// get_data未给start_time时的默认回看窗口（天）
    pub const DEFAULT_WINDOW_DAYS: i64 = 60;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub vendor: VendorConfig,
}

/// 监听配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// WebSocket监听地址
    pub listen_addr: String,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库文件路径
    pub database_path: String,
}

/// 上游行情供应商配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorConfig {
    /// 历史数据通道（HTTP）
    pub historical_url: String,
    /// 实时流网关（WebSocket）
    pub gateway_url: String,
    /// API密钥
    pub api_key: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8765".to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_path: "data/bars.db".to_string(),
        }
    }
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            historical_url: "https://hist.vendor.example.com".to_string(),
            gateway_url: "wss://live.vendor.example.com/v0/stream".to_string(),
            api_key: String::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ListenConfig::default(),
            database: DatabaseConfig::default(),
            vendor: VendorConfig::default(),
        }
    }
}

impl ServerConfig {
    /// 从文件加载配置
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(AppError::IoError)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| AppError::ConfigError(format!("解析配置文件失败: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// 从CONFIG_PATH环境变量指向的文件加载，文件不存在时使用默认配置
    pub fn load() -> Result<Self> {
        const DEFAULT_CONFIG_PATH: &str = "config/marketdata.toml";
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        if std::path::Path::new(&path).exists() {
            Self::from_file(&path)
        } else {
            tracing::warn!(target: "config", "配置文件不存在: {}，使用默认配置", path);
            Ok(Self::default())
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.server.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(AppError::ConfigError(format!(
                "无效的监听地址: {}",
                self.server.listen_addr
            )));
        }
        if self.database.database_path.is_empty() {
            return Err(AppError::ConfigError("数据库路径不能为空".to_string()));
        }
        if self.vendor.historical_url.is_empty() || self.vendor.gateway_url.is_empty() {
            return Err(AppError::ConfigError("上游通道地址不能为空".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_listen_addr() {
        let mut config = ServerConfig::default();
        config.server.listen_addr = "not-an-addr".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_from_toml() {
        let toml_str = r#"
            [server]
            listen_addr = "127.0.0.1:9000"

            [database]
            database_path = "/tmp/md.db"

            [vendor]
            historical_url = "https://hist.example.com"
            gateway_url = "wss://gw.example.com/stream"
            api_key = "db-key-123-ABCDE"
        "#;
        let config: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.vendor.api_key, "db-key-123-ABCDE");
        assert!(config.validate().is_ok());
    }
}
