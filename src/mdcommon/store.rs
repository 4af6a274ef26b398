//! 附属存储：设置、标注、策略
//!
//! 简单的key/JSON存储加CRUD，核心逻辑通过这个小接口访问，不感知底层
//! 持久化技术。与K线缓存共用同一个连接池。

use crate::mdcommon::db::DbPool;
use crate::mdcommon::error::{AppError, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

/// 图表标注
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub client_id: String,
    pub unique_id: String,
    pub instrument: String,
    pub timeframe: String,
    pub annotype: String,
    pub object: serde_json::Value,
}

/// 策略发布信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub client_id: String,
    pub strategy_name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub subscribers: Vec<String>,
}

pub struct AncillaryStore {
    pool: DbPool,
}

impl AncillaryStore {
    pub fn new(pool: DbPool) -> Result<Self> {
        let store = Self { pool };
        store.init_schema()?;
        info!(target: "store", "附属存储初始化完成");
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("Failed to get connection: {e}")))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settings (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS client_settings (
                client_id TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS annotations (
                client_id TEXT NOT NULL,
                unique_id TEXT NOT NULL,
                instrument TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                annotype TEXT NOT NULL,
                object TEXT NOT NULL,
                PRIMARY KEY (client_id, unique_id)
            );
            CREATE TABLE IF NOT EXISTS strategies (
                client_id TEXT PRIMARY KEY,
                strategy_name TEXT NOT NULL,
                description TEXT NOT NULL,
                parameters TEXT NOT NULL,
                subscribers TEXT NOT NULL
            );",
        )
        .map_err(|e| AppError::DatabaseError(format!("Failed to create ancillary tables: {e}")))?;

        Ok(())
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("Failed to get connection: {e}")))
    }

    //=========================================================================
    // 全局设置与按客户端设置
    //=========================================================================

    pub fn set_setting(&self, name: &str, value: &serde_json::Value) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO settings (name, value) VALUES (?, ?)",
                params![name, value.to_string()],
            )
            .map_err(|e| AppError::DatabaseError(format!("Failed to save setting: {e}")))?;
        Ok(())
    }

    pub fn get_setting(&self, name: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row("SELECT value FROM settings WHERE name = ?", params![name], |row| {
                row.get(0)
            })
            .optional()?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    pub fn set_client_settings(&self, client_id: &str, value: &serde_json::Value) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO client_settings (client_id, value) VALUES (?, ?)",
                params![client_id, value.to_string()],
            )
            .map_err(|e| AppError::DatabaseError(format!("Failed to save client settings: {e}")))?;
        Ok(())
    }

    pub fn get_client_settings(&self, client_id: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM client_settings WHERE client_id = ?",
                params![client_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    //=========================================================================
    // 标注
    //=========================================================================

    pub fn save_annotation(&self, anno: &Annotation) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO annotations
                 (client_id, unique_id, instrument, timeframe, annotype, object)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    anno.client_id,
                    anno.unique_id,
                    anno.instrument,
                    anno.timeframe,
                    anno.annotype,
                    anno.object.to_string(),
                ],
            )
            .map_err(|e| AppError::DatabaseError(format!("Failed to save annotation: {e}")))?;
        Ok(())
    }

    pub fn delete_annotation(&self, client_id: &str, unique_id: &str) -> Result<bool> {
        let deleted = self
            .conn()?
            .execute(
                "DELETE FROM annotations WHERE client_id = ? AND unique_id = ?",
                params![client_id, unique_id],
            )
            .map_err(|e| AppError::DatabaseError(format!("Failed to delete annotation: {e}")))?;
        Ok(deleted > 0)
    }

    pub fn get_annotations(&self, client_id: &str) -> Result<Vec<Annotation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT unique_id, instrument, timeframe, annotype, object
             FROM annotations WHERE client_id = ?",
        )?;
        let rows = stmt.query_map(params![client_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (unique_id, instrument, timeframe, annotype, object) = row?;
            result.push(Annotation {
                client_id: client_id.to_string(),
                unique_id,
                instrument,
                timeframe,
                annotype,
                object: serde_json::from_str(&object).unwrap_or(serde_json::Value::Null),
            });
        }
        Ok(result)
    }

    //=========================================================================
    // 策略
    //=========================================================================

    pub fn save_strategy(&self, strategy: &Strategy) -> Result<()> {
        let subscribers =
            serde_json::json!({ "subscribers": strategy.subscribers }).to_string();
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO strategies
                 (client_id, strategy_name, description, parameters, subscribers)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    strategy.client_id,
                    strategy.strategy_name,
                    strategy.description,
                    strategy.parameters.to_string(),
                    subscribers,
                ],
            )
            .map_err(|e| AppError::DatabaseError(format!("Failed to save strategy: {e}")))?;
        Ok(())
    }

    pub fn get_strategy(&self, client_id: &str) -> Result<Option<Strategy>> {
        let conn = self.conn()?;
        let row: Option<(String, String, String, String)> = conn
            .query_row(
                "SELECT strategy_name, description, parameters, subscribers
                 FROM strategies WHERE client_id = ?",
                params![client_id],
                |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                },
            )
            .optional()?;

        match row {
            Some((strategy_name, description, parameters, subscribers)) => {
                let parameters = serde_json::from_str(&parameters).unwrap_or(serde_json::Value::Null);
                let subscribers = parse_subscribers(&subscribers);
                Ok(Some(Strategy {
                    client_id: client_id.to_string(),
                    strategy_name,
                    description,
                    parameters,
                    subscribers,
                }))
            }
            None => Ok(None),
        }
    }

    /// 取某个发布者策略的订阅者名单，发送时查询，不做缓存
    pub fn strategy_subscribers(&self, client_id: &str) -> Result<Vec<String>> {
        Ok(self
            .get_strategy(client_id)?
            .map(|s| s.subscribers)
            .unwrap_or_default())
    }
}

fn parse_subscribers(raw: &str) -> Vec<String> {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| {
            v.get("subscribers").and_then(|s| {
                s.as_array().map(|arr| {
                    arr.iter()
                        .filter_map(|x| x.as_str().map(|s| s.to_string()))
                        .collect()
                })
            })
        })
        .unwrap_or_default()
}
