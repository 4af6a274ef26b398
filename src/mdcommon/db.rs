//! 1分钟K线的持久化缓存
//!
//! 单表复合主键 (instrument, timeframe, open_time)，批量写入在独立写线程
//! 上以单事务upsert完成，空bar在进入事务前被过滤并记录。

use crate::mdcommon::error::{AppError, Result};
use crate::mdcommon::models::{Bar, BarSource};
use crossbeam_channel::{bounded, Receiver, Sender};
use once_cell::sync::Lazy;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

// 写入统计：(插入条数, 跳过的空bar条数, 上次打印时间)
static DB_OPERATIONS: Lazy<(AtomicUsize, AtomicUsize, Mutex<Instant>)> =
    Lazy::new(|| (AtomicUsize::new(0), AtomicUsize::new(0), Mutex::new(Instant::now())));

// 每10秒输出一次数据库操作统计
const DB_LOG_INTERVAL: u64 = 10;

/// 数据库连接池类型
pub type DbPool = Pool<SqliteConnectionManager>;

/// 打开数据库连接池并设置pragma
///
/// WAL日志 + NORMAL同步换吞吐，页缓存约128MiB。
pub fn open_db_pool<P: AsRef<Path>>(db_path: P) -> Result<DbPool> {
    let db_path = db_path.as_ref();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    info!(target: "db", "使用SQLite数据库（WAL模式）: {}", db_path.display());

    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -131072;
             PRAGMA temp_store = MEMORY;
             PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = Pool::builder()
        .max_size(10)
        .build(manager)
        .map_err(|e| AppError::DatabaseError(format!("Failed to create connection pool: {e}")))?;

    Ok(pool)
}

/// 按条件删除的过滤器，各字段可任意组合
#[derive(Debug, Default, Clone)]
pub struct ClearFilter {
    pub instrument: Option<String>,
    pub timeframe: Option<String>,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

/// 写入任务
#[derive(Debug)]
struct WriteTask {
    bars: Vec<Bar>,
    result_sender: Sender<Result<usize>>,
}

/// 写入队列处理器，在专用线程上串行执行事务
struct WriteQueueProcessor {
    receiver: Receiver<WriteTask>,
    pool: DbPool,
    is_running: Arc<Mutex<bool>>,
}

impl WriteQueueProcessor {
    fn new(receiver: Receiver<WriteTask>, pool: DbPool) -> Self {
        Self {
            receiver,
            pool,
            is_running: Arc::new(Mutex::new(true)),
        }
    }

    fn start(self) -> Arc<Mutex<bool>> {
        let is_running = self.is_running.clone();

        thread::spawn(move || {
            info!(target: "db", "K线写入队列处理器已启动");

            while *self.is_running.lock().unwrap() {
                match self.receiver.recv_timeout(Duration::from_millis(100)) {
                    Ok(task) => {
                        let result = self.process_write_task(&task.bars);
                        if let Err(e) = task.result_sender.send(result) {
                            error!(target: "db", "无法发送写入任务结果: {}", e);
                        }
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                        info!(target: "db", "写入队列已关闭，处理器将退出");
                        break;
                    }
                }
            }

            info!(target: "db", "K线写入队列处理器已停止");
        });

        is_running
    }

    /// 单事务批量upsert，任一条失败则整体回滚
    fn process_write_task(&self, bars: &[Bar]) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }

        let mut conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("Failed to get connection: {e}")))?;

        let tx = conn
            .transaction()
            .map_err(|e| AppError::DatabaseError(format!("Failed to begin transaction: {e}")))?;

        let mut count = 0;
        for bar in bars {
            let result = tx.execute(
                "INSERT INTO bars_1m (
                    instrument, timeframe, open_time, open, high, low, close, volume
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(instrument, timeframe, open_time) DO UPDATE SET
                    open = excluded.open, high = excluded.high,
                    low = excluded.low, close = excluded.close,
                    volume = excluded.volume",
                params![
                    bar.instrument,
                    bar.timeframe,
                    bar.ts,
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                ],
            );

            match result {
                Ok(_) => count += 1,
                Err(e) => {
                    let _ = tx.rollback();
                    return Err(AppError::DatabaseError(format!("Failed to upsert bar: {e}")));
                }
            }
        }

        tx.commit()
            .map_err(|e| AppError::DatabaseError(format!("Failed to commit transaction: {e}")))?;

        Ok(count)
    }
}

/// 1分钟K线缓存
pub struct BarCache {
    pool: DbPool,
    write_queue_sender: Sender<WriteTask>,
    queue_processor_running: Arc<Mutex<bool>>,
}

impl BarCache {
    pub fn new(pool: DbPool) -> Result<Self> {
        let (sender, receiver) = bounded(1000);
        let processor = WriteQueueProcessor::new(receiver, pool.clone());
        let queue_processor_running = processor.start();

        let cache = Self {
            pool,
            write_queue_sender: sender,
            queue_processor_running,
        };
        cache.init_schema()?;

        info!(target: "db", "K线缓存初始化完成");
        Ok(cache)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("Failed to get connection: {e}")))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS bars_1m (
                instrument TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume INTEGER NOT NULL,
                PRIMARY KEY (instrument, timeframe, open_time)
            )",
            [],
        )
        .map_err(|e| AppError::DatabaseError(format!("Failed to create bars_1m table: {e}")))?;

        Ok(())
    }

    /// 批量写入K线（同步，调用方在异步上下文中应走spawn_blocking）
    ///
    /// 空bar在入队前被过滤并计入跳过统计；剩余部分在写线程上以单事务
    /// upsert落盘。
    pub fn insert_batch(&self, bars: &[Bar]) -> Result<usize> {
        let (kept, skipped): (Vec<Bar>, Vec<&Bar>) = {
            let mut kept = Vec::with_capacity(bars.len());
            let mut skipped = Vec::new();
            for bar in bars {
                if bar.is_null() {
                    skipped.push(bar);
                } else {
                    kept.push(bar.clone());
                }
            }
            (kept, skipped)
        };

        if !skipped.is_empty() {
            DB_OPERATIONS.1.fetch_add(skipped.len(), Ordering::Relaxed);
            debug!(target: "db", "跳过 {} 条空bar（volume为0或OHLC缺失）", skipped.len());
        }

        if kept.is_empty() {
            return Ok(0);
        }

        let (result_sender, result_receiver) = bounded(1);
        let task = WriteTask {
            bars: kept,
            result_sender,
        };

        self.write_queue_sender
            .send(task)
            .map_err(|e| AppError::DatabaseError(format!("无法将写入任务添加到队列: {e}")))?;

        let result = result_receiver
            .recv()
            .map_err(|e| AppError::DatabaseError(format!("等待写入操作结果时出错: {e}")))?;

        if let Ok(count) = &result {
            DB_OPERATIONS.0.fetch_add(*count, Ordering::Relaxed);
            self.maybe_log_stats();
        }

        result
    }

    /// 查询区间内的1分钟K线，按时间升序
    ///
    /// 读出的bar统一打上 `Cache` 来源标记（来源是发送时元数据，不落盘）。
    pub fn get_range(
        &self,
        instrument: &str,
        timeframe: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Bar>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("Failed to get connection: {e}")))?;

        let mut stmt = conn.prepare(
            "SELECT open_time, open, high, low, close, volume
             FROM bars_1m
             WHERE instrument = ? AND timeframe = ? AND open_time >= ? AND open_time <= ?
             ORDER BY open_time ASC",
        )?;

        let rows = stmt.query_map(params![instrument, timeframe, start_ms, end_ms], |row| {
            Ok(Bar {
                ts: row.get(0)?,
                open: Some(row.get::<_, f64>(1)?),
                high: Some(row.get::<_, f64>(2)?),
                low: Some(row.get::<_, f64>(3)?),
                close: Some(row.get::<_, f64>(4)?),
                volume: row.get(5)?,
                instrument: instrument.to_string(),
                timeframe: timeframe.to_string(),
                source: BarSource::Cache,
                is_closed: true,
            })
        })?;

        let mut result = Vec::new();
        for bar in rows {
            result.push(bar?);
        }
        Ok(result)
    }

    /// 按过滤条件删除K线
    pub fn clear(&self, filter: &ClearFilter) -> Result<usize> {
        let conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("Failed to get connection: {e}")))?;

        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref inst) = filter.instrument {
            clauses.push("instrument = ?");
            values.push(Box::new(inst.clone()));
        }
        if let Some(ref tf) = filter.timeframe {
            clauses.push("timeframe = ?");
            values.push(Box::new(tf.clone()));
        }
        if let Some(start) = filter.start_ms {
            clauses.push("open_time >= ?");
            values.push(Box::new(start));
        }
        if let Some(end) = filter.end_ms {
            clauses.push("open_time <= ?");
            values.push(Box::new(end));
        }

        let sql = if clauses.is_empty() {
            "DELETE FROM bars_1m".to_string()
        } else {
            format!("DELETE FROM bars_1m WHERE {}", clauses.join(" AND "))
        };

        let deleted = conn
            .execute(&sql, rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())))
            .map_err(|e| AppError::DatabaseError(format!("Failed to clear bars: {e}")))?;

        info!(target: "db", "清除了 {} 条K线, 过滤条件: {:?}", deleted, filter);
        Ok(deleted)
    }

    fn maybe_log_stats(&self) {
        let mut last_log_time = DB_OPERATIONS.2.lock().unwrap();
        let now = Instant::now();
        if now.duration_since(*last_log_time).as_secs() >= DB_LOG_INTERVAL {
            let inserted = DB_OPERATIONS.0.load(Ordering::Relaxed);
            let skipped = DB_OPERATIONS.1.load(Ordering::Relaxed);
            debug!(target: "db", "数据库写入统计: 插入={}, 跳过空bar={}", inserted, skipped);
            *last_log_time = now;
        }
    }

    /// 关闭写入队列处理器
    pub fn shutdown(&self) {
        if let Ok(mut running) = self.queue_processor_running.lock() {
            if *running {
                *running = false;
                info!(target: "db", "K线写入队列已关闭");
            }
        }
    }
}

impl Drop for BarCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}
