//! 周期解析与桶对齐
//!
//! 1小时及以下的周期按UTC整除对齐；1小时以上、1天以内的日内周期按交易
//! 会话对齐：每个交易日从America/New_York时区的18:00开始（夏令时自动
//! 切换，UTC偏移随之变化）。会话开始时间按本地日历日做了缓存，避免高频
//! 路径上重复的时区换算。

use crate::mdcommon::error::{AppError, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::America::New_York;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

pub const MINUTE_MS: i64 = 60 * 1000;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// 交易会话的本地开始时刻：18:00（纽约时间）
const SESSION_START_HOUR: u32 = 18;

// 会话开始时间缓存：纽约本地日历日 -> 当日18:00对应的UTC毫秒
static SESSION_STARTS: Lazy<Mutex<HashMap<NaiveDate, i64>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// 解析周期字符串为毫秒数
///
/// 仅接受 `^\d+[mhd]$`，例如 "1m" -> 60000, "4h" -> 14400000。
/// 其他任何输入都返回错误。
pub fn parse_timeframe(tf: &str) -> Result<i64> {
    if tf.len() < 2 {
        return Err(AppError::TimeframeError(format!("invalid timeframe: {tf}")));
    }
    let (num, unit) = tf.split_at(tf.len() - 1);
    if num.is_empty() || !num.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AppError::TimeframeError(format!("invalid timeframe: {tf}")));
    }
    let value: i64 = num
        .parse()
        .map_err(|_| AppError::TimeframeError(format!("invalid timeframe: {tf}")))?;
    if value == 0 {
        return Err(AppError::TimeframeError(format!("invalid timeframe: {tf}")));
    }
    match unit {
        "m" => Ok(value * MINUTE_MS),
        "h" => Ok(value * HOUR_MS),
        "d" => Ok(value * DAY_MS),
        _ => Err(AppError::TimeframeError(format!("invalid timeframe: {tf}"))),
    }
}

/// 取给定纽约本地日历日的会话开始时间（UTC毫秒），带缓存
fn session_start_for_day(day: NaiveDate) -> i64 {
    if let Some(&ms) = SESSION_STARTS.lock().unwrap().get(&day) {
        return ms;
    }
    // 纽约时区在02:00本地时间切换夏令时，18:00从不落在间隙或重叠区间
    let naive = day
        .and_hms_opt(SESSION_START_HOUR, 0, 0)
        .unwrap_or_else(|| day.and_time(NaiveTime::MIN));
    let ms = New_York
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_else(|| day.and_time(NaiveTime::MIN).and_utc().timestamp_millis());
    SESSION_STARTS.lock().unwrap().insert(day, ms);
    ms
}

/// 计算时间戳`ts_ms`之前（含）最近的一次18:00纽约时间，返回UTC毫秒
pub fn session_start_at_or_before(ts_ms: i64) -> i64 {
    let utc = match DateTime::<Utc>::from_timestamp_millis(ts_ms) {
        Some(dt) => dt,
        None => return (ts_ms / DAY_MS) * DAY_MS,
    };
    let local = utc.with_timezone(&New_York);
    let mut day = local.date_naive();
    if local.time().hour() < SESSION_START_HOUR {
        day = day.pred_opt().unwrap_or(day);
    }
    session_start_for_day(day)
}

/// 计算时间戳所属桶的开始时间
///
/// - `interval_ms <= 1h`：UTC整除对齐
/// - `interval_ms > 1h`：会话对齐，桶从最近一次18:00纽约时间起按周期切分
pub fn bucket_start(ts_ms: i64, interval_ms: i64) -> i64 {
    if interval_ms <= HOUR_MS {
        (ts_ms / interval_ms) * interval_ms
    } else {
        let session = session_start_at_or_before(ts_ms);
        session + ((ts_ms - session) / interval_ms) * interval_ms
    }
}
