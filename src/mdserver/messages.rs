//! 客户端消息信封与时间字段解析
//!
//! 每条消息是一个自界定的JSON对象。请求以`action`字段区分；响应以
//! `mtyp`字段区分：data（K线）、ctrl（控制）、error（错误）、
//! strategy（策略广播）。

use crate::mdcommon::config::constants::DEFAULT_WINDOW_DAYS;
use crate::mdcommon::error::{AppError, Result};
use crate::mdcommon::models::Bar;
use crate::mdcommon::timeframe::{DAY_MS, MINUTE_MS};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::json;

/// 数值live_end大于该阈值时按时间戳解释，否则按播放秒数解释
const LIVE_END_TIMESTAMP_THRESHOLD: f64 = 1e8;

//=============================================================================
// 请求信封
//=============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    pub instrument: String,
    pub timeframe: String,
}

/// live_data选项："none"只取历史，"all"持续到断开，数值为秒数
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LiveData {
    Mode(String),
    Seconds(f64),
}

impl Default for LiveData {
    fn default() -> Self {
        LiveData::Mode("none".to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetDataReq {
    pub subscriptions: Vec<SubscriptionItem>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub live_data: LiveData,
    #[serde(default)]
    pub sendto: Option<String>,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default = "default_true")]
    pub save_cache: bool,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetReplayReq {
    pub subscriptions: Vec<SubscriptionItem>,
    pub history_start: serde_json::Value,
    #[serde(default)]
    pub live_start: Option<String>,
    pub live_end: serde_json::Value,
    /// 每虚拟分钟对应的墙钟毫秒
    pub replay_interval: u64,
    #[serde(default)]
    pub timezone: Option<String>,
}

fn default_true() -> bool {
    true
}

/// 客户端请求
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    SetClientId {
        clientid: String,
    },
    GetData(GetDataReq),
    AddTimeframe {
        instrument: String,
        timeframe: String,
    },
    RemoveTimeframe {
        instrument: String,
        timeframe: String,
    },
    StopData,
    GetReplay(GetReplayReq),
    ModifyReplay {
        #[serde(default)]
        pause: Option<bool>,
        #[serde(default)]
        replay_interval: Option<u64>,
    },
    StopReplay,
    // 附属存储CRUD
    SaveSettings {
        name: String,
        value: serde_json::Value,
    },
    GetSettings {
        name: String,
    },
    SaveClientSettings {
        value: serde_json::Value,
    },
    GetClientSettings,
    SaveAnnotation {
        unique_id: String,
        instrument: String,
        timeframe: String,
        annotype: String,
        object: serde_json::Value,
    },
    DeleteAnnotation {
        unique_id: String,
    },
    GetAnnotations,
    SaveStrategy {
        strategy_name: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        parameters: serde_json::Value,
        #[serde(default)]
        subscribers: Vec<String>,
    },
    GetStrategy,
}

impl ClientRequest {
    /// 解析一帧请求；错误作为一行消息返回给客户端，连接保留
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| AppError::DataError(format!("bad request: {e}")))
    }
}

//=============================================================================
// 时间字段解析
//=============================================================================

/// 解析ISO时间戳（接受RFC3339或"YYYY-MM-DD HH:MM:SS"，无时区按UTC）
pub fn parse_iso_ms(s: &str) -> Result<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc().timestamp_millis());
        }
        if fmt == "%Y-%m-%d" {
            if let Ok(date) = chrono::NaiveDate::parse_from_str(s, fmt) {
                if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                    return Ok(naive.and_utc().timestamp_millis());
                }
            }
        }
    }
    Err(AppError::DataError(format!("unparseable timestamp: {s}")))
}

/// 解析get_data的时间范围
///
/// `end_time`为空或"current"表示"现在"；`start_time`为空表示现在减默认
/// 回看窗口（60天）。返回(start, end, end是否为"现在")。
pub fn resolve_data_range(
    start_time: &Option<String>,
    end_time: &Option<String>,
    now_ms: i64,
) -> Result<(i64, i64, bool)> {
    let (end_ms, end_is_now) = match end_time.as_deref() {
        None | Some("current") | Some("") => (now_ms, true),
        Some(s) => (parse_iso_ms(s)?, false),
    };
    let start_ms = match start_time.as_deref() {
        None | Some("") => now_ms - DEFAULT_WINDOW_DAYS * DAY_MS,
        Some(s) => parse_iso_ms(s)?,
    };
    if start_ms > end_ms {
        return Err(AppError::DataError(format!(
            "start_time {start_ms} is after end_time {end_ms}"
        )));
    }
    Ok((start_ms, end_ms, end_is_now))
}

/// 解析get_replay的history_start：负数表示从现在回溯的分钟数，否则为ISO时间戳
pub fn resolve_history_start(value: &serde_json::Value, now_ms: i64) -> Result<i64> {
    match value {
        serde_json::Value::Number(n) => {
            let v = n.as_f64().unwrap_or(0.0);
            if v < 0.0 {
                Ok(now_ms + (v as i64) * MINUTE_MS)
            } else {
                Ok(v as i64)
            }
        }
        serde_json::Value::String(s) => parse_iso_ms(s),
        _ => Err(AppError::DataError("bad history_start".to_string())),
    }
}

/// 解析get_replay的live_start："current"或ISO时间戳
pub fn resolve_live_start(value: &Option<String>, now_ms: i64) -> Result<i64> {
    match value.as_deref() {
        None | Some("current") | Some("") => Ok(now_ms),
        Some(s) => parse_iso_ms(s),
    }
}

/// 解析get_replay的live_end
///
/// "none"表示没有实时段（等于live_start），"all"表示到现在为止；数值
/// 大于10^8按毫秒时间戳解释，否则按需要播放的秒数解释。
pub fn resolve_live_end(
    value: &serde_json::Value,
    live_start_ms: i64,
    now_ms: i64,
) -> Result<i64> {
    match value {
        serde_json::Value::String(s) => match s.as_str() {
            "none" => Ok(live_start_ms),
            "all" => Ok(now_ms),
            other => parse_iso_ms(other),
        },
        serde_json::Value::Number(n) => {
            let v = n.as_f64().unwrap_or(0.0);
            if v > LIVE_END_TIMESTAMP_THRESHOLD {
                Ok(v as i64)
            } else {
                Ok(live_start_ms + (v * 1000.0) as i64)
            }
        }
        _ => Err(AppError::DataError("bad live_end".to_string())),
    }
}

//=============================================================================
// 响应信封
//=============================================================================

/// 附加在每根推送bar上的人类可读时间，按会话时区格式化
pub fn format_date_time(ts_ms: i64, tz: &Tz) -> String {
    match Utc.timestamp_millis_opt(ts_ms).single() {
        Some(dt) => dt.with_timezone(tz).format("%Y-%m-%d %H:%M:%S").to_string(),
        None => String::new(),
    }
}

/// 构造data信封
pub fn data_msg(bar: &Bar, tz: &Tz) -> String {
    let mut value = serde_json::to_value(bar).unwrap_or_else(|_| json!({}));
    if let Some(obj) = value.as_object_mut() {
        obj.insert("mtyp".to_string(), json!("data"));
        obj.insert("dateTime".to_string(), json!(format_date_time(bar.ts, tz)));
    }
    value.to_string()
}

/// 构造ctrl信封
pub fn ctrl_msg(fields: serde_json::Value) -> String {
    let mut value = fields;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("mtyp".to_string(), json!("ctrl"));
    }
    value.to_string()
}

/// 构造error信封
pub fn error_msg(message: &str) -> String {
    json!({"mtyp": "error", "message": message}).to_string()
}

/// 构造strategy广播信封
pub fn strategy_msg(action: &str, fields: serde_json::Value) -> String {
    let mut value = fields;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("mtyp".to_string(), json!("strategy"));
        obj.insert("action".to_string(), json!(action));
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdcommon::models::BarSource;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn test_parse_get_data_request() {
        let text = r#"{
            "action": "get_data",
            "subscriptions": [{"instrument": "ES", "timeframe": "5m"}],
            "start_time": "2024-06-10T00:00:00Z",
            "end_time": "current",
            "live_data": "all",
            "sendto": "client",
            "timezone": "America/Chicago"
        }"#;
        let req = ClientRequest::parse(text).unwrap();
        let ClientRequest::GetData(data) = req else {
            panic!("expected get_data");
        };
        assert_eq!(data.subscriptions.len(), 1);
        assert!(data.use_cache && data.save_cache, "use_cache/save_cache默认true");
        assert!(matches!(data.live_data, LiveData::Mode(ref m) if m == "all"));
    }

    #[test]
    fn test_parse_rejects_unknown_action() {
        assert!(ClientRequest::parse(r#"{"action": "fly_to_moon"}"#).is_err());
        assert!(ClientRequest::parse("not json").is_err());
        // 缺少必填字段
        assert!(ClientRequest::parse(r#"{"action": "add_timeframe", "instrument": "ES"}"#).is_err());
    }

    #[test]
    fn test_resolve_data_range_defaults() {
        let (start, end, end_is_now) = resolve_data_range(&None, &None, NOW).unwrap();
        assert_eq!(end, NOW);
        assert!(end_is_now);
        assert_eq!(start, NOW - DEFAULT_WINDOW_DAYS * DAY_MS);

        let (_, end, end_is_now) =
            resolve_data_range(&None, &Some("current".to_string()), NOW).unwrap();
        assert_eq!(end, NOW);
        assert!(end_is_now);

        let (_, end, end_is_now) =
            resolve_data_range(&None, &Some("2024-06-10T12:00:00+00:00".to_string()), NOW)
                .unwrap();
        assert!(!end_is_now);
        assert_eq!(end, parse_iso_ms("2024-06-10T12:00:00Z").unwrap());
    }

    #[test]
    fn test_resolve_history_start_negative_minutes() {
        let v = json!(-90);
        assert_eq!(resolve_history_start(&v, NOW).unwrap(), NOW - 90 * MINUTE_MS);
        let v = json!("2024-06-10 00:00:00");
        assert_eq!(
            resolve_history_start(&v, NOW).unwrap(),
            parse_iso_ms("2024-06-10T00:00:00Z").unwrap()
        );
    }

    #[test]
    fn test_resolve_live_end_variants() {
        let ls = NOW - 10 * MINUTE_MS;
        assert_eq!(resolve_live_end(&json!("none"), ls, NOW).unwrap(), ls);
        assert_eq!(resolve_live_end(&json!("all"), ls, NOW).unwrap(), NOW);
        // 大于10^8按时间戳
        assert_eq!(
            resolve_live_end(&json!(1_700_000_300_000_i64), ls, NOW).unwrap(),
            1_700_000_300_000
        );
        // 小数值按播放秒数
        assert_eq!(resolve_live_end(&json!(120), ls, NOW).unwrap(), ls + 120_000);
    }

    #[test]
    fn test_data_msg_contains_envelope_fields() {
        let bar = Bar {
            ts: 1_718_100_000_000,
            open: Some(1.0),
            high: Some(2.0),
            low: Some(0.5),
            close: Some(1.5),
            volume: 3,
            instrument: "ES".to_string(),
            timeframe: "5m".to_string(),
            source: BarSource::Aggregated,
            is_closed: true,
        };
        let msg = data_msg(&bar, &chrono_tz::UTC);
        let value: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(value["mtyp"], "data");
        assert_eq!(value["source"], "A");
        assert_eq!(value["isClosed"], true);
        assert_eq!(value["timestamp"], 1_718_100_000_000_i64);
        assert!(value["dateTime"].as_str().unwrap().starts_with("2024-06-11"));
    }

    #[test]
    fn test_error_msg_shape() {
        let msg = error_msg("bad request");
        let value: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(value["mtyp"], "error");
        assert_eq!(value["message"], "bad request");
    }
}
