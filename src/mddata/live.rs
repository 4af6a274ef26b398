//! 实时流通道（WebSocket）
//!
//! 供应商的持久流网关：挑战-应答鉴权后按schema订阅。1分钟OHLCV走
//! 一次性拉取（500ms静默超时后带数据返回），逐笔成交走常驻订阅，解析后
//! 的成交通过mpsc通道推给会话任务，不使用回调。
//!
//! 供应商对过早的起始时间回复"Invalid start time. Must be X or later"，
//! 这里解析X、关闭通道并以新起点重订阅，最多4次尝试。

use crate::mdcommon::config::constants::{LIVE_IDLE_TIMEOUT_MS, VENDOR_RETRY_CAP};
use crate::mdcommon::error::{AppError, Result};
use crate::mdcommon::models::{Bar, BarSource, Trade};
use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

//=============================================================================
// 常量和配置
//=============================================================================

/// 传输层连接重试配置
pub const MAX_CONNECT_ATTEMPTS: usize = 5;
pub const INITIAL_RETRY_DELAY_MS: u64 = 1000;
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// 鉴权与订阅握手的整体超时
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// 实时流日志目标
const LIVE_TARGET: &str = "live";

//=============================================================================
// 网关消息
//=============================================================================

/// 网关下行消息
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum GatewayMsg {
    #[serde(rename = "challenge")]
    Challenge { cram: String },
    #[serde(rename = "auth_ok")]
    AuthOk,
    #[serde(rename = "sub_ok")]
    SubOk,
    #[serde(rename = "error")]
    Error { message: String },
    /// 品种ID到符号的映射控制消息
    #[serde(rename = "symbol_map")]
    SymbolMap { id: u32, symbol: String },
    #[serde(rename = "bar")]
    BarRecord {
        id: u32,
        ts: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: i64,
    },
    #[serde(rename = "trade")]
    TradeRecord {
        id: u32,
        ts: i64,
        price: f64,
        size: i64,
        side: char,
    },
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(other)]
    Unknown,
}

/// 实时1分钟数据源接口，便于在测试中替换
pub trait LiveBarSource {
    fn fetch_live_1m(
        &self,
        instruments: &[String],
        start_ms: i64,
        end_ms: i64,
    ) -> impl Future<Output = Result<Vec<Bar>>> + Send;
}

/// 成交订阅接口，便于在测试中替换
pub trait TradeSubscriber: Send + Sync + 'static {
    fn subscribe_trades(
        &self,
        instruments: Vec<String>,
        start_ns: i64,
        trade_tx: mpsc::Sender<Trade>,
        ctrl_tx: mpsc::Sender<serde_json::Value>,
    ) -> impl Future<Output = Result<LiveTradeHandle>> + Send;
}

impl TradeSubscriber for LiveClient {
    fn subscribe_trades(
        &self,
        instruments: Vec<String>,
        start_ns: i64,
        trade_tx: mpsc::Sender<Trade>,
        ctrl_tx: mpsc::Sender<serde_json::Value>,
    ) -> impl Future<Output = Result<LiveTradeHandle>> + Send {
        LiveClient::subscribe_trades(self, instruments, start_ns, trade_tx, ctrl_tx)
    }
}

/// 常驻成交订阅的句柄，持有者负责在会话销毁时停止
pub struct LiveTradeHandle {
    task: tokio::task::JoinHandle<()>,
}

impl LiveTradeHandle {
    /// 从已经在运行的泵任务构造句柄
    pub fn from_task(task: tokio::task::JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for LiveTradeHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

//=============================================================================
// 工具函数
//=============================================================================

/// 计算鉴权应答：challenge|apiKey 的SHA-256十六进制，并附API密钥后5位
fn auth_reply(challenge: &str, api_key: &str) -> String {
    let digest = Sha256::digest(format!("{challenge}|{api_key}").as_bytes());
    let tail_start = api_key.len().saturating_sub(5);
    format!("{}-{}", hex::encode(digest), &api_key[tail_start..])
}

/// 从"Invalid start time. Must be X or later"中解析出X（UTC毫秒）
fn parse_invalid_start(message: &str) -> Option<i64> {
    if !message.contains("Invalid start time") {
        return None;
    }
    let idx = message.find("Must be ")? + "Must be ".len();
    let rest = &message[idx..];
    let end = rest.find(" or later").unwrap_or(rest.len());
    DateTime::parse_from_rfc3339(rest[..end].trim())
        .ok()
        .map(|dt| dt.timestamp_millis())
}

//=============================================================================
// 客户端
//=============================================================================

/// 订阅尝试的结果
enum SubscribeOutcome {
    /// 会话已就绪，附带已知的品种映射
    Ready(Box<WsStream>, HashMap<u32, String>),
    /// 起始时间被拒绝，带供应商建议的新起点
    RetryAt(i64),
}

/// 实时流网关客户端
#[derive(Clone, Debug)]
pub struct LiveClient {
    gateway_url: String,
    api_key: String,
}

impl LiveClient {
    pub fn new(gateway_url: String, api_key: String) -> Self {
        info!(target: LIVE_TARGET, "初始化实时流客户端, 网关: {}", gateway_url);
        Self {
            gateway_url,
            api_key,
        }
    }

    /// 建立传输层连接（带指数退避重试）
    async fn connect(&self) -> Result<WsStream> {
        let mut last_error: Option<AppError> = None;

        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            match connect_async(self.gateway_url.as_str()).await {
                Ok((ws, _)) => {
                    if attempt > 1 {
                        info!(target: LIVE_TARGET, "第{}次尝试后连接成功", attempt);
                    }
                    return Ok(ws);
                }
                Err(e) => {
                    last_error = Some(AppError::WsProtocolError(e));
                }
            }

            if attempt < MAX_CONNECT_ATTEMPTS {
                let delay_ms = std::cmp::min(
                    INITIAL_RETRY_DELAY_MS * 2_u64.pow((attempt - 1) as u32),
                    MAX_RETRY_DELAY_MS,
                );
                warn!(
                    target: LIVE_TARGET,
                    "连接第{}次尝试失败，{}ms后重试: {}",
                    attempt, delay_ms,
                    last_error.as_ref().map(|e| e.to_string()).unwrap_or_default()
                );
                sleep(Duration::from_millis(delay_ms)).await;
            }
        }

        Err(last_error
            .unwrap_or_else(|| AppError::WebSocketError("connect failed".to_string())))
    }

    /// 读取下一条网关消息，忽略Ping/Pong
    async fn next_msg(ws: &mut WsStream) -> Result<Option<GatewayMsg>> {
        loop {
            match ws.next().await {
                None => return Ok(None),
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(serde_json::from_str(&text)?));
                }
                Some(Ok(Message::Ping(data))) => {
                    ws.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(AppError::WsProtocolError(e)),
            }
        }
    }

    /// 鉴权：等待challenge，应答摘要，等待auth_ok
    ///
    /// 鉴权失败是协议错误，对本条流致命，不做重试。
    async fn authenticate(&self, ws: &mut WsStream) -> Result<()> {
        loop {
            match Self::next_msg(ws).await? {
                Some(GatewayMsg::Challenge { cram }) => {
                    let reply = auth_reply(&cram, &self.api_key);
                    ws.send(Message::Text(
                        json!({"type": "auth", "auth": reply}).to_string(),
                    ))
                    .await?;
                }
                Some(GatewayMsg::AuthOk) => {
                    debug!(target: LIVE_TARGET, "网关鉴权成功");
                    return Ok(());
                }
                Some(GatewayMsg::Error { message }) => {
                    error!(target: LIVE_TARGET, "网关鉴权失败: {}", message);
                    return Err(AppError::VendorError(format!("authentication failed: {message}")));
                }
                Some(_) => continue,
                None => {
                    return Err(AppError::WebSocketError(
                        "channel closed during authentication".to_string(),
                    ))
                }
            }
        }
    }

    /// 连接、鉴权并订阅一个schema
    ///
    /// 起始时间被拒绝时返回`RetryAt`，由调用方决定是否以新起点重试。
    async fn open_session(
        &self,
        schema: &str,
        instruments: &[String],
        start: i64,
    ) -> Result<SubscribeOutcome> {
        let mut ws = self.connect().await?;

        let handshake = async {
            self.authenticate(&mut ws).await?;

            ws.send(Message::Text(
                json!({
                    "type": "subscribe",
                    "schema": schema,
                    "symbols": instruments,
                    "start": start,
                })
                .to_string(),
            ))
            .await?;

            let mut id_to_symbol = HashMap::new();
            loop {
                match Self::next_msg(&mut ws).await? {
                    Some(GatewayMsg::SymbolMap { id, symbol }) => {
                        id_to_symbol.insert(id, symbol);
                    }
                    Some(GatewayMsg::SubOk) => {
                        // 启动会话后数据开始推送
                        ws.send(Message::Text(json!({"type": "start"}).to_string()))
                            .await?;
                        return Ok((id_to_symbol, None));
                    }
                    Some(GatewayMsg::Error { message }) => {
                        if let Some(new_start) = parse_invalid_start(&message) {
                            return Ok((id_to_symbol, Some(new_start)));
                        }
                        return Err(AppError::VendorError(format!("subscribe failed: {message}")));
                    }
                    Some(GatewayMsg::Heartbeat) => {
                        debug!(target: LIVE_TARGET, "收到心跳");
                    }
                    Some(_) => continue,
                    None => {
                        return Err(AppError::WebSocketError(
                            "channel closed during subscribe".to_string(),
                        ))
                    }
                }
            }
        };

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
            Ok(Ok((map, None))) => Ok(SubscribeOutcome::Ready(Box::new(ws), map)),
            Ok(Ok((_, Some(new_start)))) => {
                // 供应商拒绝了起始时间，关闭通道后由调用方重试
                let _ = ws.close(None).await;
                Ok(SubscribeOutcome::RetryAt(new_start))
            }
            Ok(Err(e)) => {
                let _ = ws.close(None).await;
                Err(e)
            }
            Err(_) => {
                let _ = ws.close(None).await;
                Err(AppError::WebSocketError(format!(
                    "handshake timed out after {}s",
                    HANDSHAKE_TIMEOUT.as_secs()
                )))
            }
        }
    }

    /// 带"Invalid start time"纠正重试的订阅，最多VENDOR_RETRY_CAP次尝试
    async fn open_session_with_retry(
        &self,
        schema: &str,
        instruments: &[String],
        start: i64,
    ) -> Result<(Box<WsStream>, HashMap<u32, String>)> {
        let mut start = start;
        for attempt in 1..=VENDOR_RETRY_CAP {
            match self.open_session(schema, instruments, start).await? {
                SubscribeOutcome::Ready(ws, map) => return Ok((ws, map)),
                SubscribeOutcome::RetryAt(new_start) => {
                    warn!(
                        target: LIVE_TARGET,
                        "起始时间被拒绝 (尝试 {}/{}), 以 {} 重新订阅",
                        attempt, VENDOR_RETRY_CAP, new_start
                    );
                    start = new_start;
                }
            }
        }
        Err(AppError::VendorError(format!(
            "subscribe rejected: invalid start time after {VENDOR_RETRY_CAP} attempts"
        )))
    }

    /// 将供应商符号映射回请求的品种名（大小写不敏感匹配，未匹配保留原名）
    fn map_to_requested(vendor_symbol: &str, requested: &[String]) -> String {
        requested
            .iter()
            .find(|s| s.eq_ignore_ascii_case(vendor_symbol))
            .cloned()
            .unwrap_or_else(|| vendor_symbol.to_string())
    }

    /// 订阅逐笔成交
    ///
    /// 成交经解析后推入`trade_tx`；心跳只记日志；其余控制消息推入
    /// `ctrl_tx`。返回的句柄用于在会话销毁时停止泵任务。
    pub async fn subscribe_trades(
        &self,
        instruments: Vec<String>,
        start_ns: i64,
        trade_tx: mpsc::Sender<Trade>,
        ctrl_tx: mpsc::Sender<serde_json::Value>,
    ) -> Result<LiveTradeHandle> {
        let (ws, id_to_symbol) = self
            .open_session_with_retry("trades", &instruments, start_ns)
            .await?;

        info!(target: LIVE_TARGET, "成交订阅已建立: {:?}", instruments);

        let task = tokio::spawn(run_trade_pump(
            *ws,
            id_to_symbol,
            instruments,
            trade_tx,
            ctrl_tx,
        ));

        Ok(LiveTradeHandle { task })
    }
}

impl LiveBarSource for LiveClient {
    /// 一次性拉取最近的1分钟K线
    ///
    /// 500ms没有新bar（或通道关闭）即完成，返回期间收到的全部bar，
    /// 可能为空。
    fn fetch_live_1m(
        &self,
        instruments: &[String],
        start_ms: i64,
        end_ms: i64,
    ) -> impl Future<Output = Result<Vec<Bar>>> + Send {
        let instruments = instruments.to_vec();
        async move {
            let (mut ws, mut id_to_symbol) = self
                .open_session_with_retry("ohlcv-1m", &instruments, start_ms)
                .await?;

            let mut bars: Vec<Bar> = Vec::new();
            let mut idle_deadline =
                Instant::now() + Duration::from_millis(LIVE_IDLE_TIMEOUT_MS);

            loop {
                tokio::select! {
                    _ = sleep_until(idle_deadline) => {
                        debug!(target: LIVE_TARGET, "实时1分钟拉取静默超时，返回 {} 条", bars.len());
                        break;
                    }
                    msg = ws.next() => match msg {
                        None => break,
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<GatewayMsg>(&text) {
                                Ok(GatewayMsg::BarRecord { id, ts, open, high, low, close, volume }) => {
                                    if ts <= end_ms {
                                        let symbol = id_to_symbol
                                            .get(&id)
                                            .map(|s| Self::map_to_requested(s, &instruments))
                                            .unwrap_or_default();
                                        if symbol.is_empty() {
                                            debug!(target: LIVE_TARGET, "收到未映射品种ID {} 的bar，忽略", id);
                                        } else {
                                            bars.push(Bar {
                                                ts,
                                                open: Some(open),
                                                high: Some(high),
                                                low: Some(low),
                                                close: Some(close),
                                                volume,
                                                instrument: symbol,
                                                timeframe: "1m".to_string(),
                                                source: BarSource::Live,
                                                is_closed: true,
                                            });
                                        }
                                    }
                                    idle_deadline = Instant::now()
                                        + Duration::from_millis(LIVE_IDLE_TIMEOUT_MS);
                                }
                                Ok(GatewayMsg::SymbolMap { id, symbol }) => {
                                    id_to_symbol.insert(id, symbol);
                                }
                                Ok(GatewayMsg::Heartbeat) => {
                                    debug!(target: LIVE_TARGET, "收到心跳");
                                }
                                Ok(GatewayMsg::Error { message }) => {
                                    warn!(target: LIVE_TARGET, "实时拉取期间网关报错: {}", message);
                                    break;
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    debug!(target: LIVE_TARGET, "忽略无法解析的消息: {}", e);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = ws.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(target: LIVE_TARGET, "实时拉取连接错误: {}", e);
                            break;
                        }
                    }
                }
            }

            let _ = ws.close().await;
            Ok(bars)
        }
    }
}

/// 成交泵任务：读取网关消息并转发
async fn run_trade_pump(
    mut ws: WsStream,
    mut id_to_symbol: HashMap<u32, String>,
    requested: Vec<String>,
    trade_tx: mpsc::Sender<Trade>,
    ctrl_tx: mpsc::Sender<serde_json::Value>,
) {
    loop {
        match ws.next().await {
            None => break,
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<GatewayMsg>(&text) {
                Ok(GatewayMsg::TradeRecord {
                    id,
                    ts,
                    price,
                    size,
                    side,
                }) => {
                    let Some(symbol) = id_to_symbol.get(&id) else {
                        debug!(target: LIVE_TARGET, "收到未映射品种ID {} 的成交，忽略", id);
                        continue;
                    };
                    let trade = Trade {
                        ts_ms: ts,
                        price,
                        size,
                        side,
                        instrument: LiveClient::map_to_requested(symbol, &requested),
                    };
                    if trade_tx.send(trade).await.is_err() {
                        // 会话侧已关闭，停止泵
                        break;
                    }
                }
                Ok(GatewayMsg::SymbolMap { id, symbol }) => {
                    id_to_symbol.insert(id, symbol);
                }
                Ok(GatewayMsg::Heartbeat) => {
                    debug!(target: LIVE_TARGET, "收到心跳");
                }
                Ok(GatewayMsg::Error { message }) => {
                    warn!(target: LIVE_TARGET, "成交流网关报错: {}", message);
                    let _ = ctrl_tx
                        .send(json!({"event": "stream_error", "message": message}))
                        .await;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(target: LIVE_TARGET, "忽略无法解析的消息: {}", e);
                }
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = ws.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) => {
                let _ = ctrl_tx.send(json!({"event": "stream_closed"})).await;
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(target: LIVE_TARGET, "成交流连接错误: {}", e);
                let _ = ctrl_tx
                    .send(json!({"event": "stream_error", "message": e.to_string()}))
                    .await;
                break;
            }
        }
    }
    let _ = ws.close(None).await;
    info!(target: LIVE_TARGET, "成交泵任务已退出");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_reply_digest_and_tail() {
        let reply = auth_reply("nonce123", "db-key-123-ABCDE");
        let expected_digest = hex::encode(Sha256::digest(b"nonce123|db-key-123-ABCDE"));
        assert_eq!(reply, format!("{expected_digest}-ABCDE"));
    }

    #[test]
    fn test_parse_invalid_start_message() {
        let msg = "Invalid start time. Must be 2024-06-10T12:00:00+00:00 or later";
        let ts = parse_invalid_start(msg).unwrap();
        let expected = DateTime::parse_from_rfc3339("2024-06-10T12:00:00+00:00")
            .unwrap()
            .timestamp_millis();
        assert_eq!(ts, expected);
    }

    #[test]
    fn test_parse_invalid_start_rejects_other_errors() {
        assert!(parse_invalid_start("authentication failed").is_none());
        assert!(parse_invalid_start("Invalid start time. Must be soon or later").is_none());
    }

    #[test]
    fn test_gateway_message_parsing() {
        let bar: GatewayMsg = serde_json::from_str(
            r#"{"type":"bar","id":7,"ts":60000,"open":1.0,"high":2.0,"low":0.5,"close":1.5,"volume":3}"#,
        )
        .unwrap();
        assert!(matches!(bar, GatewayMsg::BarRecord { id: 7, volume: 3, .. }));

        let trade: GatewayMsg = serde_json::from_str(
            r#"{"type":"trade","id":7,"ts":61000,"price":1.25,"size":2,"side":"B"}"#,
        )
        .unwrap();
        assert!(matches!(trade, GatewayMsg::TradeRecord { side: 'B', size: 2, .. }));

        let unknown: GatewayMsg = serde_json::from_str(r#"{"type":"stats"}"#).unwrap();
        assert!(matches!(unknown, GatewayMsg::Unknown));
    }

    #[test]
    fn test_map_to_requested_symbol() {
        let requested = vec!["ES".to_string(), "NQ".to_string()];
        assert_eq!(LiveClient::map_to_requested("es", &requested), "ES");
        assert_eq!(LiveClient::map_to_requested("CL", &requested), "CL");
    }
}
