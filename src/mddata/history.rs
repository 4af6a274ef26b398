//! 历史K线通道（HTTP请求/响应）
//!
//! 向供应商的历史服务请求1分钟OHLCV。供应商对超出可用范围的终点返回
//! 422并附带建议的`available_end`，这里将终点钳制后重试一次。

use crate::mdcommon::error::{AppError, Result};
use crate::mdcommon::models::{Bar, BarSource};
use reqwest::Client;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 历史数据源接口，便于在测试中替换
pub trait HistoricalSource {
    fn fetch_historical(
        &self,
        instrument: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> impl Future<Output = Result<Vec<Bar>>> + Send;
}

/// 供应商返回的单行K线
#[derive(Debug, Deserialize)]
struct RawBarRow {
    ts: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: i64,
}

/// 422响应体，带建议的可用终点
#[derive(Debug, Deserialize)]
struct RangeErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    available_end: Option<i64>,
}

/// 历史通道客户端
#[derive(Clone, Debug)]
pub struct HistoryClient {
    base_url: String,
    api_key: String,
    client: Client,
}

impl HistoryClient {
    pub fn new(base_url: String, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(AppError::HttpError)?;
        info!(target: "history", "初始化历史通道客户端, 端点: {}", base_url);
        Ok(Self {
            base_url,
            api_key,
            client,
        })
    }

    async fn request_range(
        &self,
        instrument: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<HistoryResponse> {
        let url = format!("{}/v0/timeseries/ohlcv-1m", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[
                ("instrument", instrument.to_string()),
                ("start", start_ms.to_string()),
                ("end", end_ms.to_string()),
            ])
            .send()
            .await
            .map_err(|e| {
                error!(target: "history", "{}: 历史请求失败: {}", instrument, e);
                AppError::HttpError(e)
            })?;

        let status = response.status();
        if status.as_u16() == 422 {
            let body = response.text().await.unwrap_or_default();
            let parsed: RangeErrorBody = serde_json::from_str(&body).unwrap_or(RangeErrorBody {
                message: body.clone(),
                available_end: None,
            });
            if let Some(available_end) = parsed.available_end {
                warn!(
                    target: "history",
                    "{}: 请求终点超出可用范围: {}，建议终点 {}",
                    instrument, parsed.message, available_end
                );
                return Ok(HistoryResponse::EndBeyondAvailability { available_end });
            }
            return Err(AppError::VendorError(format!(
                "historical 422 without available_end: {body}"
            )));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::VendorError(format!(
                "historical request failed: {status} - {body}"
            )));
        }

        // 空响应不是错误，返回空列表
        let rows: Vec<RawBarRow> = response.json().await.map_err(AppError::HttpError)?;
        Ok(HistoryResponse::Bars(rows))
    }
}

enum HistoryResponse {
    Bars(Vec<RawBarRow>),
    EndBeyondAvailability { available_end: i64 },
}

impl HistoricalSource for HistoryClient {
    /// 拉取[start_ms, end_ms]区间的1分钟历史K线
    ///
    /// 对422"终点超出可用范围"且带建议终点的响应，以钳制后的终点重试
    /// 一次；其他失败直接向上传递。
    fn fetch_historical(
        &self,
        instrument: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> impl Future<Output = Result<Vec<Bar>>> + Send {
        let instrument = instrument.to_string();
        async move {
            let rows = match self.request_range(&instrument, start_ms, end_ms).await? {
                HistoryResponse::Bars(rows) => rows,
                HistoryResponse::EndBeyondAvailability { available_end } => {
                    let clamped = available_end.min(end_ms);
                    info!(
                        target: "history",
                        "{}: 以钳制终点重试历史请求: {} -> {}",
                        instrument, end_ms, clamped
                    );
                    match self.request_range(&instrument, start_ms, clamped).await? {
                        HistoryResponse::Bars(rows) => rows,
                        // 重试只做一次，仍被拒绝则失败
                        HistoryResponse::EndBeyondAvailability { .. } => {
                            return Err(AppError::VendorError(
                                "historical end still beyond availability after clamp".to_string(),
                            ));
                        }
                    }
                }
            };

            debug!(target: "history", "{}: 收到 {} 条历史1分钟K线", instrument, rows.len());

            Ok(rows
                .into_iter()
                .map(|r| Bar {
                    ts: r.ts,
                    open: Some(r.open),
                    high: Some(r.high),
                    low: Some(r.low),
                    close: Some(r.close),
                    volume: r.volume,
                    instrument: instrument.clone(),
                    timeframe: "1m".to_string(),
                    source: BarSource::Historical,
                    is_closed: true,
                })
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_error_body_parses_available_end() {
        let body = r#"{"message": "end beyond availability", "available_end": 1718020800000}"#;
        let parsed: RangeErrorBody = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.available_end, Some(1_718_020_800_000));
        assert_eq!(parsed.message, "end beyond availability");
    }

    #[test]
    fn test_raw_row_maps_to_closed_historical_bar() {
        let row: RawBarRow = serde_json::from_str(
            r#"{"ts": 60000, "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5, "volume": 42}"#,
        )
        .unwrap();
        assert_eq!(row.ts, 60_000);
        assert_eq!(row.volume, 42);
    }
}
