use serde::{Deserialize, Serialize};

/// Bar数据来源标记 - 附加在发送时的元数据，不落盘
///
/// H=历史通道, L=实时1分钟流, C=缓存读出, A=由1分钟聚合, T=由逐笔成交构建
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarSource {
    #[serde(rename = "H")]
    Historical,
    #[serde(rename = "L")]
    Live,
    #[serde(rename = "C")]
    Cache,
    #[serde(rename = "A")]
    Aggregated,
    #[serde(rename = "T")]
    Trade,
}

/// OHLCV K线 - 内存与推送的统一表示
///
/// `ts` 是桶的开始时间（UTC毫秒）。开放蜡烛在收到第一笔成交前OHLC为None；
/// volume为0或任一OHLC为None的bar视为空bar，不会持久化。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    /// 桶开始时间戳（毫秒）
    #[serde(rename = "timestamp")]
    pub ts: i64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    /// 成交量（非负整数）
    pub volume: i64,
    pub instrument: String,
    pub timeframe: String,
    pub source: BarSource,
    #[serde(rename = "isClosed")]
    pub is_closed: bool,
}

impl Bar {
    /// 创建一个空的开放蜡烛（OHLC全为None，volume为0）
    pub fn empty(instrument: &str, timeframe: &str, ts: i64) -> Self {
        Self {
            ts,
            open: None,
            high: None,
            low: None,
            close: None,
            volume: 0,
            instrument: instrument.to_string(),
            timeframe: timeframe.to_string(),
            source: BarSource::Trade,
            is_closed: false,
        }
    }

    /// 空bar判定：volume为0或任一OHLC缺失
    pub fn is_null(&self) -> bool {
        self.volume == 0
            || self.open.is_none()
            || self.high.is_none()
            || self.low.is_none()
            || self.close.is_none()
    }

    /// 将一笔成交折叠进本蜡烛（不处理翻转，翻转由调用方判断）
    pub fn fold_trade(&mut self, price: f64, size: i64) {
        if self.open.is_none() {
            self.open = Some(price);
        }
        self.high = Some(self.high.map_or(price, |h| h.max(price)));
        self.low = Some(self.low.map_or(price, |l| l.min(price)));
        self.close = Some(price);
        self.volume += size;
        self.source = BarSource::Trade;
    }

    /// 用一笔成交作为种子新建开放蜡烛
    pub fn seeded(instrument: &str, timeframe: &str, ts: i64, price: f64, size: i64) -> Self {
        Self {
            ts,
            open: Some(price),
            high: Some(price),
            low: Some(price),
            close: Some(price),
            volume: size,
            instrument: instrument.to_string(),
            timeframe: timeframe.to_string(),
            source: BarSource::Trade,
            is_closed: false,
        }
    }

    /// 将一根已关闭的1分钟bar折叠进更高周期的开放蜡烛
    pub fn fold_bar(&mut self, c: &Bar) {
        if self.open.is_none() {
            self.open = c.open;
        }
        match (self.high, c.high) {
            (Some(h), Some(ch)) => self.high = Some(h.max(ch)),
            (None, Some(ch)) => self.high = Some(ch),
            _ => {}
        }
        match (self.low, c.low) {
            (Some(l), Some(cl)) => self.low = Some(l.min(cl)),
            (None, Some(cl)) => self.low = Some(cl),
            _ => {}
        }
        if c.close.is_some() {
            self.close = c.close;
        }
        self.volume += c.volume;
    }
}

/// 逐笔成交
///
/// 时间戳在一个会话内单调不减，但不保证严格单调。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// 成交时间戳（毫秒）
    pub ts_ms: i64,
    pub price: f64,
    pub size: i64,
    /// 'A' = 卖方主动, 'B' = 买方主动, 'N' = 未知
    pub side: char,
    pub instrument: String,
}

/// 订阅项：品种 × 周期
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub instrument: String,
    pub timeframe: String,
}
