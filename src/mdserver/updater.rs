//! 实时蜡烛更新器
//!
//! 每个客户端、每个品种持有一根开放的1分钟蜡烛；每个已订阅的更高周期
//! 持有一根开放蜡烛。成交按到达顺序折叠，越过桶边界时翻转。更新器是
//! 纯状态机：由会话任务独占持有，产出要发送与要落盘的bar，自己不做IO。

use crate::mdcommon::models::{Bar, BarSource, SubscriptionKey, Trade};
use crate::mdcommon::timeframe::{bucket_start, MINUTE_MS};
use std::collections::HashMap;
use tracing::debug;

/// 应用一笔成交的产出
#[derive(Debug, Default)]
pub struct TradeOutcome {
    /// 按发送顺序排列的推送bar
    pub emits: Vec<Bar>,
    /// 翻转时关闭的非空1分钟蜡烛，需要落盘
    pub persist: Option<Bar>,
}

pub struct LiveUpdater {
    /// 品种 -> 开放的1分钟蜡烛
    open_1m: HashMap<String, Bar>,
    /// (品种,周期) -> (开放蜡烛, 周期毫秒)
    open_higher: HashMap<SubscriptionKey, (Bar, i64)>,
}

impl LiveUpdater {
    pub fn new() -> Self {
        Self {
            open_1m: HashMap::new(),
            open_higher: HashMap::new(),
        }
    }

    /// 订阅开始时初始化品种的开放1分钟蜡烛
    ///
    /// 开在最后一根已关闭1分钟bar之后（last_1m_end），OHLC为空、volume为0。
    pub fn init_1m(&mut self, instrument: &str, last_1m_end: i64) {
        self.open_1m
            .insert(instrument.to_string(), Bar::empty(instrument, "1m", last_1m_end));
    }

    /// 用仍然开放的最后一根聚合bar作为更高周期的开放蜡烛（续接，改打T标记）
    pub fn seed_higher(&mut self, instrument: &str, timeframe: &str, mut bar: Bar, interval: i64) {
        bar.source = BarSource::Trade;
        bar.is_closed = false;
        self.open_higher.insert(
            SubscriptionKey {
                instrument: instrument.to_string(),
                timeframe: timeframe.to_string(),
            },
            (bar, interval),
        );
    }

    /// 在包含下一个1分钟开始时间的桶上新建空的更高周期开放蜡烛
    pub fn init_higher_empty(
        &mut self,
        instrument: &str,
        timeframe: &str,
        interval: i64,
        next_1m_start: i64,
    ) {
        let ts = bucket_start(next_1m_start, interval);
        self.open_higher.insert(
            SubscriptionKey {
                instrument: instrument.to_string(),
                timeframe: timeframe.to_string(),
            },
            (Bar::empty(instrument, timeframe, ts), interval),
        );
    }

    /// 把当前开放的1分钟蜡烛折叠进某个更高周期蜡烛（若落在其桶内）
    ///
    /// add_timeframe初始化新周期时调用，让尚未关入任何1分钟bar的成交
    /// 不会丢在新蜡烛之外。
    pub fn fold_open_1m_into_higher(&mut self, instrument: &str, timeframe: &str) {
        let key = SubscriptionKey {
            instrument: instrument.to_string(),
            timeframe: timeframe.to_string(),
        };
        let Some(one_min) = self.open_1m.get(instrument) else {
            return;
        };
        if one_min.is_null() {
            return;
        }
        if let Some((higher, interval)) = self.open_higher.get_mut(&key) {
            if one_min.ts >= higher.ts && one_min.ts < higher.ts + *interval {
                higher.fold_bar(one_min);
            }
        }
    }

    pub fn remove_higher(&mut self, instrument: &str, timeframe: &str) {
        self.open_higher.remove(&SubscriptionKey {
            instrument: instrument.to_string(),
            timeframe: timeframe.to_string(),
        });
    }

    /// 移除品种的全部蜡烛（该品种最后一个周期退订时）
    pub fn remove_instrument(&mut self, instrument: &str) {
        self.open_1m.remove(instrument);
        self.open_higher.retain(|k, _| k.instrument != instrument);
    }

    pub fn open_1m_bar(&self, instrument: &str) -> Option<&Bar> {
        self.open_1m.get(instrument)
    }

    pub fn tracks(&self, instrument: &str) -> bool {
        self.open_1m.contains_key(instrument)
    }

    pub fn clear(&mut self) {
        self.open_1m.clear();
        self.open_higher.clear();
    }

    /// 应用一笔成交
    ///
    /// `emit_1m`表示客户端是否显式订阅了该品种的1分钟周期（1分钟蜡烛
    /// 始终被跟踪以便落盘，但只在订阅时推送）。
    pub fn apply_trade(&mut self, trade: &Trade, emit_1m: bool) -> TradeOutcome {
        let mut outcome = TradeOutcome::default();

        let Some(one_min) = self.open_1m.get_mut(&trade.instrument) else {
            return outcome;
        };

        // 1. 跟踪桶之前的迟到成交，忽略
        if trade.ts_ms < one_min.ts {
            debug!(target: "updater", "{}: 忽略迟到成交 ts={} < open1m={}", trade.instrument, trade.ts_ms, one_min.ts);
            return outcome;
        }

        // 2. 1分钟翻转
        if trade.ts_ms >= one_min.ts + MINUTE_MS {
            let mut closed = one_min.clone();
            closed.is_closed = true;
            if emit_1m {
                outcome.emits.push(closed.clone());
            }
            if !closed.is_null() {
                outcome.persist = Some(closed);
            }

            let new_ts = (trade.ts_ms / MINUTE_MS) * MINUTE_MS;
            *one_min = Bar::seeded(&trade.instrument, "1m", new_ts, trade.price, trade.size);
            if emit_1m {
                outcome.emits.push(one_min.clone());
            }
        } else {
            // 3. 折叠进当前1分钟蜡烛
            one_min.fold_trade(trade.price, trade.size);
            if emit_1m {
                outcome.emits.push(one_min.clone());
            }
        }

        // 4. 更高周期蜡烛
        for (key, (higher, interval)) in self.open_higher.iter_mut() {
            if key.instrument != trade.instrument {
                continue;
            }
            if trade.ts_ms >= higher.ts + *interval {
                higher.is_closed = true;
                outcome.emits.push(higher.clone());

                let new_ts = bucket_start(trade.ts_ms, *interval);
                *higher =
                    Bar::seeded(&trade.instrument, &key.timeframe, new_ts, trade.price, trade.size);
                outcome.emits.push(higher.clone());
            } else {
                higher.fold_trade(trade.price, trade.size);
                outcome.emits.push(higher.clone());
            }
        }

        outcome
    }
}

impl Default for LiveUpdater {
    fn default() -> Self {
        Self::new()
    }
}
