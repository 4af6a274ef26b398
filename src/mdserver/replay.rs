//! 回放引擎
//!
//! 对预取好的1分钟序列做确定性回放。live_start之前的历史一次性推送；
//! 之后虚拟时钟T以1分钟为步长前进，由墙钟定时驱动，每个虚拟分钟对应
//! `replay_interval`毫秒。没有到期bar且后面还有bar时直接跳到下一根的
//! 时间（跳过缺口）。tick基于单调时刻表（到期时刻由上一次推算），避免
//! 固定间隔定时器的调度抖动积累；修改速度时从当前虚拟时间重新计算。

use crate::mdcommon::models::{Bar, BarSource, SubscriptionKey};
use crate::mdcommon::timeframe::{bucket_start, parse_timeframe, MINUTE_MS};
use crate::mddata::aggregator::aggregate_series;
use std::collections::{BTreeSet, HashMap};
use tokio::time::Instant;
use tracing::debug;

/// 一次tick的产出
#[derive(Debug, Default)]
pub struct ReplayTick {
    pub emits: Vec<Bar>,
    pub completed: bool,
}

pub struct ReplayState {
    /// 品种 -> 预取的1分钟序列（升序，覆盖[history_start, live_end]）
    series: HashMap<String, Vec<Bar>>,
    /// 品种 -> 下一根未发送bar的下标
    pos: HashMap<String, usize>,
    /// 回放期间的更高周期开放聚合槽
    aggregates: HashMap<SubscriptionKey, (Bar, i64)>,
    /// 品种 -> 订阅的周期集合
    subs: HashMap<String, BTreeSet<String>>,
    /// 虚拟时钟（毫秒）
    virtual_t: i64,
    live_start: i64,
    live_end: i64,
    /// 每虚拟分钟对应的墙钟毫秒
    pub interval_ms: u64,
    pub paused: bool,
    /// 下一次tick的到期时刻
    pub next_deadline: Instant,
}

impl ReplayState {
    pub fn new(
        subs: HashMap<String, BTreeSet<String>>,
        series: HashMap<String, Vec<Bar>>,
        live_start: i64,
        live_end: i64,
        interval_ms: u64,
    ) -> Self {
        let pos = series
            .iter()
            .map(|(inst, bars)| {
                let idx = bars.partition_point(|b| b.ts < live_start);
                (inst.clone(), idx)
            })
            .collect();

        Self {
            series,
            pos,
            aggregates: HashMap::new(),
            subs,
            virtual_t: live_start,
            live_start,
            live_end,
            interval_ms,
            paused: false,
            next_deadline: Instant::now() + std::time::Duration::from_millis(interval_ms),
        }
    }

    /// live_start之前的历史段：1分钟原样、更高周期聚合后全部按已关闭推送
    pub fn history_bars(&self) -> Vec<Bar> {
        let mut out = Vec::new();
        for (instrument, timeframes) in &self.subs {
            let Some(bars) = self.series.get(instrument) else {
                continue;
            };
            let history: Vec<Bar> = bars
                .iter()
                .filter(|b| b.ts < self.live_start)
                .cloned()
                .collect();
            if history.is_empty() {
                continue;
            }
            let (start, end) = (history[0].ts, history[history.len() - 1].ts);
            for tf in timeframes {
                if tf == "1m" {
                    out.extend(history.iter().cloned());
                } else if let Ok(mut aggregated) =
                    aggregate_series(instrument, tf, start, end, &history)
                {
                    for bar in &mut aggregated {
                        bar.is_closed = true;
                    }
                    out.extend(aggregated);
                }
            }
        }
        out
    }

    pub fn is_live_phase_empty(&self) -> bool {
        self.live_end <= self.live_start
    }

    /// 推进一个tick
    pub fn tick(&mut self) -> ReplayTick {
        let mut tick = ReplayTick::default();
        if self.virtual_t > self.live_end {
            tick.completed = true;
            return tick;
        }

        let mut emitted_any = false;

        let instruments: Vec<String> = self.subs.keys().cloned().collect();
        for instrument in &instruments {
            // 先取出到期的bar，再折叠，避免在遍历序列时改聚合槽
            let due: Vec<Bar> = {
                let Some(bars) = self.series.get(instrument) else {
                    continue;
                };
                let idx = self.pos.get(instrument).copied().unwrap_or(bars.len());
                let due: Vec<Bar> = bars[idx..]
                    .iter()
                    .take_while(|b| b.ts <= self.virtual_t && b.ts <= self.live_end)
                    .cloned()
                    .collect();
                self.pos.insert(instrument.clone(), idx + due.len());
                due
            };

            let emit_1m = self
                .subs
                .get(instrument)
                .map(|tfs| tfs.contains("1m"))
                .unwrap_or(false);

            for mut one_min in due {
                one_min.source = BarSource::Trade;
                one_min.is_closed = true;

                if emit_1m {
                    tick.emits.push(one_min.clone());
                }
                self.fold_into_aggregates(instrument, &one_min, &mut tick.emits);
                emitted_any = true;
            }
        }

        if !emitted_any {
            // 缺口跳跃：直接把虚拟时钟拨到最早的未来bar
            if let Some(earliest) = self.earliest_pending_ts() {
                debug!(target: "replay", "缺口跳跃: {} -> {}", self.virtual_t, earliest);
                self.virtual_t = earliest;
            } else {
                self.virtual_t += MINUTE_MS;
            }
        } else {
            self.virtual_t += MINUTE_MS;
        }

        if self.virtual_t > self.live_end {
            tick.completed = true;
        }
        tick
    }

    /// 把一根回放的1分钟bar折叠进该品种的全部更高周期聚合槽
    ///
    /// 新桶以该bar为种子开新槽；槽只在收到桶的末槽位bar时关闭并清空，
    /// 否则按开放状态推送。
    fn fold_into_aggregates(&mut self, instrument: &str, one_min: &Bar, emits: &mut Vec<Bar>) {
        let Some(timeframes) = self.subs.get(instrument) else {
            return;
        };
        for tf in timeframes {
            if tf == "1m" {
                continue;
            }
            let Ok(interval) = parse_timeframe(tf) else {
                continue;
            };
            let key = SubscriptionKey {
                instrument: instrument.to_string(),
                timeframe: tf.clone(),
            };
            let bucket = bucket_start(one_min.ts, interval);

            match self.aggregates.get_mut(&key) {
                Some((slot, _)) if slot.ts == bucket => {
                    slot.fold_bar(one_min);
                }
                _ => {
                    // 新桶：以这根1分钟bar为种子开新槽（旧槽位若存在，
                    // 已按开放状态推送过，直接替换）
                    let mut seeded = one_min.clone();
                    seeded.ts = bucket;
                    seeded.timeframe = tf.clone();
                    seeded.is_closed = false;
                    self.aggregates.insert(key.clone(), (seeded, interval));
                }
            }

            let terminal = one_min.ts == bucket + interval - MINUTE_MS;
            if terminal {
                if let Some((slot, _)) = self.aggregates.remove(&key) {
                    let mut closed = slot;
                    closed.is_closed = true;
                    emits.push(closed);
                }
            } else if let Some((slot, _)) = self.aggregates.get(&key) {
                emits.push(slot.clone());
            }
        }
    }

    fn earliest_pending_ts(&self) -> Option<i64> {
        self.subs
            .keys()
            .filter_map(|inst| {
                let bars = self.series.get(inst)?;
                let idx = self.pos.get(inst).copied()?;
                bars.get(idx).map(|b| b.ts).filter(|&ts| ts <= self.live_end)
            })
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdcommon::timeframe::HOUR_MS;

    const H9: i64 = 9 * HOUR_MS;

    fn c1m(ts: i64, v: i64) -> Bar {
        Bar {
            ts,
            open: Some(100.0),
            high: Some(101.0),
            low: Some(99.0),
            close: Some(100.5),
            volume: v,
            instrument: "ES".to_string(),
            timeframe: "1m".to_string(),
            source: BarSource::Cache,
            is_closed: true,
        }
    }

    fn make_state(bars: Vec<Bar>, live_start: i64, live_end: i64) -> ReplayState {
        let mut subs = HashMap::new();
        subs.insert(
            "ES".to_string(),
            ["1m".to_string(), "5m".to_string()].into_iter().collect::<BTreeSet<_>>(),
        );
        let mut series = HashMap::new();
        series.insert("ES".to_string(), bars);
        ReplayState::new(subs, series, live_start, live_end, 1000)
    }

    #[tokio::test]
    async fn test_history_bars_all_closed() {
        let bars: Vec<Bar> = (0..10).map(|i| c1m(H9 + i * MINUTE_MS, 1)).collect();
        let state = make_state(bars, H9 + 5 * MINUTE_MS, H9 + 9 * MINUTE_MS);

        let history = state.history_bars();
        // 1m五根 + 5m一根（部分桶也按已关闭推送）
        let ones: Vec<&Bar> = history.iter().filter(|b| b.timeframe == "1m").collect();
        let fives: Vec<&Bar> = history.iter().filter(|b| b.timeframe == "5m").collect();
        assert_eq!(ones.len(), 5);
        assert_eq!(fives.len(), 1);
        assert!(history.iter().all(|b| b.is_closed), "回放历史段全部按已关闭推送");
    }

    #[tokio::test]
    async fn test_tick_emits_due_bars_and_advances() {
        let bars: Vec<Bar> = (0..10).map(|i| c1m(H9 + i * MINUTE_MS, 1)).collect();
        let mut state = make_state(bars, H9, H9 + 9 * MINUTE_MS);

        let tick = state.tick();
        assert!(!tick.completed);
        let ones: Vec<&Bar> = tick.emits.iter().filter(|b| b.timeframe == "1m").collect();
        assert_eq!(ones.len(), 1);
        assert_eq!(ones[0].ts, H9);
        assert!(ones[0].is_closed);
        assert_eq!(ones[0].source, BarSource::Trade, "回放bar打T标记");

        // 更高周期按开放状态推送，直到末槽位
        let fives: Vec<&Bar> = tick.emits.iter().filter(|b| b.timeframe == "5m").collect();
        assert_eq!(fives.len(), 1);
        assert!(!fives[0].is_closed);
    }

    #[tokio::test]
    async fn test_higher_tf_closes_only_on_terminal_slot() {
        let bars: Vec<Bar> = (0..10).map(|i| c1m(H9 + i * MINUTE_MS, 1)).collect();
        let mut state = make_state(bars, H9, H9 + 9 * MINUTE_MS);

        let mut closed_fives = Vec::new();
        for _ in 0..10 {
            let tick = state.tick();
            closed_fives.extend(
                tick.emits
                    .iter()
                    .filter(|b| b.timeframe == "5m" && b.is_closed)
                    .cloned()
                    .collect::<Vec<_>>(),
            );
        }
        // 两个完整5m桶，各在末槽位(+4m, +9m)关闭一次
        assert_eq!(closed_fives.len(), 2);
        assert_eq!(closed_fives[0].ts, H9);
        assert_eq!(closed_fives[0].volume, 5);
        assert_eq!(closed_fives[1].ts, H9 + 5 * MINUTE_MS);
    }

    #[tokio::test]
    async fn test_gap_skip_jumps_virtual_clock() {
        // 缺口：H9和H9+30m两根
        let bars = vec![c1m(H9, 1), c1m(H9 + 30 * MINUTE_MS, 1)];
        let mut state = make_state(bars, H9, H9 + 30 * MINUTE_MS);

        let t1 = state.tick();
        assert_eq!(t1.emits.iter().filter(|b| b.timeframe == "1m").count(), 1);

        // 下一tick没有到期bar：虚拟时钟直接跳到30m处
        let t2 = state.tick();
        assert!(t2.emits.is_empty());
        assert_eq!(state.virtual_t, H9 + 30 * MINUTE_MS);

        let t3 = state.tick();
        assert_eq!(t3.emits.iter().filter(|b| b.timeframe == "1m").count(), 1);
        assert_eq!(t3.emits[0].ts, H9 + 30 * MINUTE_MS);
    }

    #[tokio::test]
    async fn test_completion_past_live_end() {
        let bars = vec![c1m(H9, 1), c1m(H9 + MINUTE_MS, 1)];
        let mut state = make_state(bars, H9, H9 + MINUTE_MS);

        let mut completed = false;
        for _ in 0..5 {
            let tick = state.tick();
            if tick.completed {
                completed = true;
                break;
            }
        }
        assert!(completed, "虚拟时钟越过live_end后必须报告完成");
    }
}
