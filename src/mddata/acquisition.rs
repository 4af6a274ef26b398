//! 取数编排
//!
//! 给定(品种, [start,end])，组合缓存、历史通道与实时一次性拉取，返回
//! 连续的1分钟序列。缓存命中后只对超出容忍窗口的缺口发起补取：早侧
//! 3天、晚侧3小时；调用方显式给定终点时晚侧始终补取（显式终点优先于
//! 容忍窗口）。

use crate::mdcommon::config::constants::{EARLY_CUSHION_MS, LATE_CUSHION_MS};
use crate::mdcommon::error::Result;
use crate::mdcommon::models::Bar;
use crate::mdcommon::timeframe::MINUTE_MS;
use crate::mdcommon::BarCache;
use crate::mddata::history::HistoricalSource;
use crate::mddata::live::LiveBarSource;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 取数接口，会话层通过它请求1分钟序列，便于在测试中替换
pub trait BarAcquisition: Send + Sync {
    fn acquire_1m(
        &self,
        instrument: &str,
        start_ms: i64,
        end_ms: i64,
        end_is_now: bool,
        use_cache: bool,
        save_cache: bool,
    ) -> impl Future<Output = Result<Vec<Bar>>> + Send;
}

pub struct Acquisition<H, L> {
    cache: Arc<BarCache>,
    history: H,
    live: L,
}

impl<H, L> Acquisition<H, L>
where
    H: HistoricalSource + Send + Sync,
    L: LiveBarSource + Send + Sync,
{
    pub fn new(cache: Arc<BarCache>, history: H, live: L) -> Self {
        Self {
            cache,
            history,
            live,
        }
    }

    /// 异步落盘，写失败只记日志，不影响本次请求
    async fn save_bars(&self, bars: Vec<Bar>) {
        if bars.is_empty() {
            return;
        }
        let cache = self.cache.clone();
        let result =
            tokio::task::spawn_blocking(move || cache.insert_batch(&bars)).await;
        match result {
            Ok(Ok(count)) => debug!(target: "acquire", "已缓存 {} 条1分钟K线", count),
            Ok(Err(e)) => warn!(target: "acquire", "缓存写入失败（忽略）: {}", e),
            Err(e) => warn!(target: "acquire", "缓存写入任务失败（忽略）: {}", e),
        }
    }
}

impl<H, L> BarAcquisition for Acquisition<H, L>
where
    H: HistoricalSource + Send + Sync,
    L: LiveBarSource + Send + Sync,
{
    fn acquire_1m(
        &self,
        instrument: &str,
        start_ms: i64,
        end_ms: i64,
        end_is_now: bool,
        use_cache: bool,
        save_cache: bool,
    ) -> impl Future<Output = Result<Vec<Bar>>> + Send {
        let instrument = instrument.to_string();
        async move {
            // 1. 读缓存；读错误降级为空（后续会重新拉取）
            let cached = if use_cache {
                match self.cache.get_range(&instrument, "1m", start_ms, end_ms) {
                    Ok(bars) => bars,
                    Err(e) => {
                        warn!(target: "acquire", "{}: 缓存读取失败，降级为空: {}", instrument, e);
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };

            // 2. 缓存为空：整段走历史通道，这一步失败则整个调用失败
            if cached.is_empty() {
                debug!(target: "acquire", "{}: 缓存为空，整段历史拉取 [{}, {}]", instrument, start_ms, end_ms);
                let bars = self
                    .history
                    .fetch_historical(&instrument, start_ms, end_ms)
                    .await?;
                if save_cache {
                    self.save_bars(bars.clone()).await;
                }
                return Ok(bars);
            }

            let earliest = cached.first().map(|b| b.ts).unwrap_or(start_ms);
            let latest = cached.last().map(|b| b.ts).unwrap_or(end_ms);

            let mut merged: BTreeMap<i64, Bar> = BTreeMap::new();
            for bar in cached {
                merged.insert(bar.ts, bar);
            }

            // 3a. 早侧缺口：超过3天容忍窗口才补取，失败只影响这一段
            if start_ms < earliest && earliest - start_ms > EARLY_CUSHION_MS {
                match self
                    .history
                    .fetch_historical(&instrument, start_ms, earliest - MINUTE_MS)
                    .await
                {
                    Ok(bars) => {
                        info!(target: "acquire", "{}: 早侧补取 {} 条", instrument, bars.len());
                        if save_cache {
                            self.save_bars(bars.clone()).await;
                        }
                        for bar in bars {
                            merged.insert(bar.ts, bar);
                        }
                    }
                    Err(e) => warn!(target: "acquire", "{}: 早侧补取失败（忽略）: {}", instrument, e),
                }
            }

            // 3b. 晚侧缺口：显式终点始终补取；终点为"现在"时3小时内跳过
            if end_ms > latest {
                let fetch_late = !end_is_now || end_ms - latest > LATE_CUSHION_MS;
                if fetch_late {
                    match self
                        .history
                        .fetch_historical(&instrument, latest + MINUTE_MS, end_ms)
                        .await
                    {
                        Ok(bars) => {
                            info!(target: "acquire", "{}: 晚侧补取 {} 条", instrument, bars.len());
                            if save_cache {
                                self.save_bars(bars.clone()).await;
                            }
                            for bar in bars {
                                merged.insert(bar.ts, bar);
                            }
                        }
                        Err(e) => warn!(target: "acquire", "{}: 晚侧补取失败（忽略）: {}", instrument, e),
                    }
                }
            }

            // 4. 终点为"现在"时用实时一次性拉取补最近的尾部
            if end_is_now {
                let tail_start = merged
                    .keys()
                    .next_back()
                    .map(|&ts| ts + MINUTE_MS)
                    .unwrap_or(start_ms);
                if tail_start <= end_ms {
                    let symbols = vec![instrument.clone()];
                    match self.live.fetch_live_1m(&symbols, tail_start, end_ms).await {
                        Ok(bars) => {
                            debug!(target: "acquire", "{}: 实时尾部拉取 {} 条", instrument, bars.len());
                            if save_cache {
                                self.save_bars(bars.clone()).await;
                            }
                            for bar in bars {
                                merged.insert(bar.ts, bar);
                            }
                        }
                        Err(e) => warn!(target: "acquire", "{}: 实时尾部拉取失败（忽略）: {}", instrument, e),
                    }
                }
            }

            // 5. 按时间升序返回（BTreeMap已去重排序）
            Ok(merged.into_values().collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdcommon::db::open_db_pool;
    use crate::mdcommon::models::BarSource;
    use crate::mdcommon::{DAY_MS, HOUR_MS};
    use std::sync::Mutex;

    fn bar_1m(instrument: &str, ts: i64) -> Bar {
        Bar {
            ts,
            open: Some(100.0),
            high: Some(101.0),
            low: Some(99.0),
            close: Some(100.5),
            volume: 10,
            instrument: instrument.to_string(),
            timeframe: "1m".to_string(),
            source: BarSource::Historical,
            is_closed: true,
        }
    }

    struct MockHistory {
        calls: Mutex<Vec<(i64, i64)>>,
        fail: bool,
    }

    impl MockHistory {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: false,
            }
        }

        fn calls(&self) -> Vec<(i64, i64)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl HistoricalSource for &MockHistory {
        fn fetch_historical(
            &self,
            instrument: &str,
            start_ms: i64,
            end_ms: i64,
        ) -> impl Future<Output = Result<Vec<Bar>>> + Send {
            self.calls.lock().unwrap().push((start_ms, end_ms));
            let fail = self.fail;
            let instrument = instrument.to_string();
            async move {
                if fail {
                    return Err(crate::mdcommon::AppError::VendorError("down".to_string()));
                }
                // 每个整分钟一条
                let mut bars = Vec::new();
                let mut ts = (start_ms / MINUTE_MS) * MINUTE_MS;
                if ts < start_ms {
                    ts += MINUTE_MS;
                }
                while ts <= end_ms {
                    bars.push(bar_1m(&instrument, ts));
                    ts += MINUTE_MS;
                }
                Ok(bars)
            }
        }
    }

    struct MockLive {
        calls: Mutex<Vec<(i64, i64)>>,
    }

    impl MockLive {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(i64, i64)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl LiveBarSource for &MockLive {
        fn fetch_live_1m(
            &self,
            instruments: &[String],
            start_ms: i64,
            end_ms: i64,
        ) -> impl Future<Output = Result<Vec<Bar>>> + Send {
            self.calls.lock().unwrap().push((start_ms, end_ms));
            let instrument = instruments[0].clone();
            async move {
                // 起点所在分钟返回一根实时bar
                let ts = ((start_ms + MINUTE_MS - 1) / MINUTE_MS) * MINUTE_MS;
                if ts <= end_ms {
                    let mut bar = bar_1m(&instrument, ts);
                    bar.source = BarSource::Live;
                    Ok(vec![bar])
                } else {
                    Ok(vec![])
                }
            }
        }
    }

    fn seeded_cache(instrument: &str, from_ms: i64, to_ms: i64) -> Arc<BarCache> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bars.db");
        // 让TempDir活到进程结束，测试数据库随之清理
        std::mem::forget(dir);
        let cache = Arc::new(BarCache::new(open_db_pool(path).unwrap()).unwrap());
        let mut bars = Vec::new();
        let mut ts = from_ms;
        while ts <= to_ms {
            bars.push(bar_1m(instrument, ts));
            ts += MINUTE_MS;
        }
        cache.insert_batch(&bars).unwrap();
        cache
    }

    const T: i64 = 1_700_000_040_000; // 固定的"现在"，分钟对齐

    #[tokio::test]
    async fn test_empty_cache_full_historical_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let cache =
            Arc::new(BarCache::new(open_db_pool(dir.path().join("b.db")).unwrap()).unwrap());
        let history = MockHistory::new();
        let live = MockLive::new();
        let acq = Acquisition::new(cache, &history, &live);

        let start = T - 2 * HOUR_MS;
        let bars = acq.acquire_1m("ES", start, T, false, true, false).await.unwrap();

        assert_eq!(history.calls(), vec![(start, T)]);
        assert!(live.calls().is_empty());
        assert!(!bars.is_empty());
        assert!(bars.windows(2).all(|w| w[0].ts < w[1].ts));
    }

    #[tokio::test]
    async fn test_empty_cache_historical_failure_fails_call() {
        let dir = tempfile::tempdir().unwrap();
        let cache =
            Arc::new(BarCache::new(open_db_pool(dir.path().join("b.db")).unwrap()).unwrap());
        let mut history = MockHistory::new();
        history.fail = true;
        let live = MockLive::new();
        let acq = Acquisition::new(cache, &history, &live);

        let result = acq.acquire_1m("ES", T - HOUR_MS, T, false, true, false).await;
        assert!(result.is_err(), "缓存为空时顶层历史失败必须使调用失败");
    }

    #[tokio::test]
    async fn test_cushion_skip_both_sides_only_live_tail() {
        // S3: 缓存覆盖[T-2d, T-1h]，请求[T-2d-1h, T]到"现在"。
        // 早侧缺口1h < 3d，晚侧缺口1h < 3h，都不补取；唯一的上游调用是实时尾部。
        let cache = seeded_cache("ES", T - 2 * DAY_MS, T - HOUR_MS);
        let history = MockHistory::new();
        let live = MockLive::new();
        let acq = Acquisition::new(cache, &history, &live);

        let bars = acq
            .acquire_1m("ES", T - 2 * DAY_MS - HOUR_MS, T, true, true, false)
            .await
            .unwrap();

        assert!(history.calls().is_empty(), "容忍窗口内不应发起历史补取");
        assert_eq!(live.calls().len(), 1, "实时尾部拉取是唯一的上游调用");
        assert_eq!(live.calls()[0].0, T - HOUR_MS + MINUTE_MS);
        assert!(!bars.is_empty());
    }

    #[tokio::test]
    async fn test_early_refetch_beyond_cushion() {
        let cache = seeded_cache("ES", T - HOUR_MS, T - MINUTE_MS);
        let history = MockHistory::new();
        let live = MockLive::new();
        let acq = Acquisition::new(cache, &history, &live);

        let start = T - HOUR_MS - 4 * DAY_MS; // 早侧缺口4天 > 3天
        acq.acquire_1m("ES", start, T - MINUTE_MS, false, true, false)
            .await
            .unwrap();

        let calls = history.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (start, T - HOUR_MS - MINUTE_MS));
    }

    #[tokio::test]
    async fn test_explicit_end_overrides_late_cushion() {
        // 显式终点：即使缺口只有1小时（<3h），也要补取
        let cache = seeded_cache("ES", T - 3 * HOUR_MS, T - HOUR_MS);
        let history = MockHistory::new();
        let live = MockLive::new();
        let acq = Acquisition::new(cache, &history, &live);

        acq.acquire_1m("ES", T - 3 * HOUR_MS, T, false, true, false)
            .await
            .unwrap();

        let calls = history.calls();
        assert_eq!(calls.len(), 1, "显式终点优先于晚侧容忍窗口");
        assert_eq!(calls[0], (T - HOUR_MS + MINUTE_MS, T));
        assert!(live.calls().is_empty(), "非'现在'终点不触发实时尾部");
    }

    #[tokio::test]
    async fn test_late_refetch_beyond_cushion_when_end_is_now() {
        let cache = seeded_cache("ES", T - DAY_MS, T - 5 * HOUR_MS);
        let history = MockHistory::new();
        let live = MockLive::new();
        let acq = Acquisition::new(cache, &history, &live);

        let bars = acq
            .acquire_1m("ES", T - DAY_MS, T, true, true, false)
            .await
            .unwrap();

        let calls = history.calls();
        assert_eq!(calls.len(), 1, "晚侧缺口5小时 > 3小时，应补取");
        assert_eq!(calls[0], (T - 5 * HOUR_MS + MINUTE_MS, T));
        // 晚侧补取已经填到"现在"，尾部不再悬空，无需实时拉取
        assert!(live.calls().is_empty());
        // 序列升序且无重复
        assert!(bars.windows(2).all(|w| w[0].ts < w[1].ts));
    }
}
