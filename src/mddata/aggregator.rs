//! 1分钟序列到更高周期的聚合
//!
//! 按对齐桶折叠。输出bar的关闭判定：桶[B, B+I)被声明为已关闭，当且仅当
//! 输入中存在ts >= B+I的1分钟bar（后续活动已出现），或桶的末一个1分钟
//! 槽位B+I-60s本身在输入中。这样部分填充的最后一个桶保持"开放"，直到
//! 越过其终点的活动到来。

use crate::mdcommon::error::Result;
use crate::mdcommon::models::{Bar, BarSource};
use crate::mdcommon::timeframe::{bucket_start, parse_timeframe, MINUTE_MS};

/// 将按时间升序的1分钟序列聚合为目标周期的序列
///
/// `timeframe == "1m"`时只按区间过滤。输出按区间[start_ms, end_ms]过滤，
/// 来源标记为`A`。
pub fn aggregate_series(
    instrument: &str,
    timeframe: &str,
    start_ms: i64,
    end_ms: i64,
    series_1m: &[Bar],
) -> Result<Vec<Bar>> {
    if timeframe == "1m" {
        return Ok(series_1m
            .iter()
            .filter(|b| b.ts >= start_ms && b.ts <= end_ms)
            .cloned()
            .collect());
    }

    let interval = parse_timeframe(timeframe)?;
    let max_ts = match series_1m.last() {
        Some(bar) => bar.ts,
        None => return Ok(Vec::new()),
    };

    let close_rule = |bar_ts: i64, has_terminal: bool| -> bool {
        has_terminal || max_ts >= bar_ts + interval
    };

    let mut out: Vec<Bar> = Vec::new();
    // (进行中的输出bar, 是否已见到桶的末槽位)
    let mut open: Option<(Bar, bool)> = None;

    for c in series_1m {
        let bucket = bucket_start(c.ts, interval);
        let is_terminal_slot = c.ts == bucket + interval - MINUTE_MS;

        match open {
            Some((ref mut bar, ref mut has_terminal)) if bar.ts == bucket => {
                bar.fold_bar(c);
                if is_terminal_slot {
                    *has_terminal = true;
                }
            }
            _ => {
                if let Some((mut prev, has_terminal)) = open.take() {
                    prev.is_closed = close_rule(prev.ts, has_terminal);
                    out.push(prev);
                }
                let bar = Bar {
                    ts: bucket,
                    open: c.open,
                    high: c.high,
                    low: c.low,
                    close: c.close,
                    volume: c.volume,
                    instrument: instrument.to_string(),
                    timeframe: timeframe.to_string(),
                    source: BarSource::Aggregated,
                    is_closed: false,
                };
                open = Some((bar, is_terminal_slot));
            }
        }
    }

    if let Some((mut prev, has_terminal)) = open.take() {
        prev.is_closed = close_rule(prev.ts, has_terminal);
        out.push(prev);
    }

    out.retain(|b| b.ts >= start_ms && b.ts <= end_ms);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdcommon::timeframe::HOUR_MS;

    fn c1m(ts: i64, o: f64, h: f64, l: f64, c: f64, v: i64) -> Bar {
        Bar {
            ts,
            open: Some(o),
            high: Some(h),
            low: Some(l),
            close: Some(c),
            volume: v,
            instrument: "ES".to_string(),
            timeframe: "1m".to_string(),
            source: BarSource::Historical,
            is_closed: true,
        }
    }

    // 09:00 UTC，5分钟对齐
    const H9: i64 = 9 * HOUR_MS;

    #[test]
    fn test_partial_last_bucket_stays_open() {
        // S1: 09:00..09:03四根相同bar，无09:04末槽位，无后续bar -> 单根开放5m
        let series: Vec<Bar> = (0..4)
            .map(|i| c1m(H9 + i * MINUTE_MS, 100.0, 101.0, 99.0, 100.0, 10))
            .collect();

        let out = aggregate_series("ES", "5m", H9, H9 + 3 * MINUTE_MS, &series).unwrap();
        assert_eq!(out.len(), 1);
        let bar = &out[0];
        assert_eq!(bar.ts, H9);
        assert_eq!(bar.open, Some(100.0));
        assert_eq!(bar.high, Some(101.0));
        assert_eq!(bar.low, Some(99.0));
        assert_eq!(bar.close, Some(100.0));
        assert_eq!(bar.volume, 40);
        assert!(!bar.is_closed, "缺少末槽位且无后续活动时保持开放");
        assert_eq!(bar.source, BarSource::Aggregated);
    }

    #[test]
    fn test_terminal_slot_closes_bucket() {
        // S2: 补上09:04末槽位 -> 单根已关闭5m
        let mut series: Vec<Bar> = (0..4)
            .map(|i| c1m(H9 + i * MINUTE_MS, 100.0, 101.0, 99.0, 100.0, 10))
            .collect();
        series.push(c1m(H9 + 4 * MINUTE_MS, 101.0, 102.0, 100.0, 101.0, 5));

        let out = aggregate_series("ES", "5m", H9, H9 + 4 * MINUTE_MS, &series).unwrap();
        assert_eq!(out.len(), 1);
        let bar = &out[0];
        assert_eq!(bar.open, Some(100.0));
        assert_eq!(bar.high, Some(102.0));
        assert_eq!(bar.low, Some(99.0));
        assert_eq!(bar.close, Some(101.0));
        assert_eq!(bar.volume, 45);
        assert!(bar.is_closed);
    }

    #[test]
    fn test_later_activity_closes_gappy_bucket() {
        // 第一个桶缺09:04末槽位，但存在ts >= B+I的后续bar -> 仍判定关闭
        let series = vec![
            c1m(H9, 100.0, 101.0, 99.0, 100.0, 10),
            c1m(H9 + MINUTE_MS, 100.0, 103.0, 100.0, 102.0, 8),
            c1m(H9 + 6 * MINUTE_MS, 102.0, 104.0, 101.0, 103.0, 6),
        ];

        let out = aggregate_series("ES", "5m", H9, H9 + 10 * MINUTE_MS, &series).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].is_closed, "后续活动存在即关闭");
        assert_eq!(out[0].volume, 18);
        assert!(!out[1].is_closed, "最后一个部分桶保持开放");
        assert_eq!(out[1].ts, H9 + 5 * MINUTE_MS);
    }

    #[test]
    fn test_gapless_aggregation_correctness() {
        // 无缺口输入下的OHLCV正确性：open取首槽，close取末槽，high/low取极值，volume求和
        let series: Vec<Bar> = (0..10)
            .map(|i| {
                c1m(
                    H9 + i * MINUTE_MS,
                    100.0 + i as f64,
                    101.0 + i as f64,
                    99.0 + i as f64,
                    100.5 + i as f64,
                    10 + i,
                )
            })
            .collect();

        let out = aggregate_series("ES", "5m", H9, H9 + 9 * MINUTE_MS, &series).unwrap();
        assert_eq!(out.len(), 2);

        for (k, bar) in out.iter().enumerate() {
            let base = (k * 5) as i64;
            assert_eq!(bar.ts, H9 + base * MINUTE_MS);
            assert_eq!(bar.open, Some(100.0 + base as f64));
            assert_eq!(bar.close, Some(100.5 + (base + 4) as f64));
            assert_eq!(bar.high, Some(101.0 + (base + 4) as f64));
            assert_eq!(bar.low, Some(99.0 + base as f64));
            assert_eq!(bar.volume, (0..5).map(|j| 10 + base + j).sum::<i64>());
        }
        assert!(out[0].is_closed);
        assert!(out[1].is_closed, "末槽位在输入中，最后一个桶也关闭");
    }

    #[test]
    fn test_one_minute_passthrough_filters_range() {
        let series: Vec<Bar> = (0..5)
            .map(|i| c1m(H9 + i * MINUTE_MS, 100.0, 101.0, 99.0, 100.0, 10))
            .collect();
        let out =
            aggregate_series("ES", "1m", H9 + MINUTE_MS, H9 + 3 * MINUTE_MS, &series).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].ts, H9 + MINUTE_MS);
        assert_eq!(out[2].ts, H9 + 3 * MINUTE_MS);
    }

    #[test]
    fn test_invalid_timeframe_fails() {
        assert!(aggregate_series("ES", "5x", 0, 1, &[]).is_err());
    }

    #[test]
    fn test_session_aligned_4h_buckets() {
        // 2024-06-11 22:00 UTC = 18:00 EDT，会话开始。4h桶应从22:00 UTC切分。
        let session = 1_718_143_200_000; // 2024-06-11T22:00:00Z
        let series: Vec<Bar> = (0..300)
            .map(|i| c1m(session + i * MINUTE_MS, 100.0, 101.0, 99.0, 100.0, 1))
            .collect();

        let out = aggregate_series("ES", "4h", session, session + 300 * MINUTE_MS, &series)
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].ts, session);
        assert_eq!(out[0].volume, 240);
        assert!(out[0].is_closed);
        assert_eq!(out[1].ts, session + 4 * HOUR_MS);
        assert_eq!(out[1].volume, 60);
        assert!(!out[1].is_closed);
    }
}
