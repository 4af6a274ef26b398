//! 按客户端的会话状态机
//!
//! 每个客户端一个任务，独占持有订阅表、开放蜡烛、成交FIFO与输出端，
//! 会话内部单线程：所有变更都经由事件通道进入，成交折叠与周期变更之间
//! 不需要加锁。
//!
//! 周期变更期间的成交串行化是这里最要紧的不变式：处于
//! `ChangingTimeframes`时到达的成交进入FIFO，新周期的历史推送完成、
//! 开放蜡烛初始化之后按原顺序排空，之后才处理新的成交。没有成交会被
//! 应用到旧的订阅表上，也没有成交被丢弃。

use crate::mdcommon::models::{Bar, Trade};
use crate::mdcommon::timeframe::{parse_timeframe, MINUTE_MS};
use crate::mdcommon::{AncillaryStore, Annotation, BarCache, Strategy};
use crate::mddata::acquisition::BarAcquisition;
use crate::mddata::aggregator::aggregate_series;
use crate::mddata::live::{LiveTradeHandle, TradeSubscriber};
use crate::mdserver::messages::{
    ctrl_msg, data_msg, error_msg, resolve_data_range, resolve_history_start, resolve_live_end,
    resolve_live_start, strategy_msg, ClientRequest, GetDataReq, GetReplayReq, LiveData,
};
use crate::mdserver::replay::ReplayState;
use crate::mdserver::sink::OutputSink;
use crate::mdserver::updater::LiveUpdater;
use chrono_tz::Tz;
use dashmap::DashMap;
use serde_json::json;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::pending;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    LiveActive,
    ReplayActive,
    ChangingTimeframes,
}

/// 进入会话任务的事件
#[derive(Debug)]
pub enum SessionEvent {
    /// 客户端请求帧
    Request(ClientRequest),
    /// 成交流送来的一笔成交
    Trade(Trade),
    /// 成交流的控制消息
    StreamControl(serde_json::Value),
    /// add_timeframe的取数结果
    TimeframeReady {
        instrument: String,
        timeframe: String,
        result: crate::mdcommon::Result<Vec<Bar>>,
    },
    /// 客户端断开
    Disconnected,
}

/// 会话共享依赖
pub struct SessionCtx<A, T> {
    pub acquisition: Arc<A>,
    pub trade_sub: Arc<T>,
    pub cache: Arc<BarCache>,
    pub store: Arc<AncillaryStore>,
    /// 已连接客户端注册表（client_id -> 出站通道），策略广播按发送时查询
    pub clients: Arc<DashMap<String, mpsc::Sender<String>>>,
}

impl<A, T> Clone for SessionCtx<A, T> {
    fn clone(&self) -> Self {
        Self {
            acquisition: self.acquisition.clone(),
            trade_sub: self.trade_sub.clone(),
            cache: self.cache.clone(),
            store: self.store.clone(),
            clients: self.clients.clone(),
        }
    }
}

enum LiveMode {
    None,
    All,
    Seconds(f64),
}

pub struct Session<A, T> {
    ctx: SessionCtx<A, T>,
    client_id: String,
    registered: bool,
    phase: SessionPhase,
    /// 品种 -> 订阅的周期集合
    subs: HashMap<String, BTreeSet<String>>,
    /// get_data的起始时间，add_timeframe取数复用
    original_start: i64,
    use_cache: bool,
    save_cache: bool,
    tz: Tz,
    sink: OutputSink,
    /// 错误与控制消息始终走客户端通道
    client_tx: mpsc::Sender<String>,
    self_tx: mpsc::Sender<SessionEvent>,
    updater: LiveUpdater,
    trade_queue: VecDeque<Trade>,
    trade_stream: Option<LiveTradeHandle>,
    /// 限时live_data的到期时刻
    live_deadline: Option<Instant>,
    replay: Option<ReplayState>,
    /// 正在进行的周期变更 (品种, 周期)
    pending_change: Option<(String, String)>,
}

impl<A, T> Session<A, T>
where
    A: BarAcquisition + 'static,
    T: TradeSubscriber,
{
    pub fn new(
        ctx: SessionCtx<A, T>,
        client_tx: mpsc::Sender<String>,
        self_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let client_id = format!("anon-{}", NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            ctx,
            client_id,
            registered: false,
            phase: SessionPhase::Idle,
            subs: HashMap::new(),
            original_start: 0,
            use_cache: true,
            save_cache: true,
            tz: chrono_tz::UTC,
            sink: OutputSink::Client(client_tx.clone()),
            client_tx,
            self_tx,
            updater: LiveUpdater::new(),
            trade_queue: VecDeque::new(),
            trade_stream: None,
            live_deadline: None,
            replay: None,
            pending_change: None,
        }
    }

    /// 会话主循环，返回即销毁
    pub async fn run(mut self, mut rx: mpsc::Receiver<SessionEvent>) {
        info!(target: "session", client_id = %self.client_id, "会话已创建");

        loop {
            let replay_deadline = self
                .replay
                .as_ref()
                .filter(|r| !r.paused)
                .map(|r| r.next_deadline);
            let live_deadline = self.live_deadline;

            tokio::select! {
                ev = rx.recv() => match ev {
                    Some(SessionEvent::Request(req)) => self.handle_request(req).await,
                    Some(SessionEvent::Trade(trade)) => self.handle_trade(trade).await,
                    Some(SessionEvent::StreamControl(value)) => {
                        self.handle_stream_control(value).await;
                    }
                    Some(SessionEvent::TimeframeReady { instrument, timeframe, result }) => {
                        self.finish_add_timeframe(instrument, timeframe, result).await;
                    }
                    Some(SessionEvent::Disconnected) | None => break,
                },
                _ = maybe_sleep(replay_deadline) => self.on_replay_tick().await,
                _ = maybe_sleep(live_deadline) => self.on_live_timer_expired().await,
            }
        }

        self.teardown();
        info!(target: "session", client_id = %self.client_id, "会话已销毁");
    }

    //=========================================================================
    // 请求分发（状态机事件表）
    //=========================================================================

    async fn handle_request(&mut self, req: ClientRequest) {
        match req {
            ClientRequest::SetClientId { clientid } => self.set_client_id(clientid).await,
            ClientRequest::GetData(data) => self.handle_get_data(data).await,
            ClientRequest::AddTimeframe {
                instrument,
                timeframe,
            } => self.handle_add_timeframe(instrument, timeframe).await,
            ClientRequest::RemoveTimeframe {
                instrument,
                timeframe,
            } => self.handle_remove_timeframe(instrument, timeframe).await,
            ClientRequest::StopData => self.handle_stop_data().await,
            ClientRequest::GetReplay(replay) => self.handle_get_replay(replay).await,
            ClientRequest::ModifyReplay {
                pause,
                replay_interval,
            } => self.handle_modify_replay(pause, replay_interval).await,
            ClientRequest::StopReplay => self.handle_stop_replay().await,
            other => self.handle_store_request(other).await,
        }
    }

    async fn set_client_id(&mut self, clientid: String) {
        if self.registered {
            self.ctx.clients.remove(&self.client_id);
        }
        self.client_id = clientid;
        self.ctx
            .clients
            .insert(self.client_id.clone(), self.client_tx.clone());
        self.registered = true;
        self.send_ctrl(json!({"event": "client_id_set", "clientid": self.client_id}))
            .await;
    }

    //=========================================================================
    // get_data / 实时订阅
    //=========================================================================

    async fn handle_get_data(&mut self, req: GetDataReq) {
        match self.phase {
            SessionPhase::ReplayActive | SessionPhase::ChangingTimeframes => {
                self.send_error("get_data rejected in current state").await;
                return;
            }
            SessionPhase::LiveActive => {
                // 重启：先停掉当前实时侧
                self.stop_live();
            }
            SessionPhase::Idle => {}
        }

        let live_mode = match parse_live_mode(&req.live_data) {
            Ok(mode) => mode,
            Err(msg) => {
                self.send_error(&msg).await;
                return;
            }
        };

        // 校验订阅与时区
        if req.subscriptions.is_empty() {
            self.send_error("subscriptions must not be empty").await;
            return;
        }
        let mut subs: HashMap<String, BTreeSet<String>> = HashMap::new();
        for sub in &req.subscriptions {
            if let Err(e) = parse_timeframe(&sub.timeframe) {
                self.send_error(&e.to_string()).await;
                return;
            }
            subs.entry(sub.instrument.clone())
                .or_default()
                .insert(sub.timeframe.clone());
        }
        let tz = match req.timezone.as_deref() {
            None => chrono_tz::UTC,
            Some(name) => match Tz::from_str(name) {
                Ok(tz) => tz,
                Err(_) => {
                    self.send_error(&format!("unknown timezone: {name}")).await;
                    return;
                }
            },
        };

        let now_ms = chrono::Utc::now().timestamp_millis();
        let (start_ms, end_ms, end_is_now) =
            match resolve_data_range(&req.start_time, &req.end_time, now_ms) {
                Ok(range) => range,
                Err(e) => {
                    self.send_error(&e.to_string()).await;
                    return;
                }
            };

        self.sink.flush();
        self.sink = match OutputSink::for_sendto(
            req.sendto.as_deref(),
            &self.client_tx,
            &self.client_id,
        ) {
            Ok(sink) => sink,
            Err(e) => {
                self.send_error(&format!("cannot open sink: {e}")).await;
                return;
            }
        };
        self.tz = tz;
        self.subs = subs;
        self.original_start = start_ms;
        self.use_cache = req.use_cache;
        self.save_cache = req.save_cache;

        // 历史段：每个品种取一次1分钟序列，再按订阅周期聚合推送
        let mut last_1m_end: HashMap<String, i64> = HashMap::new();
        let mut open_seeds: Vec<(String, String, Option<Bar>)> = Vec::new();

        let instruments: Vec<String> = self.subs.keys().cloned().collect();
        for instrument in &instruments {
            let series = match self
                .ctx
                .acquisition
                .acquire_1m(
                    instrument,
                    start_ms,
                    end_ms,
                    end_is_now,
                    self.use_cache,
                    self.save_cache,
                )
                .await
            {
                Ok(series) => series,
                Err(e) => {
                    // 单品种失败只影响自己，不拖垮整个请求
                    error!(target: "session", client_id = %self.client_id, "{}: 取数失败: {}", instrument, e);
                    self.send_error(&format!("{instrument}: {e}")).await;
                    continue;
                }
            };

            let tfs = self.subs.get(instrument).cloned().unwrap_or_default();
            for tf in &tfs {
                match aggregate_series(instrument, tf, start_ms, end_ms, &series) {
                    Ok(bars) => {
                        let seed = bars.last().filter(|b| !b.is_closed).cloned();
                        for bar in &bars {
                            self.emit_bar(bar).await;
                        }
                        if tf != "1m" {
                            open_seeds.push((instrument.clone(), tf.clone(), seed));
                        }
                    }
                    Err(e) => {
                        self.send_error(&format!("{instrument}/{tf}: {e}")).await;
                    }
                }
            }

            let next_1m = series
                .last()
                .map(|b| b.ts + MINUTE_MS)
                .unwrap_or_else(|| (now_ms / MINUTE_MS) * MINUTE_MS);
            last_1m_end.insert(instrument.clone(), next_1m);
        }

        self.send_ctrl(json!({"event": "data_complete"})).await;

        if matches!(live_mode, LiveMode::None) {
            self.phase = SessionPhase::Idle;
            return;
        }

        // 实时侧初始化：开放1分钟蜡烛 + 每个更高周期的开放蜡烛
        let now_floor = (now_ms / MINUTE_MS) * MINUTE_MS;
        for instrument in &instruments {
            let next_1m = last_1m_end.get(instrument).copied().unwrap_or(now_floor);
            self.updater.init_1m(instrument, next_1m);
        }
        for (instrument, tf, seed) in open_seeds {
            let Ok(interval) = parse_timeframe(&tf) else {
                continue;
            };
            match seed {
                Some(bar) => self.updater.seed_higher(&instrument, &tf, bar, interval),
                None => {
                    let next_1m = last_1m_end
                        .get(&instrument)
                        .copied()
                        .unwrap_or(now_floor);
                    self.updater
                        .init_higher_empty(&instrument, &tf, interval, next_1m);
                }
            }
        }

        // 成交订阅：解析后的成交经通道进入会话事件循环
        let start_ns = last_1m_end.values().min().copied().unwrap_or(now_floor) * 1_000_000;
        match self.start_trade_stream(instruments.clone(), start_ns).await {
            Ok(handle) => {
                self.trade_stream = Some(handle);
                self.phase = SessionPhase::LiveActive;
                if let LiveMode::Seconds(secs) = live_mode {
                    self.live_deadline = Some(Instant::now() + Duration::from_secs_f64(secs));
                }
                self.send_ctrl(json!({"event": "live_started", "instruments": instruments}))
                    .await;
            }
            Err(e) => {
                error!(target: "session", client_id = %self.client_id, "成交订阅失败: {}", e);
                self.send_error(&format!("live subscription failed: {e}")).await;
                self.updater.clear();
                self.phase = SessionPhase::Idle;
            }
        }
    }

    async fn start_trade_stream(
        &mut self,
        instruments: Vec<String>,
        start_ns: i64,
    ) -> crate::mdcommon::Result<LiveTradeHandle> {
        let (trade_tx, mut trade_rx) = mpsc::channel::<Trade>(1024);
        let (ctrl_tx, mut ctrl_rx) = mpsc::channel::<serde_json::Value>(16);

        // 成交与控制消息转成会话事件，保持到达顺序
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            while let Some(trade) = trade_rx.recv().await {
                if self_tx.send(SessionEvent::Trade(trade)).await.is_err() {
                    break;
                }
            }
        });
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            while let Some(value) = ctrl_rx.recv().await {
                if self_tx.send(SessionEvent::StreamControl(value)).await.is_err() {
                    break;
                }
            }
        });

        self.ctx
            .trade_sub
            .subscribe_trades(instruments, start_ns, trade_tx, ctrl_tx)
            .await
    }

    /// 停止实时侧：流、定时器、开放蜡烛、FIFO
    fn stop_live(&mut self) {
        if let Some(handle) = self.trade_stream.take() {
            handle.stop();
        }
        self.live_deadline = None;
        self.updater.clear();
        self.trade_queue.clear();
        self.pending_change = None;
        self.phase = SessionPhase::Idle;
    }

    async fn handle_stop_data(&mut self) {
        match self.phase {
            SessionPhase::LiveActive | SessionPhase::ChangingTimeframes => {
                self.stop_live();
                self.send_ctrl(json!({"event": "live_stopped"})).await;
            }
            _ => {}
        }
    }

    async fn on_live_timer_expired(&mut self) {
        info!(target: "session", client_id = %self.client_id, "限时实时订阅到期");
        self.stop_live();
        self.send_ctrl(json!({"event": "live_expired"})).await;
    }

    //=========================================================================
    // 成交处理与周期变更
    //=========================================================================

    async fn handle_trade(&mut self, trade: Trade) {
        match self.phase {
            SessionPhase::ChangingTimeframes => {
                // 变更窗口内的成交全部排队，不应用到旧订阅表
                self.trade_queue.push_back(trade);
            }
            SessionPhase::LiveActive => {
                self.apply_trade(trade).await;
            }
            _ => {
                debug!(target: "session", client_id = %self.client_id, "非实时状态下丢弃成交");
            }
        }
    }

    async fn apply_trade(&mut self, trade: Trade) {
        if !self.updater.tracks(&trade.instrument) {
            return;
        }
        let emit_1m = self
            .subs
            .get(&trade.instrument)
            .map(|tfs| tfs.contains("1m"))
            .unwrap_or(false);

        let outcome = self.updater.apply_trade(&trade, emit_1m);
        for bar in &outcome.emits {
            self.emit_bar(bar).await;
        }
        if let Some(bar) = outcome.persist {
            let cache = self.ctx.cache.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = cache.insert_batch(&[bar]) {
                    warn!(target: "session", "关闭1分钟蜡烛落盘失败: {}", e);
                }
            });
        }
    }

    async fn handle_add_timeframe(&mut self, instrument: String, timeframe: String) {
        if self.phase != SessionPhase::LiveActive {
            self.send_error("add_timeframe rejected in current state").await;
            return;
        }
        if let Err(e) = parse_timeframe(&timeframe) {
            self.send_error(&e.to_string()).await;
            return;
        }
        let already = self
            .subs
            .get(&instrument)
            .map(|tfs| tfs.contains(&timeframe))
            .unwrap_or(false);
        if already {
            self.send_ctrl(json!({
                "event": "timeframe_exists",
                "instrument": instrument,
                "timeframe": timeframe,
            }))
            .await;
            return;
        }

        // (i) 记录订阅 (ii) 进入变更状态 (iii) 后台取数，结果以事件返回
        self.subs
            .entry(instrument.clone())
            .or_default()
            .insert(timeframe.clone());
        self.phase = SessionPhase::ChangingTimeframes;
        self.pending_change = Some((instrument.clone(), timeframe.clone()));

        let acquisition = self.ctx.acquisition.clone();
        let self_tx = self.self_tx.clone();
        let start_ms = self.original_start;
        let use_cache = self.use_cache;
        let save_cache = self.save_cache;
        tokio::spawn(async move {
            let now_ms = chrono::Utc::now().timestamp_millis();
            let result = acquisition
                .acquire_1m(&instrument, start_ms, now_ms, true, use_cache, save_cache)
                .await;
            let _ = self_tx
                .send(SessionEvent::TimeframeReady {
                    instrument,
                    timeframe,
                    result,
                })
                .await;
        });
    }

    async fn finish_add_timeframe(
        &mut self,
        instrument: String,
        timeframe: String,
        result: crate::mdcommon::Result<Vec<Bar>>,
    ) {
        if self.phase != SessionPhase::ChangingTimeframes {
            // stop_data已经发生，丢弃迟到的结果
            debug!(target: "session", client_id = %self.client_id, "忽略迟到的周期变更结果");
            return;
        }
        self.pending_change = None;

        match result {
            Ok(series) => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                // (iv) 推送新周期的历史序列
                match aggregate_series(&instrument, &timeframe, self.original_start, now_ms, &series)
                {
                    Ok(bars) => {
                        let seed = bars.last().filter(|b| !b.is_closed).cloned();
                        for bar in &bars {
                            self.emit_bar(bar).await;
                        }

                        // (v) 初始化开放的更高周期蜡烛：续接仍开放的最后一根聚合
                        // bar，否则在当前桶上新开；把开放1分钟蜡烛折叠进去
                        if !self.updater.tracks(&instrument) {
                            let next_1m = series
                                .last()
                                .map(|b| b.ts + MINUTE_MS)
                                .unwrap_or((now_ms / MINUTE_MS) * MINUTE_MS);
                            self.updater.init_1m(&instrument, next_1m);
                        }
                        if timeframe != "1m" {
                            if let Ok(interval) = parse_timeframe(&timeframe) {
                                match seed {
                                    Some(bar) => {
                                        self.updater.seed_higher(&instrument, &timeframe, bar, interval)
                                    }
                                    None => {
                                        let anchor = self
                                            .updater
                                            .open_1m_bar(&instrument)
                                            .map(|b| b.ts)
                                            .unwrap_or(now_ms);
                                        self.updater.init_higher_empty(
                                            &instrument,
                                            &timeframe,
                                            interval,
                                            anchor,
                                        );
                                    }
                                }
                                self.updater.fold_open_1m_into_higher(&instrument, &timeframe);
                            }
                        }
                        self.send_ctrl(json!({
                            "event": "timeframe_added",
                            "instrument": instrument,
                            "timeframe": timeframe,
                        }))
                        .await;
                    }
                    Err(e) => {
                        self.rollback_timeframe(&instrument, &timeframe);
                        self.send_error(&e.to_string()).await;
                    }
                }
            }
            Err(e) => {
                self.rollback_timeframe(&instrument, &timeframe);
                self.send_error(&format!("add_timeframe failed: {e}")).await;
            }
        }

        // (vi) 回到实时状态 (vii) 按原顺序排空FIFO，之后才处理新成交
        self.phase = SessionPhase::LiveActive;
        while let Some(trade) = self.trade_queue.pop_front() {
            self.apply_trade(trade).await;
        }
    }

    fn rollback_timeframe(&mut self, instrument: &str, timeframe: &str) {
        if let Some(tfs) = self.subs.get_mut(instrument) {
            tfs.remove(timeframe);
            if tfs.is_empty() {
                self.subs.remove(instrument);
            }
        }
    }

    async fn handle_remove_timeframe(&mut self, instrument: String, timeframe: String) {
        match self.phase {
            SessionPhase::LiveActive | SessionPhase::ChangingTimeframes => {
                let Some(tfs) = self.subs.get_mut(&instrument) else {
                    self.send_error("instrument not subscribed").await;
                    return;
                };
                if !tfs.remove(&timeframe) {
                    self.send_error("timeframe not subscribed").await;
                    return;
                }
                self.updater.remove_higher(&instrument, &timeframe);
                // 品种上仍有订阅周期时，1分钟跟踪保留
                if tfs.is_empty() {
                    self.subs.remove(&instrument);
                    self.updater.remove_instrument(&instrument);
                }
                self.send_ctrl(json!({
                    "event": "timeframe_removed",
                    "instrument": instrument,
                    "timeframe": timeframe,
                }))
                .await;
            }
            _ => {
                self.send_error("remove_timeframe rejected in current state").await;
            }
        }
    }

    async fn handle_stream_control(&mut self, value: serde_json::Value) {
        warn!(target: "session", client_id = %self.client_id, "成交流控制消息: {}", value);
        self.send_ctrl(value).await;
    }

    //=========================================================================
    // 回放
    //=========================================================================

    async fn handle_get_replay(&mut self, req: GetReplayReq) {
        match self.phase {
            SessionPhase::LiveActive | SessionPhase::ChangingTimeframes => {
                self.send_error("get_replay rejected in current state").await;
                return;
            }
            SessionPhase::ReplayActive => {
                // 重启回放
                self.replay = None;
                self.phase = SessionPhase::Idle;
            }
            SessionPhase::Idle => {}
        }

        if req.subscriptions.is_empty() {
            self.send_error("subscriptions must not be empty").await;
            return;
        }
        if req.replay_interval == 0 {
            self.send_error("replay_interval must be positive").await;
            return;
        }
        let mut subs: HashMap<String, BTreeSet<String>> = HashMap::new();
        for sub in &req.subscriptions {
            if let Err(e) = parse_timeframe(&sub.timeframe) {
                self.send_error(&e.to_string()).await;
                return;
            }
            subs.entry(sub.instrument.clone())
                .or_default()
                .insert(sub.timeframe.clone());
        }
        if let Some(name) = req.timezone.as_deref() {
            match Tz::from_str(name) {
                Ok(tz) => self.tz = tz,
                Err(_) => {
                    self.send_error(&format!("unknown timezone: {name}")).await;
                    return;
                }
            }
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let history_start = match resolve_history_start(&req.history_start, now_ms) {
            Ok(ts) => ts,
            Err(e) => {
                self.send_error(&e.to_string()).await;
                return;
            }
        };
        let live_start = match resolve_live_start(&req.live_start, now_ms) {
            Ok(ts) => ts,
            Err(e) => {
                self.send_error(&e.to_string()).await;
                return;
            }
        };
        let live_end = match resolve_live_end(&req.live_end, live_start, now_ms) {
            Ok(ts) => ts,
            Err(e) => {
                self.send_error(&e.to_string()).await;
                return;
            }
        };

        // 预取每个品种的完整1分钟序列
        let mut series: HashMap<String, Vec<Bar>> = HashMap::new();
        for instrument in subs.keys() {
            match self
                .ctx
                .acquisition
                .acquire_1m(instrument, history_start, live_end, false, true, true)
                .await
            {
                Ok(bars) => {
                    series.insert(instrument.clone(), bars);
                }
                Err(e) => {
                    error!(target: "session", client_id = %self.client_id, "{}: 回放取数失败: {}", instrument, e);
                    self.send_error(&format!("{instrument}: {e}")).await;
                    return;
                }
            }
        }

        self.subs = subs.clone();
        let state = ReplayState::new(subs, series, live_start, live_end, req.replay_interval);

        // 历史段一次性推送
        for bar in state.history_bars() {
            self.emit_bar(&bar).await;
        }
        self.send_ctrl(json!({"event": "replay_history_complete"})).await;

        if state.is_live_phase_empty() {
            self.send_ctrl(json!({"event": "replay_complete"})).await;
            self.phase = SessionPhase::Idle;
            return;
        }

        self.replay = Some(state);
        self.phase = SessionPhase::ReplayActive;
        self.send_ctrl(json!({"event": "replay_started"})).await;
    }

    async fn on_replay_tick(&mut self) {
        let Some(replay) = self.replay.as_mut() else {
            return;
        };
        let tick = replay.tick();
        // 下一个到期时刻从上一个推算，速度变化时由modify_replay重置
        replay.next_deadline += Duration::from_millis(replay.interval_ms);

        let emits = tick.emits;
        for bar in &emits {
            self.emit_bar(bar).await;
        }

        if tick.completed {
            self.replay = None;
            self.phase = SessionPhase::Idle;
            self.send_ctrl(json!({"event": "replay_complete"})).await;
        }
    }

    async fn handle_modify_replay(&mut self, pause: Option<bool>, replay_interval: Option<u64>) {
        if self.phase != SessionPhase::ReplayActive {
            self.send_error("modify_replay rejected in current state").await;
            return;
        }
        if replay_interval == Some(0) {
            self.send_error("replay_interval must be positive").await;
            return;
        }
        let Some(replay) = self.replay.as_mut() else {
            return;
        };

        if let Some(interval) = replay_interval {
            // 重启tick周期，虚拟时间保持不变
            replay.interval_ms = interval;
            replay.next_deadline = Instant::now() + Duration::from_millis(interval);
        }
        if let Some(paused) = pause {
            replay.paused = paused;
            if !paused {
                replay.next_deadline =
                    Instant::now() + Duration::from_millis(replay.interval_ms);
            }
        }
        self.send_ctrl(json!({
            "event": "replay_modified",
            "paused": self.replay.as_ref().map(|r| r.paused),
            "replay_interval": self.replay.as_ref().map(|r| r.interval_ms),
        }))
        .await;
    }

    async fn handle_stop_replay(&mut self) {
        if self.phase == SessionPhase::ReplayActive {
            self.replay = None;
            self.phase = SessionPhase::Idle;
            self.sink.flush();
            self.send_ctrl(json!({"event": "replay_stopped"})).await;
        }
    }

    //=========================================================================
    // 附属存储CRUD与策略广播
    //=========================================================================

    async fn handle_store_request(&mut self, req: ClientRequest) {
        let result = self.dispatch_store_request(req).await;
        if let Err(e) = result {
            self.send_error(&e.to_string()).await;
        }
    }

    async fn dispatch_store_request(&mut self, req: ClientRequest) -> crate::mdcommon::Result<()> {
        match req {
            ClientRequest::SaveSettings { name, value } => {
                self.ctx.store.set_setting(&name, &value)?;
                self.send_ctrl(json!({"event": "settings_saved", "name": name})).await;
            }
            ClientRequest::GetSettings { name } => {
                let value = self.ctx.store.get_setting(&name)?;
                self.send_ctrl(json!({"event": "settings", "name": name, "value": value}))
                    .await;
            }
            ClientRequest::SaveClientSettings { value } => {
                self.ctx.store.set_client_settings(&self.client_id, &value)?;
                self.send_ctrl(json!({"event": "client_settings_saved"})).await;
            }
            ClientRequest::GetClientSettings => {
                let value = self.ctx.store.get_client_settings(&self.client_id)?;
                self.send_ctrl(json!({"event": "client_settings", "value": value})).await;
            }
            ClientRequest::SaveAnnotation {
                unique_id,
                instrument,
                timeframe,
                annotype,
                object,
            } => {
                let anno = Annotation {
                    client_id: self.client_id.clone(),
                    unique_id,
                    instrument,
                    timeframe,
                    annotype,
                    object,
                };
                self.ctx.store.save_annotation(&anno)?;
                self.send_ctrl(json!({"event": "annotation_saved", "unique_id": anno.unique_id}))
                    .await;
                self.fanout_annotation("anno_saved", &anno).await;
            }
            ClientRequest::DeleteAnnotation { unique_id } => {
                let deleted = self.ctx.store.delete_annotation(&self.client_id, &unique_id)?;
                self.send_ctrl(json!({
                    "event": "annotation_deleted",
                    "unique_id": unique_id,
                    "deleted": deleted,
                }))
                .await;
                if deleted {
                    let anno = Annotation {
                        client_id: self.client_id.clone(),
                        unique_id,
                        instrument: String::new(),
                        timeframe: String::new(),
                        annotype: String::new(),
                        object: serde_json::Value::Null,
                    };
                    self.fanout_annotation("anno_deleted", &anno).await;
                }
            }
            ClientRequest::GetAnnotations => {
                let annos = self.ctx.store.get_annotations(&self.client_id)?;
                self.send_ctrl(json!({"event": "annotations", "annotations": annos})).await;
            }
            ClientRequest::SaveStrategy {
                strategy_name,
                description,
                parameters,
                subscribers,
            } => {
                let strategy = Strategy {
                    client_id: self.client_id.clone(),
                    strategy_name,
                    description,
                    parameters,
                    subscribers,
                };
                self.ctx.store.save_strategy(&strategy)?;
                self.send_ctrl(json!({"event": "strategy_saved"})).await;
            }
            ClientRequest::GetStrategy => {
                let strategy = self.ctx.store.get_strategy(&self.client_id)?;
                self.send_ctrl(json!({"event": "strategy", "strategy": strategy})).await;
            }
            _ => {
                self.send_error("unhandled action").await;
            }
        }
        Ok(())
    }

    /// 策略广播：标注保存/删除时推送给发布者策略的全部在线订阅者
    ///
    /// 订阅名单在发送时查询，不做缓存。
    async fn fanout_annotation(&self, action: &str, anno: &Annotation) {
        let subscribers = match self.ctx.store.strategy_subscribers(&self.client_id) {
            Ok(list) => list,
            Err(e) => {
                warn!(target: "session", "查询策略订阅者失败: {}", e);
                return;
            }
        };
        if subscribers.is_empty() {
            return;
        }
        let payload = strategy_msg(
            action,
            json!({
                "publisher": self.client_id,
                "unique_id": anno.unique_id,
                "instrument": anno.instrument,
                "timeframe": anno.timeframe,
                "annotype": anno.annotype,
                "object": anno.object,
            }),
        );
        for sub_id in subscribers {
            // 先克隆发送端再await，避免跨await持有注册表引用
            let tx = self.ctx.clients.get(&sub_id).map(|entry| entry.clone());
            if let Some(tx) = tx {
                let _ = tx.send(payload.clone()).await;
            }
        }
    }

    //=========================================================================
    // 输出与销毁
    //=========================================================================

    async fn emit_bar(&mut self, bar: &Bar) {
        let line = data_msg(bar, &self.tz);
        self.sink.send(line).await;
    }

    async fn send_ctrl(&mut self, fields: serde_json::Value) {
        let _ = self.client_tx.send(ctrl_msg(fields)).await;
    }

    async fn send_error(&mut self, message: &str) {
        warn!(target: "session", client_id = %self.client_id, "请求错误: {}", message);
        let _ = self.client_tx.send(error_msg(message)).await;
    }

    /// 完全销毁：关上游流、撤定时器、冲刷文件端
    fn teardown(&mut self) {
        if let Some(handle) = self.trade_stream.take() {
            handle.stop();
        }
        self.live_deadline = None;
        self.replay = None;
        self.sink.flush();
        if self.registered {
            self.ctx.clients.remove(&self.client_id);
        }
    }
}

fn parse_live_mode(live_data: &LiveData) -> std::result::Result<LiveMode, String> {
    match live_data {
        LiveData::Mode(mode) => match mode.as_str() {
            "none" => Ok(LiveMode::None),
            "all" => Ok(LiveMode::All),
            other => Err(format!("bad live_data: {other}")),
        },
        LiveData::Seconds(secs) => {
            if *secs > 0.0 {
                Ok(LiveMode::Seconds(*secs))
            } else {
                Err("live_data seconds must be positive".to_string())
            }
        }
    }
}

async fn maybe_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdcommon::db::open_db_pool;
    use crate::mdcommon::models::BarSource;
    use std::future::Future;
    use tokio::sync::Semaphore;

    // 2023-11-14T22:14:00Z，分钟对齐
    const BASE: i64 = 1_700_000_040_000;

    fn closed_1m(ts: i64, close: f64) -> Bar {
        Bar {
            ts,
            open: Some(100.0),
            high: Some(close.max(101.0)),
            low: Some(99.0),
            close: Some(close),
            volume: 10,
            instrument: "ES".to_string(),
            timeframe: "1m".to_string(),
            source: BarSource::Cache,
            is_closed: true,
        }
    }

    /// 取数mock：信号量放行，每次acquire消耗一个许可
    struct GatedAcquisition {
        gate: Arc<Semaphore>,
        bars: Vec<Bar>,
    }

    impl BarAcquisition for GatedAcquisition {
        fn acquire_1m(
            &self,
            instrument: &str,
            start_ms: i64,
            end_ms: i64,
            _end_is_now: bool,
            _use_cache: bool,
            _save_cache: bool,
        ) -> impl Future<Output = crate::mdcommon::Result<Vec<Bar>>> + Send {
            let gate = self.gate.clone();
            let bars: Vec<Bar> = self
                .bars
                .iter()
                .filter(|b| b.ts >= start_ms && b.ts <= end_ms)
                .map(|b| Bar {
                    instrument: instrument.to_string(),
                    ..b.clone()
                })
                .collect();
            async move {
                let permit = gate.acquire().await.map_err(|_| {
                    crate::mdcommon::AppError::ChannelError("gate closed".to_string())
                })?;
                permit.forget();
                Ok(bars)
            }
        }
    }

    /// 成交订阅mock：持住发送端但不产生任何成交（测试直接注入事件）
    struct NullTradeSubscriber;

    impl TradeSubscriber for NullTradeSubscriber {
        fn subscribe_trades(
            &self,
            _instruments: Vec<String>,
            _start_ns: i64,
            trade_tx: mpsc::Sender<Trade>,
            _ctrl_tx: mpsc::Sender<serde_json::Value>,
        ) -> impl Future<Output = crate::mdcommon::Result<LiveTradeHandle>> + Send {
            async move {
                let task = tokio::spawn(async move {
                    let _tx = trade_tx;
                    pending::<()>().await
                });
                Ok(LiveTradeHandle::from_task(task))
            }
        }
    }

    fn spawn_session(
        bars: Vec<Bar>,
        permits: usize,
    ) -> (mpsc::Sender<SessionEvent>, mpsc::Receiver<String>, Arc<Semaphore>) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_db_pool(dir.path().join("session.db")).unwrap();
        std::mem::forget(dir);
        let cache = Arc::new(BarCache::new(pool.clone()).unwrap());
        let store = Arc::new(AncillaryStore::new(pool).unwrap());
        let gate = Arc::new(Semaphore::new(permits));
        let ctx = SessionCtx {
            acquisition: Arc::new(GatedAcquisition {
                gate: gate.clone(),
                bars,
            }),
            trade_sub: Arc::new(NullTradeSubscriber),
            cache,
            store,
            clients: Arc::new(DashMap::new()),
        };
        let (out_tx, out_rx) = mpsc::channel(1024);
        let (ev_tx, ev_rx) = mpsc::channel(1024);
        let session = Session::new(ctx, out_tx, ev_tx.clone());
        tokio::spawn(session.run(ev_rx));
        (ev_tx, out_rx, gate)
    }

    async fn recv_json(rx: &mut mpsc::Receiver<String>) -> serde_json::Value {
        let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("接收消息超时")
            .expect("会话输出通道已关闭");
        serde_json::from_str(&line).expect("输出不是合法JSON")
    }

    /// 收取消息直到出现指定ctrl事件，返回途中收到的全部消息
    async fn recv_until_ctrl(
        rx: &mut mpsc::Receiver<String>,
        event: &str,
    ) -> Vec<serde_json::Value> {
        let mut seen = Vec::new();
        loop {
            let value = recv_json(rx).await;
            let done = value["mtyp"] == "ctrl" && value["event"] == event;
            seen.push(value);
            if done {
                return seen;
            }
        }
    }

    fn send_request(ev_tx: &mpsc::Sender<SessionEvent>, text: &str) {
        let req = ClientRequest::parse(text).unwrap();
        ev_tx.try_send(SessionEvent::Request(req)).unwrap();
    }

    fn send_trade(ev_tx: &mpsc::Sender<SessionEvent>, ts: i64, price: f64) {
        ev_tx
            .try_send(SessionEvent::Trade(Trade {
                ts_ms: ts,
                price,
                size: 1,
                side: 'B',
                instrument: "ES".to_string(),
            }))
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_data_historical_only() {
        let bars: Vec<Bar> = (0..5).map(|i| closed_1m(BASE + i * MINUTE_MS, 100.5)).collect();
        let (ev_tx, mut out_rx, _gate) = spawn_session(bars, 1);

        send_request(
            &ev_tx,
            r#"{"action": "get_data",
                "subscriptions": [{"instrument": "ES", "timeframe": "1m"}],
                "start_time": "2023-11-14T00:00:00Z",
                "live_data": "none"}"#,
        );

        let seen = recv_until_ctrl(&mut out_rx, "data_complete").await;
        let data: Vec<&serde_json::Value> =
            seen.iter().filter(|v| v["mtyp"] == "data").collect();
        assert_eq!(data.len(), 5);
        assert!(data.windows(2).all(|w| {
            w[0]["timestamp"].as_i64().unwrap() < w[1]["timestamp"].as_i64().unwrap()
        }));
        assert!(
            !seen.iter().any(|v| v["event"] == "live_started"),
            "live=none不启动实时侧"
        );
    }

    #[tokio::test]
    async fn test_trade_queue_ordering_across_timeframe_change() {
        // S6: ES:1m实时订阅中加入5m，转换期间到达的成交排队，
        // 历史推送完成后按原顺序应用
        let bars: Vec<Bar> = (0..10).map(|i| closed_1m(BASE + i * MINUTE_MS, 100.5)).collect();
        let (ev_tx, mut out_rx, gate) = spawn_session(bars, 1);

        send_request(
            &ev_tx,
            r#"{"action": "get_data",
                "subscriptions": [{"instrument": "ES", "timeframe": "1m"}],
                "start_time": "2023-11-14T00:00:00Z",
                "live_data": "all"}"#,
        );
        recv_until_ctrl(&mut out_rx, "live_started").await;

        // 开放1分钟蜡烛折入3笔成交
        let t0 = BASE + 10 * MINUTE_MS;
        for (i, price) in [100.0, 101.0, 99.0].iter().enumerate() {
            send_trade(&ev_tx, t0 + i as i64 * 1_000, *price);
        }
        for price in [100.0, 101.0, 99.0] {
            let value = recv_json(&mut out_rx).await;
            assert_eq!(value["mtyp"], "data");
            assert_eq!(value["close"].as_f64().unwrap(), price);
        }

        // add_timeframe被信号量卡住 -> 会话处于变更状态
        send_request(
            &ev_tx,
            r#"{"action": "add_timeframe", "instrument": "ES", "timeframe": "5m"}"#,
        );
        // 转换窗口内又来2笔成交
        send_trade(&ev_tx, t0 + 10_000, 111.0);
        send_trade(&ev_tx, t0 + 11_000, 112.0);

        // 窗口内不得有任何成交被应用
        let quiet = tokio::time::timeout(Duration::from_millis(100), out_rx.recv()).await;
        assert!(quiet.is_err(), "变更窗口内不应有推送: {quiet:?}");

        // 放行取数
        gate.add_permits(1);
        let seen = recv_until_ctrl(&mut out_rx, "timeframe_added").await;
        let five_history: Vec<&serde_json::Value> = seen
            .iter()
            .filter(|v| v["mtyp"] == "data" && v["timeframe"] == "5m")
            .collect();
        assert!(!five_history.is_empty(), "新周期的历史序列先于排队成交推送");

        // 排队的成交按原顺序应用：1m收盘价依次为111、112
        let mut ones = Vec::new();
        while ones.len() < 2 {
            let value = recv_json(&mut out_rx).await;
            if value["mtyp"] == "data" && value["timeframe"] == "1m" {
                ones.push(value["close"].as_f64().unwrap());
            }
        }
        assert_eq!(ones, vec![111.0, 112.0], "FIFO顺序必须保持");
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_pause_and_speed_change() {
        // S5: 1000ms一个tick，3个tick后暂停无推送；以200ms恢复后
        // 从暂停处继续，tick间隔变为200ms
        let bars: Vec<Bar> = (0..30).map(|i| closed_1m(BASE + i * MINUTE_MS, 100.5)).collect();
        let (ev_tx, mut out_rx, _gate) = spawn_session(bars, 1);

        let live_end = BASE + 29 * MINUTE_MS;
        send_request(
            &ev_tx,
            &format!(
                r#"{{"action": "get_replay",
                    "subscriptions": [{{"instrument": "ES", "timeframe": "1m"}}],
                    "history_start": {BASE},
                    "live_start": "2023-11-14T22:14:00Z",
                    "live_end": {live_end},
                    "replay_interval": 1000}}"#
            ),
        );
        recv_until_ctrl(&mut out_rx, "replay_started").await;

        // 3个tick，每1000ms一根1分钟bar
        let started = Instant::now();
        for i in 0..3 {
            let value = recv_json(&mut out_rx).await;
            assert_eq!(value["mtyp"], "data");
            assert_eq!(value["timestamp"].as_i64().unwrap(), BASE + i * MINUTE_MS);
            assert_eq!(value["isClosed"], true);
        }
        assert_eq!(started.elapsed().as_millis(), 3000);

        send_request(&ev_tx, r#"{"action": "modify_replay", "pause": true}"#);
        recv_until_ctrl(&mut out_rx, "replay_modified").await;

        // 暂停期间没有任何推送
        let quiet = tokio::time::timeout(Duration::from_secs(10), out_rx.recv()).await;
        assert!(quiet.is_err(), "暂停后不应再推送bar");

        // 换速并恢复：虚拟时钟从暂停处继续
        send_request(
            &ev_tx,
            r#"{"action": "modify_replay", "replay_interval": 200, "pause": false}"#,
        );
        recv_until_ctrl(&mut out_rx, "replay_modified").await;

        let resumed = Instant::now();
        let value = recv_json(&mut out_rx).await;
        assert_eq!(resumed.elapsed().as_millis(), 200, "恢复后tick间隔为200ms");
        assert_eq!(
            value["timestamp"].as_i64().unwrap(),
            BASE + 3 * MINUTE_MS,
            "虚拟时钟从暂停处继续"
        );

        let value = recv_json(&mut out_rx).await;
        assert_eq!(value["timestamp"].as_i64().unwrap(), BASE + 4 * MINUTE_MS);
        assert_eq!(resumed.elapsed().as_millis(), 400);
    }

    #[tokio::test]
    async fn test_stop_data_during_change_discards_transition() {
        let bars: Vec<Bar> = (0..5).map(|i| closed_1m(BASE + i * MINUTE_MS, 100.5)).collect();
        let (ev_tx, mut out_rx, gate) = spawn_session(bars, 1);

        send_request(
            &ev_tx,
            r#"{"action": "get_data",
                "subscriptions": [{"instrument": "ES", "timeframe": "1m"}],
                "start_time": "2023-11-14T00:00:00Z",
                "live_data": "all"}"#,
        );
        recv_until_ctrl(&mut out_rx, "live_started").await;

        send_request(
            &ev_tx,
            r#"{"action": "add_timeframe", "instrument": "ES", "timeframe": "5m"}"#,
        );
        send_request(&ev_tx, r#"{"action": "stop_data"}"#);
        recv_until_ctrl(&mut out_rx, "live_stopped").await;

        // 放行迟到的取数结果：会话已回到Idle，结果被丢弃，没有历史推送
        gate.add_permits(1);
        let quiet = tokio::time::timeout(Duration::from_millis(100), out_rx.recv()).await;
        assert!(quiet.is_err(), "停止后迟到的周期变更结果必须被丢弃");
    }
}
