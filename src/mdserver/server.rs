//! WebSocket接入层
//!
//! 每个连接升级后拆成一对通道：入站帧解析成请求事件交给会话任务，
//! 会话产出经出站通道写回socket。会话任务独占自己的状态，接入层只做
//! 搬运。进程关闭时向所有客户端发正常关闭码。

use crate::mdcommon::error::{AppError, Result};
use crate::mddata::{Acquisition, HistoryClient, LiveClient};
use crate::mdserver::messages::{error_msg, ClientRequest};
use crate::mdserver::session::{Session, SessionCtx, SessionEvent};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// 生产环境的取数编排类型
pub type VendorAcquisition = Acquisition<HistoryClient, LiveClient>;
pub type ServerSessionCtx = SessionCtx<VendorAcquisition, LiveClient>;

#[derive(Clone)]
pub struct AppState {
    pub ctx: ServerSessionCtx,
    pub shutdown_rx: watch::Receiver<bool>,
}

/// 启动WebSocket服务
pub async fn run_server(
    listen_addr: &str,
    ctx: ServerSessionCtx,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .with_state(AppState {
            ctx,
            shutdown_rx: shutdown_rx.clone(),
        });

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .map_err(|e| AppError::WebServerError(format!("绑定地址失败 {listen_addr}: {e}")))?;

    info!(target: "server", "行情服务已启动: ws://{}/ws", listen_addr);

    let mut shutdown = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
            info!(target: "server", "收到关闭信号，停止接受新连接");
        })
        .await
        .map_err(|e| AppError::WebServerError(format!("服务器错误: {e}")))
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "clients": state.ctx.clients.len(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// 单个客户端连接的生命周期
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
    let (ev_tx, ev_rx) = mpsc::channel::<SessionEvent>(256);

    let session = Session::new(state.ctx.clone(), out_tx, ev_tx.clone());
    let session_task = tokio::spawn(session.run(ev_rx));

    let mut shutdown_rx = state.shutdown_rx.clone();

    loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(line) => {
                    if socket.send(Message::Text(line)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match ClientRequest::parse(&text) {
                        Ok(req) => {
                            if ev_tx.send(SessionEvent::Request(req)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            // 输入校验失败只回一行错误，连接保留
                            if socket.send(Message::Text(error_msg(&e.to_string()))).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(target: "server", "连接错误: {}", e);
                    break;
                }
            },
            _ = shutdown_rx.changed() => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: "server shutdown".into(),
                    })))
                    .await;
                break;
            }
        }
    }

    // 会话收到断开事件后自行销毁：关上游流、撤定时器、冲刷输出端
    let _ = ev_tx.send(SessionEvent::Disconnected).await;
    if let Err(e) = session_task.await {
        error!(target: "server", "会话任务异常退出: {}", e);
    }
}
