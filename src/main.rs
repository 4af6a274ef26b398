use anyhow::Result;
use dashmap::DashMap;
use marketdata_server::mdcommon::{
    logging_setup::init_logging, open_db_pool, AncillaryStore, BarCache, ServerConfig,
};
use marketdata_server::mddata::{Acquisition, HistoryClient, LiveClient};
use marketdata_server::mdserver::{run_server, SessionCtx};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = ServerConfig::load()?;
    info!("启动行情聚合与分发服务");

    // 持久层初始化失败直接中止进程
    let pool = open_db_pool(&config.database.database_path)?;
    let cache = Arc::new(BarCache::new(pool.clone())?);
    let store = Arc::new(AncillaryStore::new(pool)?);

    let history = HistoryClient::new(
        config.vendor.historical_url.clone(),
        config.vendor.api_key.clone(),
    )?;
    let live = Arc::new(LiveClient::new(
        config.vendor.gateway_url.clone(),
        config.vendor.api_key.clone(),
    ));
    let acquisition = Arc::new(Acquisition::new(
        cache.clone(),
        history,
        (*live).clone(),
    ));

    let ctx = SessionCtx {
        acquisition,
        trade_sub: live,
        cache: cache.clone(),
        store,
        clients: Arc::new(DashMap::new()),
    };

    // ctrl-c触发优雅关闭：客户端收正常关闭码，上游流随会话销毁，缓存收队
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到ctrl-c，开始关闭");
            let _ = shutdown_tx.send(true);
        }
    });

    if let Err(e) = run_server(&config.server.listen_addr, ctx, shutdown_rx).await {
        error!("服务器退出: {}", e);
        cache.shutdown();
        return Err(e.into());
    }

    cache.shutdown();
    info!("服务已退出");
    Ok(())
}
