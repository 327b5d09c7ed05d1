//! 网关服务器
//!
//! 每条长连接由三个协作活动承载：接收循环（前台）、发送 worker、心跳
//! worker。关闭信号边沿触发且幂等，任一方把连接推进 DRAINING 后其余
//! 活动自行退出。优雅退出时停止接入、关闭全部连接，并在限定时间内等
//! 待各连接任务收尾。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use axum::routing::{get, post};
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use ripple_im_core::config::GatewayServiceConfig;
use ripple_im_core::protocol::Frame;
use ripple_im_core::{ImError, Result};
use ripple_message::MessageApi;
use ripple_presence::RouteRegistry;

use crate::connection::Connection;
use crate::dispatcher::Dispatcher;
use crate::http;
use crate::identity::{AuthClaims, IdentityClient, bearer_token};
use crate::manager::{ConnectionManager, run_reaper};

pub struct GatewayState {
    pub config: GatewayServiceConfig,
    pub manager: Arc<ConnectionManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub identity: Arc<dyn IdentityClient>,
    pub registry: Arc<dyn RouteRegistry>,
    pub message: Arc<dyn MessageApi>,
    pub shutdown: watch::Receiver<bool>,
    /// 在途的连接任务数，优雅退出时等它归零
    active_streams: AtomicUsize,
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/internal/push", post(http::push_handler))
        .route("/healthz", get(http::health_handler))
        .route("/v1/sync", post(http::sync_handler))
        .route("/v1/conversations", post(http::create_conversation_handler))
        .route("/v1/conversations/{conv_id}", get(http::get_conversation_handler))
        .with_state(state)
}

/// 接入握手：先鉴权再升级，令牌来自 Authorization 头或 token 查询参数
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(params): Query<std::collections::HashMap<String, String>>,
) -> Response {
    let token = bearer_token(
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok()),
    )
    .map(str::to_string)
    .or_else(|| params.get("token").cloned());

    let Some(token) = token else {
        return http::error_response(&ImError::Unauthenticated(
            "missing or invalid authorization header".into(),
        ));
    };

    let claims = match state.identity.validate_token(&token).await {
        Ok(claims) => claims,
        Err(err) => return http::error_response(&err),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, claims))
}

async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>, claims: AuthClaims) {
    state.active_streams.fetch_add(1, Ordering::Relaxed);
    let user_id = claims.user_id;
    let device_id = claims.device_id;
    info!(user_id, %device_id, "client connecting");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (conn, mut outbound) =
        Connection::new(user_id, &device_id, state.config.send_queue_capacity);

    // 同身份旧连接先被关闭，再接纳新连接，随后登记路由
    state.manager.add(conn.clone()).await;
    if let Err(err) = state
        .registry
        .register_route(user_id, &device_id, &state.config.advertise_addr)
        .await
    {
        error!(user_id, %device_id, %err, "failed to register route");
    }

    // 发送 worker：出站队列 → 对端流
    let send_conn = conn.clone();
    let send_task = tokio::spawn(async move {
        let mut closed = send_conn.close_signal();
        loop {
            tokio::select! {
                maybe = outbound.recv() => {
                    let Some(frame) = maybe else { break };
                    if let Err(err) = ws_tx.send(Message::Text(frame.encode().into())).await {
                        warn!(
                            user_id = send_conn.user_id,
                            device_id = %send_conn.device_id,
                            %err,
                            "failed to write frame to peer"
                        );
                        send_conn.close();
                        break;
                    }
                }
                changed = closed.changed() => {
                    if changed.is_err() || *closed.borrow() {
                        break;
                    }
                }
            }
        }
    });

    // 心跳 worker：周期刷新路由；路由丢失时强制重新注册
    let hb_conn = conn.clone();
    let hb_registry = state.registry.clone();
    let hb_addr = state.config.advertise_addr.clone();
    let hb_interval = Duration::from_secs(state.config.heartbeat_interval_secs);
    let heartbeat_task = tokio::spawn(async move {
        let mut closed = hb_conn.close_signal();
        let mut ticker = tokio::time::interval(hb_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match hb_registry.heartbeat(hb_conn.user_id, &hb_conn.device_id).await {
                        Ok(()) => {}
                        Err(ImError::NotFound(_)) => {
                            debug!(
                                user_id = hb_conn.user_id,
                                device_id = %hb_conn.device_id,
                                "route expired, re-registering"
                            );
                            if let Err(err) = hb_registry
                                .register_route(hb_conn.user_id, &hb_conn.device_id, &hb_addr)
                                .await
                            {
                                warn!(user_id = hb_conn.user_id, %err, "route re-register failed");
                            }
                        }
                        // 下个周期重试，心跳失败不拆连接
                        Err(err) => {
                            warn!(user_id = hb_conn.user_id, %err, "heartbeat failed");
                        }
                    }
                }
                changed = closed.changed() => {
                    if changed.is_err() || *closed.borrow() {
                        break;
                    }
                }
            }
        }
    });

    // 接收循环（前台）
    let mut closed = conn.close_signal();
    let mut shutdown = state.shutdown.clone();
    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        conn.touch();
                        dispatch_raw(&state, &conn, &text).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        conn.touch();
                        match std::str::from_utf8(&data) {
                            Ok(text) => dispatch_raw(&state, &conn, text).await,
                            Err(_) => debug!(user_id, "ignoring non-utf8 binary frame"),
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => conn.touch(),
                    Some(Ok(Message::Close(_))) => {
                        info!(user_id, %device_id, "client disconnected");
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(user_id, %device_id, %err, "receive error");
                        break;
                    }
                    None => {
                        info!(user_id, %device_id, "client stream ended");
                        break;
                    }
                }
            }
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    debug!(user_id, %device_id, "close signal received");
                    break;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(user_id, %device_id, "server shutting down");
                    break;
                }
            }
        }
    }

    // DRAINING → CLOSED：发出关闭信号，等 worker 退出，再注销路由。
    // 仅当本连接仍持有管理器条目时才注销路由，避免被顶掉的连接
    // 删除接替者刚登记的路由。
    conn.close();
    let still_attached = state.manager.remove_if_attached(&conn).await;
    if still_attached {
        if let Err(err) = state.registry.unregister_route(user_id, &device_id).await {
            warn!(user_id, %device_id, %err, "failed to unregister route");
        }
    }
    let _ = send_task.await;
    let _ = heartbeat_task.await;

    state.active_streams.fetch_sub(1, Ordering::Relaxed);
    info!(user_id, %device_id, "connection closed");
}

/// 解析并分发一帧；处理器 panic 被兜住，转为 Internal 错误帧，流继续
async fn dispatch_raw(state: &Arc<GatewayState>, conn: &Arc<Connection>, raw: &str) {
    let frame = match Frame::decode(raw) {
        Ok(frame) => frame,
        Err(err) => {
            conn.try_send(Frame::error_from(None, &err));
            return;
        }
    };

    let handled = AssertUnwindSafe(state.dispatcher.handle_frame(conn, frame))
        .catch_unwind()
        .await;
    if handled.is_err() {
        error!(
            user_id = conn.user_id,
            device_id = %conn.device_id,
            "frame handler panicked"
        );
        conn.try_send(Frame::error(None, "INTERNAL", "internal error"));
    }
}

pub struct GatewayServer {
    state: Arc<GatewayState>,
    shutdown_tx: watch::Sender<bool>,
}

impl GatewayServer {
    pub fn new(
        config: GatewayServiceConfig,
        manager: Arc<ConnectionManager>,
        dispatcher: Arc<Dispatcher>,
        identity: Arc<dyn IdentityClient>,
        registry: Arc<dyn RouteRegistry>,
        message: Arc<dyn MessageApi>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(GatewayState {
            config,
            manager,
            dispatcher,
            identity,
            registry,
            message,
            shutdown: shutdown_rx,
            active_streams: AtomicUsize::new(0),
        });
        Self { state, shutdown_tx }
    }

    pub fn state(&self) -> Arc<GatewayState> {
        self.state.clone()
    }

    pub async fn run(self) -> Result<()> {
        let state = self.state.clone();

        tokio::spawn(run_reaper(
            state.manager.clone(),
            state.registry.clone(),
            Duration::from_secs(state.config.reap_interval_secs),
            Duration::from_secs(state.config.idle_timeout_secs),
            state.shutdown.clone(),
        ));

        let listener = tokio::net::TcpListener::bind(&state.config.listen_addr)
            .await
            .map_err(|err| ImError::internal("bind listener", err))?;
        info!(listen_addr = %state.config.listen_addr, "gateway listening");

        let app = router(state.clone());
        axum::serve(listener, app)
            .with_graceful_shutdown(wait_for_shutdown(self.shutdown_tx.clone()))
            .await
            .map_err(|err| ImError::internal("serve", err))?;

        // 停止接入后：关闭所有连接，限时等待连接任务收尾
        let closing = state.manager.close_all().await;
        info!(closing, "draining connections");
        let deadline =
            Instant::now() + Duration::from_secs(state.config.shutdown_deadline_secs);
        while state.active_streams.load(Ordering::Relaxed) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = state.active_streams.load(Ordering::Relaxed);
        if remaining > 0 {
            warn!(remaining, "shutdown deadline reached with streams still draining");
        }
        info!("gateway stopped");
        Ok(())
    }
}

/// 等待中断或终止信号，随后广播关闭
async fn wait_for_shutdown(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to listen for interrupt signal");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(%err, "failed to listen for terminate signal");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, stopping accept loop");
    let _ = shutdown_tx.send(true);
}
