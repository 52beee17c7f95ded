// =============================================================================
// WebSocket Handler — `strategyUpdate` push loop
// =============================================================================
//
// Clients connect to `/ws/analysis?token=<token>` and receive a
// `strategyUpdate` message for every lifecycle snapshot known to the daemon,
// at least once per second (§6), plus on every transition in between. Same
// push/recv `tokio::select!` shape as the teacher's dashboard socket; the
// body now iterates the per-(user, strategy, instrument) lifecycle map
// instead of a single shared snapshot.
//
// A source address may hold at most `MAX_CONNECTIONS_PER_ADDR` concurrent
// connections (§6) — a cheap guard against a runaway client hammering the
// socket.
// =============================================================================

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        connect_info::ConnectInfo,
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;
use crate::lifecycle::StrategyState;

const MAX_CONNECTIONS_PER_ADDR: u32 = 5;
const PUSH_INTERVAL_MS: u64 = 800;

static CONNECTIONS_PER_ADDR: Lazy<DashMap<std::net::IpAddr, AtomicU32>> = Lazy::new(DashMap::new);

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

#[derive(Serialize)]
struct StrategyUpdate<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    strategies: &'a [StrategyState],
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "Invalid or missing token").into_response();
    }

    let ip = addr.ip();
    let counter = CONNECTIONS_PER_ADDR.entry(ip).or_insert_with(|| AtomicU32::new(0));
    let current = counter.fetch_add(1, Ordering::SeqCst);
    if current >= MAX_CONNECTIONS_PER_ADDR {
        counter.fetch_sub(1, Ordering::SeqCst);
        warn!(%ip, "WebSocket connection rejected: per-address connection limit reached");
        return (axum::http::StatusCode::TOO_MANY_REQUESTS, "Too many connections").into_response();
    }

    info!(%ip, "WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, ip)).into_response()
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>, ip: std::net::IpAddr) {
    use futures_util::{SinkExt, StreamExt};
    let (mut sender, mut receiver) = socket.split();

    if let Err(e) = send_update(&mut sender, &state).await {
        warn!(error = %e, "failed to send initial strategyUpdate");
        release(ip);
        return;
    }

    let mut push_interval = interval(Duration::from_millis(PUSH_INTERVAL_MS));

    loop {
        tokio::select! {
            _ = push_interval.tick() => {
                if let Err(e) = send_update(&mut sender, &state).await {
                    debug!(error = %e, "WebSocket send failed — disconnecting");
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    release(ip);
    info!(%ip, "WebSocket connection closed");
}

async fn send_update<S>(sender: &mut S, state: &Arc<AppState>) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    use futures_util::SinkExt;

    let strategies: Vec<StrategyState> = state.lifecycles.read().values().map(|l| l.snapshot()).collect();
    let update = StrategyUpdate { kind: "strategyUpdate", strategies: &strategies };

    match serde_json::to_string(&update) {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!(error = %e, "failed to serialize strategyUpdate");
            Ok(())
        }
    }
}

fn release(ip: std::net::IpAddr) {
    if let Some(counter) = CONNECTIONS_PER_ADDR.get(&ip) {
        counter.fetch_sub(1, Ordering::SeqCst);
    }
}
