// =============================================================================
// WebSocket Handler — live-tick channel (spec.md §6, §4.H)
// =============================================================================
//
// Clients connect to `/api/v1/ws` and authenticate in-band (the first
// `authenticate` message), then subscribe to whichever synthetic symbols they
// want a tick stream for. Settlement events for the authenticated user (or
// every user's, for an admin identity) are pushed unprompted — no subscribe
// step required, matching spec.md §4.H: "settlement events are delivered
// only to subscribers with matching user id or admin role."
//
// Each `subscribe` spawns a small forwarder task per symbol that drains the
// bus's lossy broadcast receiver into this connection's single mpsc funnel;
// `unsubscribe` (or disconnect) aborts it. This keeps the main select loop
// to a fixed, constant number of arms regardless of how many symbols a
// client is subscribed to. A 30s heartbeat closes the socket after three
// consecutive silent intervals (`ConnectionHeartbeat`, bus.rs).
// =============================================================================

use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::api::auth::{resolve_identity, Identity};
use crate::api::protocol::{ClientMessage, ServerMessage};
use crate::bus::{ConnectionHeartbeat, SettlementEvent};
use crate::price_generator::Tick;
use crate::CoreState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<CoreState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: CoreState) {
    let (mut sender, mut receiver) = socket.split();

    let mut identity: Option<Identity> = None;
    let (tick_tx, mut tick_rx) = mpsc::unbounded_channel::<Tick>();
    let mut tick_forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();
    let mut last_price: HashMap<String, f64> = HashMap::new();
    let mut settlement_rx: Option<mpsc::UnboundedReceiver<SettlementEvent>> = None;

    let mut heartbeat = ConnectionHeartbeat::new();
    let mut hb_interval = interval(heartbeat.interval());

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        heartbeat.note_activity();
                        let keep_going = handle_client_text(
                            &text,
                            &state,
                            &mut sender,
                            &mut identity,
                            &tick_tx,
                            &mut tick_forwarders,
                            &mut settlement_rx,
                        )
                        .await;
                        if !keep_going {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        heartbeat.note_activity();
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("client closed websocket");
                        break;
                    }
                    Some(Ok(_)) => {
                        heartbeat.note_activity();
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "websocket receive error");
                        break;
                    }
                    None => break,
                }
            }

            tick = tick_rx.recv() => {
                let Some(tick) = tick else { continue };
                let prev = last_price.insert(tick.symbol.clone(), tick.price).unwrap_or(tick.price);
                let change = tick.price - prev;
                let change_percent = if prev != 0.0 { change / prev * 100.0 } else { 0.0 };
                let out = ServerMessage::Tick {
                    symbol: tick.symbol.clone(),
                    price: tick.price,
                    bid: tick.bid,
                    ask: tick.ask,
                    change,
                    change_percent,
                    timestamp: tick.timestamp,
                };
                if send_message(&mut sender, &out).await.is_err() {
                    break;
                }
            }

            evt = recv_settlement(&mut settlement_rx) => {
                let Some(evt) = evt else { continue };
                let stake = state.positions.get(evt.position_id).map(|p| p.stake).unwrap_or(0.0);
                let out = ServerMessage::Settlement {
                    position_id: evt.position_id,
                    result: evt.result,
                    exit_price: evt.exit_price,
                    pnl: evt.payout - stake,
                };
                if send_message(&mut sender, &out).await.is_err() {
                    break;
                }
            }

            _ = hb_interval.tick() => {
                if !heartbeat.tick() {
                    info!("connection missed heartbeat three times, disconnecting");
                    break;
                }
            }
        }
    }

    for (_, handle) in tick_forwarders.drain() {
        handle.abort();
    }
    if let Some(identity) = &identity {
        state.bus.unsubscribe_settlements(identity.user_id());
    }
}

/// Awaits the next settlement event, or never resolves while no identity has
/// authenticated yet (`settlement_rx` is `None`) so the select arm above is a
/// no-op until authentication completes.
async fn recv_settlement(rx: &mut Option<mpsc::UnboundedReceiver<SettlementEvent>>) -> Option<SettlementEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_client_text(
    text: &str,
    state: &CoreState,
    sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    identity: &mut Option<Identity>,
    tick_tx: &mpsc::UnboundedSender<Tick>,
    tick_forwarders: &mut HashMap<String, JoinHandle<()>>,
    settlement_rx: &mut Option<mpsc::UnboundedReceiver<SettlementEvent>>,
) -> bool {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(err) => {
            let _ = send_message(sender, &ServerMessage::error("bad_request", err.to_string())).await;
            return true;
        }
    };

    match msg {
        ClientMessage::Authenticate { token } => match resolve_identity(&token) {
            Some(id) => {
                let rx = state.bus.subscribe_settlements(id.user_id());
                *settlement_rx = Some(rx);
                let user_id = id.user_id().to_string();
                *identity = Some(id);
                send_message(sender, &ServerMessage::Authenticated { user_id }).await.is_ok()
            }
            None => send_message(sender, &ServerMessage::error("auth", "invalid token")).await.is_ok(),
        },
        ClientMessage::Subscribe { symbols } => {
            for symbol in symbols {
                if tick_forwarders.contains_key(&symbol) {
                    continue;
                }
                if state.symbol_config(&symbol).is_none() {
                    let _ = send_message(sender, &ServerMessage::error("unknown_symbol", symbol)).await;
                    continue;
                }
                let mut rx = state.bus.subscribe_ticks(&symbol);
                let out = tick_tx.clone();
                let handle = tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(tick) => {
                                if out.send(tick).is_err() {
                                    break;
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
                tick_forwarders.insert(symbol, handle);
            }
            true
        }
        ClientMessage::Unsubscribe { symbols } => {
            for symbol in symbols {
                if let Some(handle) = tick_forwarders.remove(&symbol) {
                    handle.abort();
                }
            }
            true
        }
        ClientMessage::Ping => send_message(sender, &ServerMessage::Pong).await.is_ok(),
    }
}

async fn send_message(sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin), msg: &ServerMessage) -> Result<(), axum::Error> {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(err) => {
            warn!(error = %err, "failed to serialize outbound websocket message");
            Ok(())
        }
    }
}
