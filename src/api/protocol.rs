// =============================================================================
// WebSocket wire protocol — spec.md §6, §9
// =============================================================================
//
// The source this core is distilled from passes message payloads around as
// loosely-typed maps. §9 flags that as a "dynamic dispatch" smell to replace
// with a closed tagged union: every message here is one variant of a
// `#[serde(tag = "type", content = "payload")]` enum, so an unrecognized
// `type` fails to deserialize instead of silently falling through.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Direction, SettlementResult};

/// Messages a connected client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate { token: String },
    Subscribe { symbols: Vec<String> },
    Unsubscribe { symbols: Vec<String> },
    Ping,
}

/// Messages the server may send.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Authenticated { user_id: String },
    Tick {
        symbol: String,
        price: f64,
        bid: f64,
        ask: f64,
        change: f64,
        change_percent: f64,
        timestamp: DateTime<Utc>,
    },
    Settlement {
        position_id: Uuid,
        result: SettlementResult,
        exit_price: f64,
        pnl: f64,
    },
    Error { code: String, message: String },
    Pong,
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error { code: code.into(), message: message.into() }
    }
}

/// Request body for the `place_trade` REST operation (spec.md §6).
#[derive(Debug, Clone, Deserialize)]
pub struct PlaceTradeRequest {
    pub user_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub stake: f64,
    pub duration_secs: i64,
    pub account_kind: crate::types::AccountKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaceTradeResponse {
    pub position_id: Uuid,
    pub entry_price: f64,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_authenticate_round_trips() {
        let raw = r#"{"type":"authenticate","payload":{"token":"abc"}}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        matches!(msg, ClientMessage::Authenticate { token } if token == "abc");
    }

    #[test]
    fn client_message_rejects_unknown_tag() {
        let raw = r#"{"type":"not_a_real_type","payload":{}}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn server_tick_message_serializes_tagged() {
        let msg = ServerMessage::Tick {
            symbol: "EUR/USD-OTC".into(),
            price: 1.1,
            bid: 1.0995,
            ask: 1.1005,
            change: 0.0005,
            change_percent: 0.045,
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "tick");
        assert_eq!(value["payload"]["symbol"], "EUR/USD-OTC");
    }
}
