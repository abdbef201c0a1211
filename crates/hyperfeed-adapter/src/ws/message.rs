/*
[INPUT]:  Raw gateway text frames and subscription intents
[OUTPUT]: Outbound JSON frames and parsed GatewayMessage values
[POS]:    WebSocket layer - message framing and validation
[UPDATE]: When adding new channels or changing frame format
*/

use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{AdapterError, Result};
use crate::types::{Channel, L2BookData, TradeData};

/// A (channel, symbol) pair the client keeps subscribed across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub channel: Channel,
    pub symbol: String,
}

impl Subscription {
    pub fn new(channel: Channel, symbol: impl Into<String>) -> Self {
        Self {
            channel,
            symbol: symbol.into(),
        }
    }
}

/// Parsed market data frame, routed by `(channel, symbol)`.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayMessage {
    Trades { symbol: String, trades: Vec<TradeData> },
    L2Book(L2BookData),
}

impl GatewayMessage {
    pub fn channel(&self) -> Channel {
        match self {
            GatewayMessage::Trades { .. } => Channel::Trades,
            GatewayMessage::L2Book(_) => Channel::L2Book,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            GatewayMessage::Trades { symbol, .. } => symbol,
            GatewayMessage::L2Book(book) => &book.coin,
        }
    }
}

/// Everything the receive loop can get out of one text frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inbound {
    Messages(Vec<GatewayMessage>),
    Pong,
    Ack(Value),
    ServerError(String),
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    channel: String,
    #[serde(default)]
    data: Value,
}

pub(crate) fn subscribe_frame(subscription: &Subscription) -> Value {
    subscription_frame("subscribe", subscription)
}

pub(crate) fn unsubscribe_frame(subscription: &Subscription) -> Value {
    subscription_frame("unsubscribe", subscription)
}

pub(crate) fn ping_frame() -> Value {
    json!({ "method": "ping" })
}

fn subscription_frame(method: &str, subscription: &Subscription) -> Value {
    json!({
        "method": method,
        "subscription": {
            "type": subscription.channel.as_str(),
            "coin": subscription.symbol,
        }
    })
}

pub(crate) fn parse_frame(text: &str) -> Result<Inbound> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|err| AdapterError::Protocol(format!("invalid envelope: {err}")))?;

    match envelope.channel.as_str() {
        "pong" => Ok(Inbound::Pong),
        "subscriptionResponse" => Ok(Inbound::Ack(envelope.data)),
        "error" => Ok(Inbound::ServerError(match envelope.data {
            Value::String(message) => message,
            other => other.to_string(),
        })),
        "trades" => {
            let trades: Vec<TradeData> = serde_json::from_value(envelope.data)
                .map_err(|err| AdapterError::Protocol(format!("invalid trades payload: {err}")))?;
            if trades.is_empty() {
                return Err(AdapterError::Protocol("empty trades payload".to_string()));
            }
            Ok(Inbound::Messages(group_trades(trades)))
        }
        "l2Book" => {
            let book: L2BookData = serde_json::from_value(envelope.data)
                .map_err(|err| AdapterError::Protocol(format!("invalid l2Book payload: {err}")))?;
            if book.coin.is_empty() {
                return Err(AdapterError::Protocol("l2Book payload without coin".to_string()));
            }
            Ok(Inbound::Messages(vec![GatewayMessage::L2Book(book)]))
        }
        other => Ok(Inbound::Unknown(other.to_string())),
    }
}

/// Splits a trades batch into one message per coin, keeping arrival order.
fn group_trades(trades: Vec<TradeData>) -> Vec<GatewayMessage> {
    let mut grouped: Vec<(String, Vec<TradeData>)> = Vec::new();
    for trade in trades {
        match grouped.iter_mut().find(|(coin, _)| *coin == trade.coin) {
            Some((_, batch)) => batch.push(trade),
            None => grouped.push((trade.coin.clone(), vec![trade])),
        }
    }

    grouped
        .into_iter()
        .map(|(symbol, trades)| GatewayMessage::Trades { symbol, trades })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BookUpdateKind, Side};
    use rust_decimal::Decimal;

    #[test]
    fn subscribe_frame_uses_type_and_coin() {
        let frame = subscribe_frame(&Subscription::new(Channel::L2Book, "ETH"));
        assert_eq!(
            frame,
            json!({"method": "subscribe", "subscription": {"type": "l2Book", "coin": "ETH"}})
        );
        assert_eq!(
            unsubscribe_frame(&Subscription::new(Channel::Trades, "BTC"))["method"],
            "unsubscribe"
        );
    }

    #[test]
    fn parses_trades_frame() {
        let text = r#"{"channel":"trades","data":[
            {"coin":"BTC","side":"B","px":"100.5","sz":"0.1","time":1700000000000,"tid":7}
        ]}"#;

        let Inbound::Messages(messages) = parse_frame(text).expect("parse") else {
            panic!("expected messages");
        };

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].channel(), Channel::Trades);
        assert_eq!(messages[0].symbol(), "BTC");
        let GatewayMessage::Trades { trades, .. } = &messages[0] else {
            panic!("expected trades");
        };
        assert_eq!(trades[0].side, Side::Bid);
        assert_eq!(trades[0].px, Decimal::new(1005, 1));
    }

    #[test]
    fn splits_mixed_coin_trades_batch() {
        let text = r#"{"channel":"trades","data":[
            {"coin":"BTC","side":"B","px":"100","sz":"1","time":1},
            {"coin":"ETH","side":"A","px":"10","sz":"1","time":2},
            {"coin":"BTC","side":"A","px":"101","sz":"1","time":3}
        ]}"#;

        let Inbound::Messages(messages) = parse_frame(text).expect("parse") else {
            panic!("expected messages");
        };

        let symbols: Vec<&str> = messages.iter().map(GatewayMessage::symbol).collect();
        assert_eq!(symbols, vec!["BTC", "ETH"]);
    }

    #[test]
    fn parses_l2_book_delta() {
        let text = r#"{"channel":"l2Book","data":{"coin":"ETH","time":5,"seq":9,"type":"delta",
            "levels":[[{"px":"99","sz":"0"}],[]]}}"#;

        let Inbound::Messages(messages) = parse_frame(text).expect("parse") else {
            panic!("expected messages");
        };
        let GatewayMessage::L2Book(book) = &messages[0] else {
            panic!("expected book");
        };
        assert_eq!(book.kind, BookUpdateKind::Delta);
        assert_eq!(book.seq, 9);
        assert!(book.levels.0[0].sz.is_zero());
    }

    #[test]
    fn control_frames_are_classified() {
        assert_eq!(parse_frame(r#"{"channel":"pong"}"#).expect("pong"), Inbound::Pong);
        assert!(matches!(
            parse_frame(r#"{"channel":"subscriptionResponse","data":{"method":"subscribe"}}"#),
            Ok(Inbound::Ack(_))
        ));
        assert_eq!(
            parse_frame(r#"{"channel":"error","data":"Invalid subscription"}"#).expect("error"),
            Inbound::ServerError("Invalid subscription".to_string())
        );
        assert_eq!(
            parse_frame(r#"{"channel":"allMids","data":{}}"#).expect("unknown"),
            Inbound::Unknown("allMids".to_string())
        );
    }

    #[test]
    fn malformed_frames_are_protocol_errors() {
        assert!(matches!(parse_frame("not json"), Err(AdapterError::Protocol(_))));
        assert!(matches!(
            parse_frame(r#"{"channel":"trades","data":[]}"#),
            Err(AdapterError::Protocol(_))
        ));
        assert!(matches!(
            parse_frame(r#"{"channel":"l2Book","data":{"coin":"BTC","levels":[[]]}}"#),
            Err(AdapterError::Protocol(_))
        ));
    }
}
