/*
[INPUT]:  Gateway protocol identifiers and serde requirements
[OUTPUT]: Typed Rust enums with serialization support
[POS]:    Data layer - type definitions for gateway communication
[UPDATE]: When the gateway adds channels or update kinds
*/

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Streaming channels the gateway serves per symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "trades")]
    Trades,
    #[serde(rename = "l2Book", alias = "l2book")]
    L2Book,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Trades => "trades",
            Channel::L2Book => "l2Book",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "trades" => Ok(Channel::Trades),
            "l2Book" | "l2book" => Ok(Channel::L2Book),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// Aggressor side of a trade print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "B")]
    Bid,
    #[serde(rename = "A")]
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookUpdateKind {
    Snapshot,
    Delta,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_parses_wire_names() {
        assert_eq!("trades".parse::<Channel>(), Ok(Channel::Trades));
        assert_eq!("l2Book".parse::<Channel>(), Ok(Channel::L2Book));
        assert!("candles".parse::<Channel>().is_err());
    }

    #[test]
    fn channel_serializes_as_wire_name() {
        let value = serde_json::to_value(Channel::L2Book).expect("serialize");
        assert_eq!(value, serde_json::json!("l2Book"));
    }
}
