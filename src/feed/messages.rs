//! Wire format of the upstream feed.
//!
//! Inbound frames are JSON objects discriminated by `type`. Every shape the
//! recorder understands is a variant of [`FeedMessage`], so dispatch is a
//! single exhaustive match.

use serde::Deserialize;

use crate::error::FrameError;
use crate::models::{is_valid_price, PriceLevel, Seq, Side, TimestampMs};

pub const CHANNEL_ORDERBOOK: &str = "orderbook_delta";
pub const CHANNEL_LIFECYCLE: &str = "market_lifecycle";

// =============================================================================
// Inbound
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    OrderbookSnapshot(SnapshotFrame),
    OrderbookDelta(DeltaFrame),
    MarketLifecycle(LifecycleFrame),
    /// Acknowledgement of a subscribe command.
    Subscribed(SubscribedFrame),
    Error(ErrorFrame),
    Heartbeat,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SnapshotFrame {
    pub market_ticker: String,
    pub seq: Seq,
    #[serde(default)]
    pub yes: Vec<[i64; 2]>,
    #[serde(default)]
    pub no: Vec<[i64; 2]>,
}

impl SnapshotFrame {
    /// Levels for one side, validated against the price scale.
    pub fn levels(&self, side: Side) -> Result<Vec<PriceLevel>, FrameError> {
        let raw = match side {
            Side::Yes => &self.yes,
            Side::No => &self.no,
        };
        raw.iter()
            .map(|&[price, quantity]| {
                if !is_valid_price(price) {
                    return Err(FrameError::PriceOutOfRange {
                        ticker: self.market_ticker.clone(),
                        price,
                    });
                }
                if quantity < 0 {
                    return Err(FrameError::NegativeQuantity {
                        ticker: self.market_ticker.clone(),
                        price,
                        quantity,
                    });
                }
                Ok(PriceLevel::new(price, quantity))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeltaFrame {
    pub market_ticker: String,
    pub seq: Seq,
    pub ts: TimestampMs,
    pub side: Side,
    pub price: i64,
    pub delta: i64,
}

impl DeltaFrame {
    pub fn validate(&self) -> Result<(), FrameError> {
        if !is_valid_price(self.price) {
            return Err(FrameError::PriceOutOfRange {
                ticker: self.market_ticker.clone(),
                price: self.price,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Created,
    Activated,
    Closed,
    Settled,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LifecycleFrame {
    pub market_ticker: String,
    pub event: LifecycleEvent,
    pub ts: TimestampMs,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscribedFrame {
    /// Id of the command being acknowledged.
    pub id: u64,
    pub sid: u64,
    #[serde(default)]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorFrame {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub msg: String,
}

/// Decode one text frame.
pub fn parse_frame(text: &str) -> Result<FeedMessage, FrameError> {
    Ok(serde_json::from_str(text)?)
}

// =============================================================================
// Outbound
// =============================================================================

/// Subscribe the order book channel for `tickers`.
pub fn subscribe_command(id: u64, tickers: &[String]) -> String {
    serde_json::json!({
        "id": id,
        "cmd": "subscribe",
        "params": {
            "channels": [CHANNEL_ORDERBOOK],
            "market_tickers": tickers,
        },
    })
    .to_string()
}

pub fn unsubscribe_command(id: u64, tickers: &[String]) -> String {
    serde_json::json!({
        "id": id,
        "cmd": "unsubscribe",
        "params": {
            "channels": [CHANNEL_ORDERBOOK],
            "market_tickers": tickers,
        },
    })
    .to_string()
}

/// Lifecycle notifications for every market (no ticker filter).
pub fn lifecycle_subscribe_command(id: u64) -> String {
    serde_json::json!({
        "id": id,
        "cmd": "subscribe",
        "params": {
            "channels": [CHANNEL_LIFECYCLE],
        },
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snapshot() {
        let msg = parse_frame(
            r#"{"type":"orderbook_snapshot","market_ticker":"MKT","seq":100,"yes":[[60,10]],"no":[]}"#,
        )
        .unwrap();
        let FeedMessage::OrderbookSnapshot(frame) = msg else {
            panic!("expected snapshot, got {msg:?}");
        };
        assert_eq!(frame.seq, 100);
        assert_eq!(frame.levels(Side::Yes).unwrap(), vec![PriceLevel::new(60, 10)]);
        assert!(frame.levels(Side::No).unwrap().is_empty());
    }

    #[test]
    fn test_parse_delta() {
        let msg = parse_frame(
            r#"{"type":"orderbook_delta","market_ticker":"MKT","seq":101,"ts":5,"side":"yes","price":60,"delta":-10}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            FeedMessage::OrderbookDelta(DeltaFrame {
                market_ticker: "MKT".into(),
                seq: 101,
                ts: 5,
                side: Side::Yes,
                price: 60,
                delta: -10,
            })
        );
    }

    #[test]
    fn test_parse_lifecycle_and_control() {
        let msg = parse_frame(
            r#"{"type":"market_lifecycle","market_ticker":"NEW","event":"created","ts":1}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            FeedMessage::MarketLifecycle(LifecycleFrame { event: LifecycleEvent::Created, .. })
        ));

        let msg = parse_frame(
            r#"{"type":"market_lifecycle","market_ticker":"NEW","event":"paused","ts":1}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            FeedMessage::MarketLifecycle(LifecycleFrame { event: LifecycleEvent::Other, .. })
        ));

        assert_eq!(parse_frame(r#"{"type":"heartbeat"}"#).unwrap(), FeedMessage::Heartbeat);
        assert_eq!(parse_frame(r#"{"type":"fill","x":1}"#).unwrap(), FeedMessage::Unknown);

        let msg = parse_frame(r#"{"type":"subscribed","id":4,"sid":9,"channel":"orderbook_delta"}"#)
            .unwrap();
        assert!(matches!(msg, FeedMessage::Subscribed(SubscribedFrame { id: 4, sid: 9, .. })));
    }

    #[test]
    fn test_malformed_frames() {
        assert!(parse_frame("not json").is_err());
        assert!(parse_frame(r#"{"market_ticker":"MKT"}"#).is_err());
        // Unknown side
        assert!(parse_frame(
            r#"{"type":"orderbook_delta","market_ticker":"MKT","seq":1,"ts":5,"side":"maybe","price":60,"delta":1}"#
        )
        .is_err());
    }

    #[test]
    fn test_level_validation() {
        let frame = SnapshotFrame {
            market_ticker: "MKT".into(),
            seq: 1,
            yes: vec![[100, 1]],
            no: vec![[40, -1]],
        };
        assert!(matches!(
            frame.levels(Side::Yes),
            Err(FrameError::PriceOutOfRange { price: 100, .. })
        ));
        assert!(matches!(
            frame.levels(Side::No),
            Err(FrameError::NegativeQuantity { quantity: -1, .. })
        ));
    }

    #[test]
    fn test_commands() {
        let cmd: serde_json::Value =
            serde_json::from_str(&subscribe_command(7, &["A".into(), "B".into()])).unwrap();
        assert_eq!(cmd["id"], 7);
        assert_eq!(cmd["cmd"], "subscribe");
        assert_eq!(cmd["params"]["channels"][0], CHANNEL_ORDERBOOK);
        assert_eq!(cmd["params"]["market_tickers"][1], "B");

        let cmd: serde_json::Value = serde_json::from_str(&lifecycle_subscribe_command(1)).unwrap();
        assert_eq!(cmd["params"]["channels"][0], CHANNEL_LIFECYCLE);
        assert!(cmd["params"].get("market_tickers").is_none());

        let cmd: serde_json::Value =
            serde_json::from_str(&unsubscribe_command(8, &["A".into()])).unwrap();
        assert_eq!(cmd["cmd"], "unsubscribe");
    }
}
