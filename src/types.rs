use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Price level as sent by the exchange: `[price, quantity]`, both decimal strings.
///
/// Kept as strings so persisted files carry the exact decimal text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel(pub String, pub String);

impl PriceLevel {
    pub fn new(price: impl Into<String>, quantity: impl Into<String>) -> Self {
        Self(price.into(), quantity.into())
    }

    pub fn price(&self) -> &str {
        &self.0
    }

    pub fn quantity(&self) -> &str {
        &self.1
    }
}

/// Incremental depth update (`<symbol>@depth@100ms`).
///
/// Field names follow the wire format so the same type is used for parsing
/// frames and for the line-delimited JSON output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    /// Event time, milliseconds since epoch (UTC)
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "U")]
    pub first_update_id: u64,
    #[serde(rename = "u")]
    pub final_update_id: u64,
    #[serde(rename = "b", default)]
    pub bids: Vec<PriceLevel>,
    #[serde(rename = "a", default)]
    pub asks: Vec<PriceLevel>,
}

impl DiffEvent {
    /// `None` when `E` is not a positive millisecond timestamp chrono can represent.
    pub fn event_time_utc(&self) -> Option<DateTime<Utc>> {
        if self.event_time <= 0 {
            return None;
        }
        DateTime::<Utc>::from_timestamp_millis(self.event_time)
    }

    /// True if this event's update range covers `update_id`.
    pub fn covers(&self, update_id: u64) -> bool {
        self.first_update_id <= update_id && update_id <= self.final_update_id
    }
}

/// REST depth response body: `GET /depth?symbol=..&limit=..`
#[derive(Debug, Clone, Deserialize)]
pub struct RestDepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Partial book depth frame (`<symbol>@depth<N>@100ms`). Same shape as the REST body.
pub type WsPartialDepthMessage = RestDepthSnapshot;

/// Full-depth book at a known update id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Not persisted: the symbol is part of the file path.
    #[serde(skip)]
    pub symbol: String,
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    #[serde(rename = "capturedAt", with = "captured_at_format")]
    pub captured_at: DateTime<Utc>,
}

impl Snapshot {
    /// Build a snapshot stamped with the receipt time, truncated to microseconds
    /// so it survives a write/read cycle unchanged.
    pub fn from_rest(symbol: &str, body: RestDepthSnapshot, received_at: DateTime<Utc>) -> Self {
        let captured_at =
            DateTime::<Utc>::from_timestamp_micros(received_at.timestamp_micros()).unwrap_or(received_at);
        Self {
            symbol: symbol.to_string(),
            last_update_id: body.last_update_id,
            bids: body.bids,
            asks: body.asks,
            captured_at,
        }
    }
}

/// `capturedAt` text format: `2024-01-31 23:59:59.123456+00:00`
pub mod captured_at_format {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f%:z";

    pub fn format(dt: &DateTime<Utc>) -> String {
        dt.format(FORMAT).to_string()
    }

    pub fn parse(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_str(s, FORMAT).map(|dt| dt.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A diff event after sequence validation.
///
/// `usable` records form gap-free stretches anchored on the snapshot named by
/// `snapshot_update_id`. Records with `gap_detected` mark where contiguity broke
/// and must not be applied during replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedRecord {
    #[serde(flatten)]
    pub event: DiffEvent,
    pub usable: bool,
    pub gap_detected: bool,
    #[serde(default)]
    pub snapshot_update_id: Option<u64>,
}

impl ValidatedRecord {
    pub fn usable(event: DiffEvent, snapshot_update_id: u64) -> Self {
        Self {
            event,
            usable: true,
            gap_detected: false,
            snapshot_update_id: Some(snapshot_update_id),
        }
    }

    pub fn gap(event: DiffEvent) -> Self {
        Self {
            event,
            usable: false,
            gap_detected: true,
            snapshot_update_id: None,
        }
    }
}

/// Subscription request sent on connect.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeRequest {
    pub method: &'static str,
    pub params: Vec<String>,
    pub id: u64,
}

impl SubscribeRequest {
    pub fn subscribe(channel: String, id: u64) -> Self {
        Self {
            method: "SUBSCRIBE",
            params: vec![channel],
            id,
        }
    }
}

/// Output file identity: one file per `(symbol, date, batch_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RotationKey {
    pub symbol: String,
    pub date: NaiveDate,
    pub batch_index: u64,
}

impl std::fmt::Display for RotationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.symbol, self.date.format("%Y%m%d"), self.batch_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_depth_update() {
        let text = r#"{"e":"depthUpdate","E":1672515782136,"s":"BNBBTC","U":157,"u":160,
            "b":[["0.0024","10"]],"a":[["0.0026","100"],["0.0027","0.00000000"]]}"#;
        let event: DiffEvent = serde_json::from_str(text).unwrap();
        assert_eq!(event.event_type, "depthUpdate");
        assert_eq!(event.symbol, "BNBBTC");
        assert_eq!(event.first_update_id, 157);
        assert_eq!(event.final_update_id, 160);
        assert_eq!(event.bids, vec![PriceLevel::new("0.0024", "10")]);
        assert_eq!(event.asks[1].quantity(), "0.00000000");
        assert!(event.covers(157));
        assert!(event.covers(160));
        assert!(!event.covers(161));
        assert_eq!(event.event_time_utc().unwrap().timestamp_millis(), 1672515782136);
    }

    #[test]
    fn test_event_time_out_of_range() {
        let text = r#"{"e":"depthUpdate","E":0,"s":"BNBBTC","U":1,"u":2,"b":[],"a":[]}"#;
        let mut event: DiffEvent = serde_json::from_str(text).unwrap();
        assert!(event.event_time_utc().is_none());
        event.event_time = i64::MAX;
        assert!(event.event_time_utc().is_none());
        event.event_time = -5;
        assert!(event.event_time_utc().is_none());
    }

    #[test]
    fn test_parse_rest_snapshot() {
        let text = r#"{"lastUpdateId":1027024,"bids":[["4.00000000","431.00000000"]],"asks":[["4.00000200","12.00000000"]]}"#;
        let body: RestDepthSnapshot = serde_json::from_str(text).unwrap();
        let received = DateTime::parse_from_rfc3339("2024-03-01T10:00:00.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        let snapshot = Snapshot::from_rest("BNBBTC", body, received);
        assert_eq!(snapshot.last_update_id, 1027024);
        assert_eq!(snapshot.bids[0].price(), "4.00000000");
        // truncated to micros
        assert_eq!(snapshot.captured_at.timestamp_subsec_nanos(), 123_456_000);
    }

    #[test]
    fn test_captured_at_format() {
        let dt = DateTime::parse_from_rfc3339("2024-01-31T23:59:59.000042Z")
            .unwrap()
            .with_timezone(&Utc);
        let text = captured_at_format::format(&dt);
        assert_eq!(text, "2024-01-31 23:59:59.000042+00:00");
        assert_eq!(captured_at_format::parse(&text).unwrap(), dt);
    }

    #[test]
    fn test_subscribe_request_json() {
        let req = SubscribeRequest::subscribe("btcusdt@depth@100ms".to_string(), 7);
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"method":"SUBSCRIBE","params":["btcusdt@depth@100ms"],"id":7}"#);
    }

    #[test]
    fn test_validated_record_json_is_flat() {
        let event = DiffEvent {
            event_type: "depthUpdate".to_string(),
            event_time: 1,
            symbol: "BTCUSDT".to_string(),
            first_update_id: 10,
            final_update_id: 12,
            bids: vec![],
            asks: vec![],
        };
        let json = serde_json::to_value(ValidatedRecord::usable(event, 9)).unwrap();
        assert_eq!(json["U"], 10);
        assert_eq!(json["usable"], true);
        assert_eq!(json["snapshot_update_id"], 9);
    }
}
