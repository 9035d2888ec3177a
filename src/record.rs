use crate::error::OrderError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_unix_ns() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Buy,
    Sell,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
        }
    }
}

impl FromStr for Action {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(Action::Buy),
            "SELL" => Ok(Action::Sell),
            _ => Err(OrderError::InvalidAction(s.to_string())),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbound trade order. Opaque to the feed apart from validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub client_id: u32,
    pub action: Action,
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
}

impl Order {
    pub fn new(client_id: u32, action: Action, symbol: impl Into<String>, price: Decimal) -> Self {
        Self { client_id, action, symbol: symbol.into(), price }
    }

    /// Parse the JSON submission payload sent by order sources, e.g.
    /// `{"client": 1, "action": "BUY", "stock": "AAPL", "price": 170.20}`.
    ///
    /// `client_id` and `symbol` are accepted as aliases; `price` may be a
    /// number or a numeric string.
    pub fn from_json(bytes: &[u8]) -> Result<Self, OrderError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| OrderError::NotJson(e.to_string()))?;
        let obj = value
            .as_object()
            .ok_or_else(|| OrderError::NotJson("expected a JSON object".into()))?;

        let client = field(obj, &["client", "client_id"], "client")?;
        let client_id = client
            .as_u64()
            .and_then(|c| u32::try_from(c).ok())
            .ok_or_else(|| OrderError::InvalidClientId(client.to_string()))?;

        let action = field(obj, &["action"], "action")?;
        let action = action
            .as_str()
            .ok_or_else(|| OrderError::InvalidAction(action.to_string()))?
            .parse::<Action>()?;

        let symbol = field(obj, &["stock", "symbol"], "stock")?
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(OrderError::InvalidSymbol)?
            .to_string();

        let price = parse_price(field(obj, &["price"], "price")?)?;

        Ok(Self { client_id, action, symbol, price })
    }

    /// Encode in the submission format. The price goes out as a string so
    /// its decimal digits survive unchanged.
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "client": self.client_id,
            "action": self.action.as_str(),
            "stock": self.symbol,
            "price": self.price.to_string(),
        })
        .to_string()
    }
}

fn field<'a>(
    obj: &'a Map<String, Value>,
    names: &[&str],
    label: &'static str,
) -> Result<&'a Value, OrderError> {
    names
        .iter()
        .filter_map(|n| obj.get(*n))
        .find(|v| !v.is_null())
        .ok_or(OrderError::MissingField(label))
}

fn parse_price(value: &Value) -> Result<Decimal, OrderError> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        other => return Err(OrderError::InvalidPrice(other.to_string())),
    };
    match Decimal::from_str(&text) {
        Ok(price) => Ok(price),
        Err(_) => Decimal::from_scientific(&text).map_err(|_| OrderError::InvalidPrice(text)),
    }
}

/// An order with its position in the authoritative log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub sequence: u64,
    pub published_unix_ns: u128, // wall clock at append, informational only
    pub order: Order,
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} client {} {} {} at ${}",
            self.sequence,
            self.order.client_id,
            self.order.action,
            self.order.symbol,
            self.order.price
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairRequest {
    pub client_id: u32,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairResponse {
    Found(Record),
    /// The sequence was never assigned; `log_len` is the length at lookup.
    NotFound { sequence: u64, log_len: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureHeader {
    pub version: u16,
    pub created_unix_ns: u128,
    pub client_id: u32,
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureFrame {
    Header(CaptureHeader),
    Record(Record),
}
