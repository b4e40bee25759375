use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A request to run the tiered pipeline for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRequest {
    #[serde(default = "Uuid::new_v4")]
    pub run_id: Uuid,
    pub symbol: String,
    /// Market context handed to every agent unchanged (prices, indicators, ...).
    #[serde(default)]
    pub market: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub requested_at: DateTime<Utc>,
}

impl RunRequest {
    pub fn new(symbol: impl Into<String>, market: serde_json::Value) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            symbol: symbol.into().trim().to_ascii_uppercase(),
            market,
            requested_at: Utc::now(),
        }
    }
}
