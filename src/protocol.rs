//! Client-facing JSON protocol shared by the gateway and the workers.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::types::{Direction, NoticeLevel, Offset, PriceType, TimeCondition, VolumeCondition};

/// Only the action tag, used by the gateway to pick out logins.
#[derive(Debug, Deserialize)]
pub struct AidOnly {
    pub aid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReqLogin {
    /// Broker name, one of the configured `[[brokers]]`
    pub bid: String,
    pub user_name: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionOrder {
    #[serde(default)]
    pub order_id: Option<String>,
    pub user_id: String,
    pub exchange_id: String,
    pub instrument_id: String,
    pub direction: Direction,
    pub offset: Offset,
    #[serde(default)]
    pub price_type: PriceType,
    #[serde(default)]
    pub volume_condition: VolumeCondition,
    #[serde(default)]
    pub time_condition: TimeCondition,
    pub volume: i64,
    #[serde(default)]
    pub limit_price: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionCancel {
    pub order_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionTransfer {
    #[serde(default)]
    pub currency: String,
    pub amount: f64,
}

/// Requests a simulator worker understands.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "aid", rename_all = "snake_case")]
pub enum Action {
    ReqLogin(ReqLogin),
    InsertOrder(ActionOrder),
    CancelOrder(ActionCancel),
    ReqTransfer(ActionTransfer),
    PeekMessage,
}

/// Severity-tagged message for the client.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub code: i32,
    pub level: NoticeLevel,
    pub content: String,
}

impl Notice {
    pub fn info(content: impl Into<String>) -> Self {
        Self { code: 0, level: NoticeLevel::Info, content: content.into() }
    }

    pub fn warning(content: impl Into<String>) -> Self {
        Self { code: 1, level: NoticeLevel::Warning, content: content.into() }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self { code: 1, level: NoticeLevel::Error, content: content.into() }
    }

    /// `{"aid":"rtn_data","data":[{"notify":{"<seq>":{...}}}]}`
    pub fn to_json(&self, seq: u64) -> String {
        json!({
            "aid": "rtn_data",
            "data": [{
                "notify": {
                    seq.to_string(): {
                        "type": "MESSAGE",
                        "level": self.level.as_str(),
                        "code": self.code,
                        "content": self.content,
                    }
                }
            }]
        })
        .to_string()
    }
}

/// Broker list sent to every new connection.
pub fn rtn_brokers(brokers: &[String]) -> String {
    json!({ "aid": "rtn_brokers", "brokers": brokers }).to_string()
}
