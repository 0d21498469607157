//! Simulator trade data - orders, trades, positions, account, transfers
//!
//! Every entity carries a `changed` flag. Incremental pushes include only
//! flagged entities; the flag never reaches the wire or the snapshot file.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::core::types::{
    Direction, Offset, OrderStatus, PriceType, TimeCondition, VolumeCondition,
};

pub(crate) fn nan() -> f64 {
    f64::NAN
}

/// `null` on the wire means an invalid price, held as NaN.
pub(crate) fn nan_or_null<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub exchange_order_id: String,
    pub user_id: String,
    pub exchange_id: String,
    pub instrument_id: String,
    pub direction: Direction,
    pub offset: Offset,
    pub price_type: PriceType,
    pub volume_condition: VolumeCondition,
    pub time_condition: TimeCondition,
    pub limit_price: f64,
    pub volume_orign: i64,
    pub volume_left: i64,
    pub status: OrderStatus,
    /// Nanoseconds since epoch
    pub insert_date_time: i64,
    pub seqno: u64,
    #[serde(skip)]
    pub changed: bool,
}

impl Order {
    pub fn symbol(&self) -> String {
        format!("{}.{}", self.exchange_id, self.instrument_id)
    }

    pub fn is_alive(&self) -> bool {
        self.status == OrderStatus::Alive
    }

    /// Terminal transition. Never goes back to ALIVE.
    pub fn finish(&mut self) {
        self.status = OrderStatus::Finished;
        self.changed = true;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub exchange_trade_id: String,
    pub order_id: String,
    pub user_id: String,
    pub exchange_id: String,
    pub instrument_id: String,
    pub direction: Direction,
    pub offset: Offset,
    pub volume: i64,
    pub price: f64,
    pub commission: f64,
    pub trade_date_time: i64,
    pub seqno: u64,
    #[serde(skip)]
    pub changed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Position {
    pub user_id: String,
    pub exchange_id: String,
    pub instrument_id: String,

    pub volume_long_today: i64,
    pub volume_long_his: i64,
    pub volume_long: i64,
    pub volume_long_frozen_today: i64,
    pub volume_long_frozen_his: i64,
    pub volume_long_frozen: i64,
    pub volume_short_today: i64,
    pub volume_short_his: i64,
    pub volume_short: i64,
    pub volume_short_frozen_today: i64,
    pub volume_short_frozen_his: i64,
    pub volume_short_frozen: i64,

    #[serde(default = "nan", deserialize_with = "nan_or_null")]
    pub open_price_long: f64,
    #[serde(default = "nan", deserialize_with = "nan_or_null")]
    pub open_price_short: f64,
    pub open_cost_long: f64,
    pub open_cost_short: f64,
    #[serde(default = "nan", deserialize_with = "nan_or_null")]
    pub position_price_long: f64,
    #[serde(default = "nan", deserialize_with = "nan_or_null")]
    pub position_price_short: f64,
    pub position_cost_long: f64,
    pub position_cost_short: f64,

    pub margin_long: f64,
    pub margin_short: f64,
    pub margin: f64,
    pub frozen_margin: f64,

    #[serde(default = "nan", deserialize_with = "nan_or_null")]
    pub float_profit_long: f64,
    #[serde(default = "nan", deserialize_with = "nan_or_null")]
    pub float_profit_short: f64,
    #[serde(default = "nan", deserialize_with = "nan_or_null")]
    pub float_profit: f64,
    #[serde(default = "nan", deserialize_with = "nan_or_null")]
    pub position_profit_long: f64,
    #[serde(default = "nan", deserialize_with = "nan_or_null")]
    pub position_profit_short: f64,
    #[serde(default = "nan", deserialize_with = "nan_or_null")]
    pub position_profit: f64,

    /// Mark price the profit fields were last computed with
    #[serde(default = "nan", deserialize_with = "nan_or_null")]
    pub last_price: f64,

    #[serde(skip)]
    pub changed: bool,
}

impl Position {
    pub fn new(user_id: &str, exchange_id: &str, instrument_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            exchange_id: exchange_id.to_string(),
            instrument_id: instrument_id.to_string(),
            open_price_long: f64::NAN,
            open_price_short: f64::NAN,
            position_price_long: f64::NAN,
            position_price_short: f64::NAN,
            float_profit_long: f64::NAN,
            float_profit_short: f64::NAN,
            float_profit: f64::NAN,
            position_profit_long: f64::NAN,
            position_profit_short: f64::NAN,
            position_profit: f64::NAN,
            last_price: f64::NAN,
            changed: true,
            ..Default::default()
        }
    }

    /// Rebuild totals, margins and average prices from the volume fields.
    /// Average prices are only derived for a side that still has volume.
    pub fn recompute(&mut self, margin_per_lot: f64, volume_multiple: f64) {
        self.volume_long_frozen = self.volume_long_frozen_his.saturating_add(self.volume_long_frozen_today);
        self.volume_short_frozen = self.volume_short_frozen_his.saturating_add(self.volume_short_frozen_today);
        self.volume_long = self.volume_long_his.saturating_add(self.volume_long_today);
        self.volume_short = self.volume_short_his.saturating_add(self.volume_short_today);
        self.margin_long = margin_per_lot * self.volume_long as f64;
        self.margin_short = margin_per_lot * self.volume_short as f64;
        self.margin = self.margin_long + self.margin_short;
        if self.volume_long > 0 {
            let units = self.volume_long as f64 * volume_multiple;
            self.open_price_long = self.open_cost_long / units;
            self.position_price_long = self.position_cost_long / units;
        }
        if self.volume_short > 0 {
            let units = self.volume_short as f64 * volume_multiple;
            self.open_price_short = self.open_cost_short / units;
            self.position_price_short = self.position_cost_short / units;
        }
        self.changed = true;
    }

    /// Revalue against `mark`.
    pub fn mark_to_market(&mut self, mark: f64, volume_multiple: f64) {
        self.last_price = mark;
        let long_value = mark * self.volume_long as f64 * volume_multiple;
        let short_value = mark * self.volume_short as f64 * volume_multiple;
        self.position_profit_long = long_value - self.position_cost_long;
        self.position_profit_short = self.position_cost_short - short_value;
        self.position_profit = self.position_profit_long + self.position_profit_short;
        self.float_profit_long = long_value - self.open_cost_long;
        self.float_profit_short = self.open_cost_short - short_value;
        self.float_profit = self.float_profit_long + self.float_profit_short;
        self.changed = true;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    pub currency: String,
    pub pre_balance: f64,
    pub static_balance: f64,
    pub deposit: f64,
    pub withdraw: f64,
    pub commission: f64,
    pub close_profit: f64,
    pub position_profit: f64,
    pub float_profit: f64,
    pub margin: f64,
    pub frozen_margin: f64,
    pub available: f64,
    pub balance: f64,
    /// NaN exactly when balance is zero
    #[serde(default = "nan", deserialize_with = "nan_or_null")]
    pub risk_ratio: f64,
    #[serde(skip)]
    pub changed: bool,
}

impl Account {
    pub fn new(user_id: &str, currency: &str, initial_balance: f64) -> Self {
        Self {
            user_id: user_id.to_string(),
            currency: currency.to_string(),
            pre_balance: initial_balance,
            static_balance: initial_balance,
            available: initial_balance,
            balance: initial_balance,
            risk_ratio: if initial_balance == 0.0 { f64::NAN } else { 0.0 },
            changed: true,
            ..Default::default()
        }
    }

    /// Derive balance, available and risk ratio from the aggregated figures.
    pub fn settle(&mut self, position_profit: f64, float_profit: f64, margin: f64, frozen_margin: f64) {
        self.position_profit = position_profit;
        self.float_profit = float_profit;
        self.margin = margin;
        self.frozen_margin = frozen_margin;
        self.balance = self.static_balance + self.float_profit + self.close_profit - self.commission;
        self.available = self.balance - self.margin - self.frozen_margin;
        self.risk_ratio = if self.balance != 0.0 && self.balance.is_finite() && self.available.is_finite() {
            1.0 - self.available / self.balance
        } else {
            f64::NAN
        };
        self.changed = true;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferLog {
    pub currency: String,
    pub amount: f64,
    pub datetime: i64,
    pub error_id: i32,
    pub error_msg: String,
    #[serde(skip)]
    pub changed: bool,
}

/// Everything one simulated account owns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeData {
    pub user_id: String,
    pub account: Account,
    pub orders: BTreeMap<String, Order>,
    pub trades: BTreeMap<String, Trade>,
    /// Keyed by `EXCHANGE.INSTRUMENT`
    pub positions: BTreeMap<String, Position>,
    /// Keyed by transfer sequence id
    pub transfers: BTreeMap<String, TransferLog>,
}

impl TradeData {
    pub fn new(user_id: &str, currency: &str, initial_balance: f64) -> Self {
        Self {
            user_id: user_id.to_string(),
            account: Account::new(user_id, currency, initial_balance),
            ..Default::default()
        }
    }

    /// Flag every entity, so the next push is a full image.
    pub fn mark_all_changed(&mut self) {
        self.account.changed = true;
        self.orders.values_mut().for_each(|o| o.changed = true);
        self.trades.values_mut().for_each(|t| t.changed = true);
        self.positions.values_mut().for_each(|p| p.changed = true);
        self.transfers.values_mut().for_each(|t| t.changed = true);
    }

    pub fn clear_changed(&mut self) {
        self.account.changed = false;
        self.orders.values_mut().for_each(|o| o.changed = false);
        self.trades.values_mut().for_each(|t| t.changed = false);
        self.positions.values_mut().for_each(|p| p.changed = false);
        self.transfers.values_mut().for_each(|t| t.changed = false);
    }

    /// Client view of the account: every entity when `full`, otherwise only
    /// the changed ones. Empty sections are left out.
    pub fn to_snapshot(&self, full: bool) -> Value {
        let mut node = Map::new();
        node.insert("user_id".to_string(), Value::String(self.user_id.clone()));
        put_section(&mut node, "orders", section(&self.orders, full, |o| o.changed));
        put_section(&mut node, "trades", section(&self.trades, full, |t| t.changed));
        put_section(&mut node, "positions", section(&self.positions, full, |p| p.changed));
        put_section(&mut node, "transfers", section(&self.transfers, full, |t| t.changed));
        if full || self.account.changed {
            let mut accounts = Map::new();
            accounts.insert(self.account.currency.clone(), to_value(&self.account));
            node.insert("accounts".to_string(), Value::Object(accounts));
        }
        Value::Object(node)
    }
}

fn section<T: Serialize>(map: &BTreeMap<String, T>, full: bool, changed: impl Fn(&T) -> bool) -> Map<String, Value> {
    map.iter()
        .filter(|(_, v)| full || changed(v))
        .map(|(k, v)| (k.clone(), to_value(v)))
        .collect()
}

fn put_section(node: &mut Map<String, Value>, name: &str, section: Map<String, Value>) {
    if !section.is_empty() {
        node.insert(name.to_string(), Value::Object(section));
    }
}

fn to_value<T: Serialize>(v: &T) -> Value {
    // Entities hold only strings, numbers and wire enums; NaN becomes null.
    serde_json::to_value(v).unwrap_or(Value::Null)
}
