//! Matching & account engine - one simulated account, single-threaded
//!
//! Requests are applied strictly in arrival order. Fills are simulated
//! against the instrument table's top of book; nothing here is an exchange
//! matching engine.
//!
//! Every mutation ends with [`SimEngine::refresh`], so the account identity
//! `available + margin + frozen_margin == balance` holds between requests.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error};

use super::instrument::InstrumentTable;
use super::model::{Order, Position, Trade, TradeData, TransferLog};
use crate::core::types::{Direction, Offset, OrderStatus, PriceType, ProductClass};
use crate::protocol::{ActionCancel, ActionOrder, ActionTransfer, Notice};

/// Limit price tolerance against the price tick, in ticks
const TICK_TOLERANCE: f64 = 0.001;
/// Tolerance against the price-limit band
const BAND_TOLERANCE: f64 = 0.0001;

/// Recoverable domain rejections. The message is shown to the client.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Rejection {
    #[error("order rejected: duplicate order number")]
    DuplicateOrder,

    #[error("order rejected: user id in order does not match")]
    OrderUserMismatch,

    #[error("order rejected: unknown instrument {0}")]
    UnknownInstrument(String),

    #[error("order rejected: only futures can be traded")]
    NotFutures,

    #[error("order rejected: volume must be greater than 0")]
    NonPositiveVolume,

    #[error("order rejected: price {price} is not a multiple of tick {tick}")]
    OffTick { price: f64, tick: f64 },

    #[error("order rejected: insufficient margin, required {required}, available {available}")]
    InsufficientMargin { required: f64, available: f64 },

    #[error("order rejected: close volume exceeds position")]
    CloseExceedsPosition,

    #[error("order rejected: price above upper limit")]
    AboveUpperLimit,

    #[error("order rejected: price below lower limit")]
    BelowLowerLimit,

    #[error("cancel rejected: user id in request does not match")]
    CancelUserMismatch,

    #[error("order not found")]
    OrderNotFound,
}

/// Engine state written to the snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub data: TradeData,
    pub last_seq_no: u64,
    pub transfer_seq: u64,
}

pub struct SimEngine {
    user_id: String,
    currency: String,
    instruments: InstrumentTable,
    data: TradeData,
    /// Ids of orders that may still trade, in insertion order
    alive: Vec<String>,
    last_seq_no: u64,
    transfer_seq: u64,
    peeking: bool,
    something_changed: bool,
    unsaved: bool,
    notices: Vec<Notice>,
}

impl SimEngine {
    pub fn new(instruments: InstrumentTable, currency: &str, initial_balance: f64) -> Self {
        Self {
            user_id: String::new(),
            currency: currency.to_string(),
            instruments,
            data: TradeData::new("", currency, initial_balance),
            alive: Vec::new(),
            last_seq_no: 0,
            transfer_seq: 0,
            peeking: false,
            something_changed: true,
            unsaved: false,
            notices: Vec::new(),
        }
    }

    /// Resume from a snapshot. Everything is flagged so the first push is a
    /// full image.
    pub fn restore(instruments: InstrumentTable, currency: &str, state: PersistedState) -> Self {
        let mut data = state.data;
        data.mark_all_changed();
        let mut alive: Vec<&Order> = data.orders.values().filter(|o| o.is_alive()).collect();
        alive.sort_by_key(|o| o.seqno);
        let alive = alive.into_iter().map(|o| o.order_id.clone()).collect();
        let mut engine = Self {
            user_id: data.user_id.clone(),
            currency: currency.to_string(),
            instruments,
            data,
            alive,
            last_seq_no: state.last_seq_no,
            transfer_seq: state.transfer_seq,
            peeking: false,
            something_changed: true,
            unsaved: false,
            notices: Vec::new(),
        };
        engine.refresh();
        engine
    }

    pub fn state(&self) -> PersistedState {
        PersistedState {
            data: self.data.clone(),
            last_seq_no: self.last_seq_no,
            transfer_seq: self.transfer_seq,
        }
    }

    pub fn data(&self) -> &TradeData {
        &self.data
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn instruments_mut(&mut self) -> &mut InstrumentTable {
        &mut self.instruments
    }

    /// Record the logged-in user. A new name re-labels the account.
    pub fn bind_user(&mut self, user_id: &str) {
        if self.user_id == user_id {
            return;
        }
        self.user_id = user_id.to_string();
        self.data.user_id = user_id.to_string();
        self.data.account.user_id = user_id.to_string();
        for position in self.data.positions.values_mut() {
            position.user_id = user_id.to_string();
        }
        self.data.mark_all_changed();
        self.something_changed = true;
        self.unsaved = true;
    }

    pub fn insert_order(&mut self, action: ActionOrder) {
        let order_id = action
            .order_id
            .clone()
            .unwrap_or_else(|| Utc::now().timestamp_millis().to_string());
        if self.data.orders.contains_key(&order_id) {
            self.reject(Rejection::DuplicateOrder);
            return;
        }

        self.something_changed = true;
        self.unsaved = true;
        let seqno = self.next_seq();
        let order = Order {
            order_id: order_id.clone(),
            exchange_order_id: order_id.clone(),
            user_id: action.user_id.clone(),
            exchange_id: action.exchange_id.clone(),
            instrument_id: action.instrument_id.clone(),
            direction: action.direction,
            offset: action.offset,
            price_type: action.price_type,
            volume_condition: action.volume_condition,
            time_condition: action.time_condition,
            limit_price: action.limit_price,
            volume_orign: action.volume,
            volume_left: action.volume,
            status: OrderStatus::Alive,
            insert_date_time: now_nanos(),
            seqno,
            changed: true,
        };
        let symbol = order.symbol();
        self.data.orders.insert(order_id.clone(), order);

        match self.validate_order(&action, &symbol) {
            Ok(()) => {
                self.alive.push(order_id.clone());
                self.update_order(&order_id);
                debug!(order_id = %order_id, symbol = %symbol, "order accepted");
                self.notices.push(Notice::info("order inserted"));
            }
            Err(rejection) => {
                if let Some(order) = self.data.orders.get_mut(&order_id) {
                    order.finish();
                }
                self.reject(rejection);
            }
        }
        self.refresh();
    }

    fn validate_order(&mut self, action: &ActionOrder, symbol: &str) -> Result<(), Rejection> {
        if !action.user_id.starts_with(&self.user_id) {
            return Err(Rejection::OrderUserMismatch);
        }
        let ins = self
            .instruments
            .get(symbol)
            .ok_or_else(|| Rejection::UnknownInstrument(symbol.to_string()))?;
        if ins.product_class != ProductClass::Futures {
            return Err(Rejection::NotFutures);
        }
        let (tick, margin) = (ins.price_tick, ins.margin);

        let user_id = self.user_id.clone();
        let position = self
            .data
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position::new(&user_id, &action.exchange_id, &action.instrument_id));

        if action.volume <= 0 {
            return Err(Rejection::NonPositiveVolume);
        }
        let ticks = action.limit_price / tick;
        if !ticks.is_finite() || (ticks - ticks.round()).abs() >= TICK_TOLERANCE {
            return Err(Rejection::OffTick { price: action.limit_price, tick });
        }

        let volume = action.volume;
        match action.offset {
            Offset::Open => {
                let required = margin * volume as f64;
                let available = self.data.account.available;
                if required > available {
                    return Err(Rejection::InsufficientMargin { required, available });
                }
            }
            Offset::Close | Offset::CloseToday => {
                let closable = match action.direction {
                    Direction::Buy => position.volume_short - position.volume_short_frozen_today,
                    Direction::Sell => position.volume_long - position.volume_long_frozen_today,
                };
                let exceeds = volume > closable;
                if exceeds {
                    return Err(Rejection::CloseExceedsPosition);
                }
            }
        }
        Ok(())
    }

    pub fn cancel_order(&mut self, action: ActionCancel) {
        if !action.user_id.starts_with(&self.user_id) {
            self.reject(Rejection::CancelUserMismatch);
            return;
        }
        let found = self.alive.iter().find(|id| {
            self.data
                .orders
                .get(id.as_str())
                .is_some_and(|o| o.order_id == action.order_id && o.is_alive())
        });
        let Some(order_id) = found.cloned() else {
            self.reject(Rejection::OrderNotFound);
            return;
        };

        if let Some(order) = self.data.orders.get_mut(&order_id) {
            order.finish();
        }
        self.update_order(&order_id);
        self.something_changed = true;
        self.unsaved = true;
        self.notices.push(Notice::info("order cancelled"));
        self.refresh();
    }

    /// Positive amounts deposit, negative amounts withdraw.
    pub fn transfer(&mut self, action: ActionTransfer) {
        let account = &mut self.data.account;
        if action.amount > 0.0 {
            account.deposit += action.amount;
        } else {
            account.withdraw -= action.amount;
        }
        account.static_balance += action.amount;
        account.changed = true;

        self.transfer_seq += 1;
        let currency = if action.currency.is_empty() { self.currency.clone() } else { action.currency };
        self.data.transfers.insert(
            self.transfer_seq.to_string(),
            TransferLog {
                currency,
                amount: action.amount,
                datetime: now_nanos(),
                error_id: 0,
                error_msg: "success".to_string(),
                changed: true,
            },
        );

        self.something_changed = true;
        self.unsaved = true;
        self.notices.push(Notice::info("transfer succeeded"));
        self.refresh();
    }

    pub fn peek(&mut self) {
        self.peeking = true;
    }

    pub fn is_peeking(&self) -> bool {
        self.peeking
    }

    /// Match, revalue, and build the incremental push if a peek is pending
    /// and something changed. The push is not consumed until [`ack_push`].
    ///
    /// [`ack_push`]: SimEngine::ack_push
    pub fn prepare_push(&mut self) -> Option<String> {
        if !self.peeking {
            return None;
        }
        self.try_order_match();
        self.refresh();
        if !self.something_changed {
            return None;
        }
        Some(self.envelope(false))
    }

    /// The prepared push was sent.
    pub fn ack_push(&mut self) {
        self.data.clear_changed();
        self.something_changed = false;
        self.peeking = false;
    }

    /// Every entity, regardless of flags or peek state.
    pub fn full_snapshot(&self) -> String {
        self.envelope(true)
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// True once per batch of mutations not yet written to disk.
    pub fn take_unsaved(&mut self) -> bool {
        std::mem::take(&mut self.unsaved)
    }

    fn envelope(&self, full: bool) -> String {
        json!({
            "aid": "rtn_data",
            "data": [{ "trade": { self.user_id.clone(): self.data.to_snapshot(full) } }]
        })
        .to_string()
    }

    fn reject(&mut self, rejection: Rejection) {
        debug!(user_id = %self.user_id, reason = %rejection, "request rejected");
        self.notices.push(Notice::warning(rejection.to_string()));
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.last_seq_no;
        self.last_seq_no += 1;
        seq
    }

    fn update_order(&mut self, order_id: &str) {
        let seqno = self.next_seq();
        let Some(order) = self.data.orders.get_mut(order_id) else {
            return;
        };
        order.seqno = seqno;
        order.changed = true;
        let symbol = order.symbol();
        self.update_position_volume(&symbol);
    }

    /// Recompute frozen figures from the live orders, then derived fields.
    fn update_position_volume(&mut self, symbol: &str) {
        let Some(ins) = self.instruments.get(symbol) else {
            return;
        };
        let (margin, multiple) = (ins.margin, ins.volume_multiple);

        let mut frozen_margin = 0.0;
        let mut long_frozen_today: i64 = 0;
        let mut short_frozen_today: i64 = 0;
        for order in self.alive.iter().filter_map(|id| self.data.orders.get(id)) {
            if !order.is_alive() || order.symbol() != symbol {
                continue;
            }
            match (order.offset, order.direction) {
                (Offset::Open, _) => frozen_margin += margin * order.volume_left as f64,
                (_, Direction::Buy) => short_frozen_today = short_frozen_today.saturating_add(order.volume_left),
                (_, Direction::Sell) => long_frozen_today = long_frozen_today.saturating_add(order.volume_left),
            }
        }

        let Some(position) = self.data.positions.get_mut(symbol) else {
            return;
        };
        position.frozen_margin = frozen_margin;
        position.volume_long_frozen_today = long_frozen_today;
        position.volume_short_frozen_today = short_frozen_today;
        position.recompute(margin, multiple);
    }

    fn try_order_match(&mut self) {
        let orders = &self.data.orders;
        self.alive.retain(|id| orders.get(id).is_some_and(|o| o.status != OrderStatus::Finished));
        for order_id in self.alive.clone() {
            self.check_order_trade(&order_id);
        }
    }

    fn check_order_trade(&mut self, order_id: &str) {
        let Some(order) = self.data.orders.get(order_id) else {
            return;
        };
        if !order.is_alive() {
            return;
        }
        let symbol = order.symbol();
        let Some(ins) = self.instruments.get(&symbol) else {
            return;
        };
        let (direction, price_type, limit, volume_left) =
            (order.direction, order.price_type, order.limit_price, order.volume_left);
        let (upper, lower, ask, bid) = (ins.upper_limit, ins.lower_limit, ins.ask_price1, ins.bid_price1);

        if price_type == PriceType::Limit {
            let band = if limit - BAND_TOLERANCE > upper {
                Some(Rejection::AboveUpperLimit)
            } else if limit + BAND_TOLERANCE < lower {
                Some(Rejection::BelowLowerLimit)
            } else {
                None
            };
            if let Some(rejection) = band {
                if let Some(order) = self.data.orders.get_mut(order_id) {
                    order.finish();
                }
                self.update_order(order_id);
                self.something_changed = true;
                self.unsaved = true;
                self.reject(rejection);
                return;
            }
        }

        let any = price_type == PriceType::Any;
        match direction {
            Direction::Buy if ask.is_finite() && (any || limit >= ask) => {
                self.do_trade(order_id, volume_left, ask)
            }
            Direction::Sell if bid.is_finite() && (any || limit <= bid) => {
                self.do_trade(order_id, volume_left, bid)
            }
            _ => {}
        }
    }

    fn do_trade(&mut self, order_id: &str, volume: i64, price: f64) {
        let trade_id = self.next_seq().to_string();
        let trade_seqno = self.next_seq();
        let order_seqno = self.next_seq();

        let Some(order) = self.data.orders.get_mut(order_id) else {
            return;
        };
        let symbol = order.symbol();
        let Some(ins) = self.instruments.get(&symbol) else {
            error!(symbol = %symbol, "trade on instrument missing from table");
            return;
        };
        let multiple = ins.volume_multiple;
        let commission = ins.commission * volume as f64;

        order.volume_left -= volume;
        if order.volume_left == 0 {
            order.status = OrderStatus::Finished;
        }
        order.seqno = order_seqno;
        order.changed = true;
        let (direction, offset) = (order.direction, order.offset);

        let trade = Trade {
            trade_id: trade_id.clone(),
            exchange_trade_id: trade_id.clone(),
            order_id: order.order_id.clone(),
            user_id: order.user_id.clone(),
            exchange_id: order.exchange_id.clone(),
            instrument_id: order.instrument_id.clone(),
            direction,
            offset,
            volume,
            price,
            commission,
            trade_date_time: now_nanos(),
            seqno: trade_seqno,
            changed: true,
        };
        self.notices.push(Notice::info(format!("trade: {}, volume {}", symbol, volume)));
        self.data.trades.insert(trade_id, trade);

        let user_id = self.user_id.clone();
        let position = self.data.positions.entry(symbol.clone()).or_insert_with(|| {
            let (exchange_id, instrument_id) = symbol.split_once('.').unwrap_or((symbol.as_str(), ""));
            Position::new(&user_id, exchange_id, instrument_id)
        });
        let value = price * volume as f64 * multiple;
        let mut close_profit = 0.0;
        match (offset, direction) {
            (Offset::Open, Direction::Buy) => {
                position.volume_long_today = position.volume_long_today.saturating_add(volume);
                position.open_cost_long += value;
                position.position_cost_long += value;
            }
            (Offset::Open, Direction::Sell) => {
                position.volume_short_today = position.volume_short_today.saturating_add(volume);
                position.open_cost_short += value;
                position.position_cost_short += value;
            }
            (_, Direction::Buy) => {
                let held = position.volume_short;
                if held > 0 {
                    let keep = (held - volume) as f64 / held as f64;
                    position.open_cost_short *= keep;
                    position.position_cost_short *= keep;
                }
                close_profit = (position.position_price_short - price) * volume as f64 * multiple;
                let (today, his) = split_close(volume, position.volume_short_today);
                position.volume_short_today -= today;
                position.volume_short_his -= his;
            }
            (_, Direction::Sell) => {
                let held = position.volume_long;
                if held > 0 {
                    let keep = (held - volume) as f64 / held as f64;
                    position.open_cost_long *= keep;
                    position.position_cost_long *= keep;
                }
                close_profit = (price - position.position_price_long) * volume as f64 * multiple;
                let (today, his) = split_close(volume, position.volume_long_today);
                position.volume_long_today -= today;
                position.volume_long_his -= his;
            }
        }

        let account = &mut self.data.account;
        account.close_profit += close_profit;
        account.commission += commission;
        account.changed = true;

        self.update_position_volume(&symbol);
        self.something_changed = true;
        self.unsaved = true;
    }

    /// Mark every position to market and re-aggregate the account.
    pub fn refresh(&mut self) {
        let mut position_profit = 0.0;
        let mut float_profit = 0.0;
        let mut margin = 0.0;
        let mut frozen_margin = 0.0;

        for (symbol, position) in self.data.positions.iter_mut() {
            let Some(ins) = self.instruments.get(symbol) else {
                error!(symbol = %symbol, "position on instrument missing from table");
                continue;
            };
            let mark = ins.mark_price();
            let moved = mark.is_finite() && mark != position.last_price;
            if moved || position.changed {
                position.mark_to_market(mark, ins.volume_multiple);
                self.something_changed = true;
            }
            if position.position_profit.is_finite() {
                position_profit += position.position_profit;
            }
            if position.float_profit.is_finite() {
                float_profit += position.float_profit;
            }
            if position.margin.is_finite() {
                margin += position.margin;
            }
            frozen_margin += position.frozen_margin;
        }

        if self.something_changed {
            self.data.account.settle(position_profit, float_profit, margin, frozen_margin);
        }
    }
}

/// Closing volume taken from today's lots first, then historical.
fn split_close(volume: i64, today: i64) -> (i64, i64) {
    let from_today = volume.min(today.max(0));
    (from_today, volume - from_today)
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}
