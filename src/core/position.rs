// Position and P&L tracking from the exchange fill stream

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::core::types::{PositionSnapshot, Side};
use crate::exchange::FillEvent;

const FILL_ID_WINDOW: usize = 1000;
const TRADE_HISTORY_LIMIT: usize = 1000;

/// One applied fill, kept for operator inspection.
#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub fill_id: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    /// Realized profit for position-reducing fills; None for entries.
    pub profit: Option<f64>,
    pub position_after: f64,
    pub timestamp: DateTime<Utc>,
}

/// Maintains running position quantity, weighted-average cost and realized
/// P&L. Event application is O(1) and idempotent under at-least-once
/// delivery: fills are deduplicated by exchange-assigned fill id.
#[derive(Debug)]
pub struct PositionTracker {
    quantity: f64,
    position_cost: f64,
    average_cost: f64,
    realized_pnl: f64,
    total_fees: f64,
    fee_rate: f64,
    current_collateral: f64,
    buy_count: usize,
    sell_count: usize,
    seen_fill_ids: HashSet<String>,
    seen_order: VecDeque<String>,
    trade_history: VecDeque<TradeRecord>,
}

impl PositionTracker {
    pub fn new(fee_rate: f64) -> Self {
        Self {
            quantity: 0.0,
            position_cost: 0.0,
            average_cost: 0.0,
            realized_pnl: 0.0,
            total_fees: 0.0,
            fee_rate,
            current_collateral: 0.0,
            buy_count: 0,
            sell_count: 0,
            seen_fill_ids: HashSet::new(),
            seen_order: VecDeque::new(),
            trade_history: VecDeque::new(),
        }
    }

    /// Apply a fill. Returns false if the fill id was already seen.
    pub fn record_fill(&mut self, fill: &FillEvent) -> bool {
        if self.seen_fill_ids.contains(&fill.fill_id) {
            debug!("Duplicate fill {} ignored", fill.fill_id);
            return false;
        }
        self.remember_fill_id(fill.fill_id.clone());

        let signed = match fill.side {
            Side::Buy => fill.quantity,
            Side::Sell => -fill.quantity,
        };

        let reducing = self.quantity != 0.0 && self.quantity.signum() != signed.signum();
        let mut profit = None;

        if reducing {
            // Position-reducing fill: realize P&L against weighted-average cost
            let closed = fill.quantity.min(self.quantity.abs());
            let pnl = if self.quantity > 0.0 {
                (fill.price - self.average_cost) * closed
            } else {
                (self.average_cost - fill.price) * closed
            };
            self.realized_pnl += pnl;
            self.position_cost -= self.average_cost * closed;
            // A fill crossing zero flips the position; the remainder opens
            // at the fill price
            let flipped = fill.quantity - closed;
            if flipped > 0.0 {
                self.position_cost = fill.price * flipped;
            }
            profit = Some(pnl);
        } else {
            self.position_cost += fill.price * fill.quantity;
        }

        self.quantity += signed;
        self.average_cost = if self.quantity != 0.0 {
            self.position_cost / self.quantity.abs()
        } else {
            self.position_cost = 0.0;
            0.0
        };

        match fill.side {
            Side::Buy => self.buy_count += 1,
            Side::Sell => self.sell_count += 1,
        }

        self.total_fees += fill.price * fill.quantity * self.fee_rate;

        self.push_trade(TradeRecord {
            fill_id: fill.fill_id.clone(),
            side: fill.side,
            price: fill.price,
            quantity: fill.quantity,
            profit,
            position_after: self.quantity,
            timestamp: fill.timestamp,
        });

        true
    }

    /// Overwrite local state with an authoritative exchange read. Used at
    /// startup and when drift correction replaces the running estimate.
    pub fn sync_authoritative(&mut self, quantity: f64, entry_price: f64, collateral: f64) {
        self.quantity = quantity;
        self.average_cost = entry_price;
        self.position_cost = quantity.abs() * entry_price;
        self.current_collateral = collateral;
    }

    pub fn update_collateral(&mut self, collateral: f64) {
        self.current_collateral = collateral;
    }

    pub fn snapshot(&self, current_price: f64) -> PositionSnapshot {
        let unrealized = if self.quantity != 0.0 {
            (current_price - self.average_cost) * self.quantity
        } else {
            0.0
        };
        PositionSnapshot {
            quantity: self.quantity,
            average_cost: self.average_cost,
            current_collateral: self.current_collateral,
            unrealized_pnl: unrealized,
            timestamp: Utc::now(),
        }
    }

    pub fn quantity(&self) -> f64 {
        self.quantity
    }

    pub fn average_cost(&self) -> f64 {
        self.average_cost
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    pub fn total_fees(&self) -> f64 {
        self.total_fees
    }

    pub fn current_collateral(&self) -> f64 {
        self.current_collateral
    }

    pub fn fill_counts(&self) -> (usize, usize) {
        (self.buy_count, self.sell_count)
    }

    pub fn trade_history(&self, limit: usize) -> Vec<TradeRecord> {
        self.trade_history
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Clear everything after a grid rebuild; collateral and the dedup
    /// window survive because they are exchange-scoped, not grid-scoped.
    pub fn reset(&mut self) {
        self.quantity = 0.0;
        self.position_cost = 0.0;
        self.average_cost = 0.0;
        self.realized_pnl = 0.0;
        self.total_fees = 0.0;
        self.buy_count = 0;
        self.sell_count = 0;
        self.trade_history.clear();
    }

    fn remember_fill_id(&mut self, id: String) {
        self.seen_fill_ids.insert(id.clone());
        self.seen_order.push_back(id);
        while self.seen_order.len() > FILL_ID_WINDOW {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen_fill_ids.remove(&old);
            }
        }
    }

    fn push_trade(&mut self, record: TradeRecord) {
        self.trade_history.push_back(record);
        while self.trade_history.len() > TRADE_HISTORY_LIMIT {
            self.trade_history.pop_front();
        }
    }
}
