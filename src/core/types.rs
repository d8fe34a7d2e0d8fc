// Shared domain types for the grid reconciliation loop

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order direction. Long grids buy below the anchor and sell above it;
/// short grids mirror the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Lifecycle of a single grid level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelStatus {
    Pending,
    Open,
    Filled,
    Cancelled,
}

/// One price/quantity/side slot in the ladder.
///
/// `target_quantity` is stored post-rounding to the exchange's quantity
/// precision; rounding always happens per level, never on an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    pub index: usize,
    pub price: f64,
    pub side: Side,
    pub target_quantity: f64,
    pub status: LevelStatus,
}

/// Which way the grid trades: long grids accumulate on the way down and
/// take profit on the way up; short grids mirror it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridDirection {
    Long,
    Short,
}

impl GridDirection {
    /// Side of the orders that build position.
    pub fn entry_side(&self) -> Side {
        match self {
            GridDirection::Long => Side::Buy,
            GridDirection::Short => Side::Sell,
        }
    }

    /// Side of the orders that reduce position.
    pub fn exit_side(&self) -> Side {
        self.entry_side().opposite()
    }
}

/// Sizing/placement mode for the ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridMode {
    Fixed,
    Follow,
}

/// Follow-mode anchor bookkeeping: where the window is centered and how long
/// price has been sitting outside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridAnchor {
    pub center_price: f64,
    pub last_recenter_time: DateTime<Utc>,
    /// When price first moved beyond `follow_distance` grids outside the
    /// window; cleared as soon as price comes back.
    pub drift_since: Option<DateTime<Utc>>,
}

/// The canonical desired ladder, regenerated wholesale on reset or recenter
/// and mutated level-by-level as fills occur.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredGridSpec {
    pub mode: GridMode,
    pub martingale: bool,
    pub levels: Vec<GridLevel>,
    pub grid_interval: f64,
    pub anchor: Option<GridAnchor>,
}

impl DesiredGridSpec {
    pub fn grid_count(&self) -> usize {
        self.levels.len()
    }

    pub fn lower_price(&self) -> f64 {
        self.levels.first().map(|l| l.price).unwrap_or(0.0)
    }

    pub fn upper_price(&self) -> f64 {
        self.levels.last().map(|l| l.price).unwrap_or(0.0)
    }

    pub fn level(&self, index: usize) -> Option<&GridLevel> {
        self.levels.get(index.checked_sub(1)?)
    }

    pub fn level_mut(&mut self, index: usize) -> Option<&mut GridLevel> {
        self.levels.get_mut(index.checked_sub(1)?)
    }
}

/// Exchange-reported open order. Refreshed each reconciliation pass and only
/// ever compared against, never owned by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedOrder {
    pub id: String,
    pub price: f64,
    pub quantity: f64,
    pub side: Side,
    pub status: ObservedOrderStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservedOrderStatus {
    Open,
    PartiallyFilled,
}

/// Point-in-time position state, owned by the PositionTracker. Everyone else
/// reads copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub quantity: f64,
    pub average_cost: f64,
    pub current_collateral: f64,
    pub unrealized_pnl: f64,
    pub timestamp: DateTime<Utc>,
}

/// Protection state machine states. Exactly one of the first five is active
/// at any instant; Resetting is the terminal intermediate state before
/// returning to Normal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectionState {
    Normal,
    ScalpingActive,
    CapitalProtectionActive,
    TakeProfitActive,
    PriceLocked,
    Resetting,
}

impl std::fmt::Display for ProtectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProtectionState::Normal => "normal",
            ProtectionState::ScalpingActive => "scalping",
            ProtectionState::CapitalProtectionActive => "capital-protection",
            ProtectionState::TakeProfitActive => "take-profit",
            ProtectionState::PriceLocked => "price-locked",
            ProtectionState::Resetting => "resetting",
        };
        write!(f, "{}", name)
    }
}

/// Corrective action emitted by the health checker or protection engine.
/// Always executed by the coordinator, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderAction {
    Place {
        level_index: usize,
        price: f64,
        quantity: f64,
        side: Side,
    },
    Cancel {
        order_id: String,
    },
    /// Signed position correction: positive quantity buys, negative sells.
    AdjustPosition {
        quantity: f64,
    },
}

/// Read-only snapshot handed to the status/UI collaborator each tick.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub price: f64,
    pub grid_range: (f64, f64),
    pub position: f64,
    pub unrealized_pnl: f64,
    pub protection_state: ProtectionState,
    pub next_trigger_prices: TriggerPrices,
}

/// Prices at which each enabled protection would fire, for operator display.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TriggerPrices {
    pub capital_protection: Option<f64>,
    pub scalping: Option<f64>,
    pub price_lock: Option<f64>,
}
