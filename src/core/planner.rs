// Ladder construction: pure strategy-parameters -> DesiredGridSpec

use chrono::{DateTime, Utc};

use crate::config::GridConfig;
use crate::core::types::{
    DesiredGridSpec, GridAnchor, GridDirection, GridLevel, GridMode, LevelStatus, Side,
};

/// Round-half-up to `precision` decimal places, matching how the exchange
/// formats order quantities. Applied per level, never to aggregates.
pub fn round_half_up(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    // The tiny nudge keeps values that are exactly representable at the
    // precision boundary (e.g. 0.0595 * 10000 = 594.9999...) from rounding down.
    ((value * factor) + 0.5 + 1e-9).floor() / factor
}

/// Builds and re-builds the desired ladder. No I/O; the coordinator owns all
/// execution.
#[derive(Debug, Clone)]
pub struct GridPlanner {
    config: GridConfig,
}

impl GridPlanner {
    pub fn new(config: GridConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Martingale quantity for a ladder slot. `rank` is 1-indexed from the
    /// side nearest the anchor outward, so deeper adverse levels order more.
    pub fn martingale_amount(&self, rank: usize) -> f64 {
        let raw = self.config.order_amount
            + (rank.saturating_sub(1) as f64) * self.config.martingale_increment;
        round_half_up(raw, self.config.quantity_precision)
    }

    /// Ratio of the deepest level's quantity to the first level's, surfaced
    /// for operator tuning.
    pub fn martingale_multiplier(&self) -> f64 {
        let count = self.config.grid_count();
        if count == 0 {
            return 1.0;
        }
        self.martingale_amount(count) / self.martingale_amount(1)
    }

    /// Grid index at which a percent-of-range protection arms:
    /// `grid_count - grid_count * percent / 100`, floored, never below 1.
    pub fn trigger_grid(&self, trigger_percent: f64) -> usize {
        let count = self.config.grid_count();
        let offset = (count as f64 * trigger_percent / 100.0) as usize;
        count.saturating_sub(offset).max(1)
    }

    /// Nearest ladder index for a price, clamped into `[1, grid_count]`.
    pub fn grid_index_by_price(&self, spec: &DesiredGridSpec, price: f64) -> usize {
        let count = spec.grid_count();
        if count == 0 {
            return 1;
        }
        let idx = ((price - spec.lower_price()) / spec.grid_interval).round() as i64 + 1;
        idx.clamp(1, count as i64) as usize
    }

    /// Build a fresh ladder around `current_price`. Fixed mode uses the
    /// configured bounds; follow mode centers its window on the price.
    pub fn build(&self, current_price: f64, now: DateTime<Utc>) -> DesiredGridSpec {
        let count = self.config.grid_count();
        let interval = self.config.grid_interval;

        let (lower, anchor) = match self.config.grid_type {
            GridMode::Fixed => (self.config.lower_price, None),
            GridMode::Follow => {
                // Levels anchor at the window's lower edge, so the top
                // level sits one interval inside `anchor + half_span` and
                // the ladder keeps exactly `follow_grid_count` levels
                let half_span = (count as f64 / 2.0) * interval;
                (
                    current_price - half_span,
                    Some(GridAnchor {
                        center_price: current_price,
                        last_recenter_time: now,
                        drift_since: None,
                    }),
                )
            }
        };

        let mut levels = Vec::with_capacity(count);
        for index in 1..=count {
            let price = lower + (index as f64 - 1.0) * interval;
            levels.push(GridLevel {
                index,
                price,
                side: self.side_for_price(price, current_price),
                target_quantity: self.level_quantity(index, count),
                status: LevelStatus::Pending,
            });
        }

        DesiredGridSpec {
            mode: self.config.grid_type,
            martingale: self.config.martingale_increment > 0.0,
            levels,
            grid_interval: interval,
            anchor,
        }
    }

    /// Recenter a follow-mode ladder around a new price. Levels whose price
    /// survives into the new window keep their Filled status; everything
    /// dropped is returned so the coordinator can cancel its orders.
    pub fn recenter(
        &self,
        old: &DesiredGridSpec,
        new_center: f64,
        now: DateTime<Utc>,
    ) -> (DesiredGridSpec, Vec<GridLevel>) {
        let mut fresh = self.build(new_center, now);
        let half_tick = self.config.price_tick / 2.0;

        for level in &mut fresh.levels {
            let survivor = old
                .levels
                .iter()
                .find(|l| (l.price - level.price).abs() < half_tick);
            if let Some(prev) = survivor {
                if prev.status == LevelStatus::Filled {
                    level.status = LevelStatus::Filled;
                }
            }
        }

        let dropped = old
            .levels
            .iter()
            .filter(|l| {
                l.price < fresh.lower_price() - half_tick
                    || l.price > fresh.upper_price() + half_tick
            })
            .cloned()
            .collect();

        (fresh, dropped)
    }

    /// True when price sits more than `follow_distance` grid-widths beyond
    /// the current window edge.
    pub fn price_escaped(&self, spec: &DesiredGridSpec, price: f64) -> bool {
        let margin = self.config.follow_distance * spec.grid_interval;
        price > spec.upper_price() + margin || price < spec.lower_price() - margin
    }

    /// Per-level quantity: flat `order_amount`, or the martingale schedule
    /// when an increment is configured. `index` ascends with price.
    fn level_quantity(&self, index: usize, count: usize) -> f64 {
        if self.config.martingale_increment <= 0.0 {
            return round_half_up(self.config.order_amount, self.config.quantity_precision);
        }
        let rank = match self.config.direction {
            // Long grids anchor at the top of the range: lower levels are
            // deeper adverse moves.
            GridDirection::Long => count - index + 1,
            GridDirection::Short => index,
        };
        self.martingale_amount(rank)
    }

    fn side_for_price(&self, level_price: f64, current_price: f64) -> Side {
        match self.config.direction {
            GridDirection::Long => {
                if level_price < current_price {
                    Side::Buy
                } else {
                    Side::Sell
                }
            }
            GridDirection::Short => {
                if level_price > current_price {
                    Side::Sell
                } else {
                    Side::Buy
                }
            }
        }
    }
}
