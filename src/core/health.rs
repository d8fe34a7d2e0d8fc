// Periodic desired-vs-observed reconciliation

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::core::planner::round_half_up;
use crate::core::types::{
    DesiredGridSpec, LevelStatus, ObservedOrder, OrderAction, PositionSnapshot, Side,
};

/// How many consecutive passes may correct the same level before it is
/// surfaced as an anomaly rather than quietly repaired again.
const CORRECTION_ANOMALY_THRESHOLD: u32 = 3;
const DRIFT_ANOMALY_THRESHOLD: u32 = 2;

/// Outcome of one reconciliation pass. Actions are handed to the coordinator
/// for serialized execution, never run here.
#[derive(Debug, Default)]
pub struct HealthReport {
    pub actions: Vec<OrderAction>,
    pub expected_position: f64,
    pub position_drift: f64,
    pub anomalies: Vec<String>,
}

impl HealthReport {
    pub fn is_clean(&self) -> bool {
        self.actions.is_empty() && self.anomalies.is_empty()
    }
}

/// Diffs the desired ladder against observed exchange orders and the
/// authoritative position, emitting corrective actions.
#[derive(Debug)]
pub struct OrderHealthChecker {
    price_tick: f64,
    epsilon: f64,
    quantity_precision: u32,
    level_correction_streaks: HashMap<usize, u32>,
    drift_streak: u32,
}

impl OrderHealthChecker {
    pub fn new(price_tick: f64, epsilon: f64, quantity_precision: u32) -> Self {
        Self {
            price_tick,
            epsilon,
            quantity_precision,
            level_correction_streaks: HashMap::new(),
            drift_streak: 0,
        }
    }

    /// One reconciliation pass. Matching tolerates price differences below
    /// one tick and quantity differences below the rounding epsilon.
    pub fn check(
        &mut self,
        spec: &DesiredGridSpec,
        observed: &[ObservedOrder],
        position: &PositionSnapshot,
    ) -> HealthReport {
        let mut report = HealthReport::default();
        let mut matched_levels: HashSet<usize> = HashSet::new();
        let mut corrected_levels: HashSet<usize> = HashSet::new();

        // Pass 1: every observed order must map onto exactly one live level.
        // Unknown, mispriced and duplicate orders are cancelled.
        for order in observed {
            let candidate = spec.levels.iter().find(|level| {
                matches!(level.status, LevelStatus::Pending | LevelStatus::Open)
                    && level.side == order.side
                    && !matched_levels.contains(&level.index)
                    && (level.price - order.price).abs() < self.price_tick
                    && (level.target_quantity - order.quantity).abs() < self.epsilon
            });

            match candidate {
                Some(level) => {
                    matched_levels.insert(level.index);
                }
                None => {
                    debug!(
                        "🧹 Cancelling stray order {} ({} {:.6} @ {:.4})",
                        order.id, order.side, order.quantity, order.price
                    );
                    report.actions.push(OrderAction::Cancel {
                        order_id: order.id.clone(),
                    });
                }
            }
        }

        // Pass 2: every live level without a matching order gets re-placed
        for level in &spec.levels {
            if matches!(level.status, LevelStatus::Pending | LevelStatus::Open)
                && !matched_levels.contains(&level.index)
            {
                report.actions.push(OrderAction::Place {
                    level_index: level.index,
                    price: level.price,
                    quantity: level.target_quantity,
                    side: level.side,
                });
                corrected_levels.insert(level.index);
            }
        }

        // Pass 3: expected position from per-level pre-rounded quantities.
        // The aggregate itself is never rounded.
        let mut expected = 0.0;
        for level in &spec.levels {
            if level.status == LevelStatus::Filled {
                let formatted = round_half_up(level.target_quantity, self.quantity_precision);
                expected += match level.side {
                    Side::Buy => formatted,
                    Side::Sell => -formatted,
                };
            }
        }
        report.expected_position = expected;
        report.position_drift = expected - position.quantity;

        if report.position_drift.abs() > self.epsilon {
            warn!(
                "⚠️  Position drift: expected {:.6}, actual {:.6} (Δ {:.6})",
                expected, position.quantity, report.position_drift
            );
            report.actions.push(OrderAction::AdjustPosition {
                quantity: report.position_drift,
            });
            self.drift_streak += 1;
            if self.drift_streak >= DRIFT_ANOMALY_THRESHOLD {
                report.anomalies.push(format!(
                    "position drift corrected {} consecutive passes (Δ {:.6})",
                    self.drift_streak, report.position_drift
                ));
            }
        } else {
            self.drift_streak = 0;
        }

        self.update_level_streaks(&corrected_levels, &mut report);

        if !report.anomalies.is_empty() {
            for anomaly in &report.anomalies {
                warn!("🚨 Reconciliation anomaly: {}", anomaly);
            }
        }

        report
    }

    fn update_level_streaks(&mut self, corrected: &HashSet<usize>, report: &mut HealthReport) {
        self.level_correction_streaks
            .retain(|index, _| corrected.contains(index));
        for &index in corrected {
            let streak = self.level_correction_streaks.entry(index).or_insert(0);
            *streak += 1;
            if *streak >= CORRECTION_ANOMALY_THRESHOLD {
                report.anomalies.push(format!(
                    "level {} corrected {} consecutive passes",
                    index, streak
                ));
            }
        }
    }
}
