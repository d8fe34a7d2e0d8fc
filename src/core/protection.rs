// Capital-protection state machine: ordered trigger predicates plus the
// transitions between Normal, the four protections and Resetting.

use tracing::{info, warn};

use crate::config::ProtectionConfig;
use crate::core::types::{
    DesiredGridSpec, GridDirection, PositionSnapshot, ProtectionState, Side, TriggerPrices,
};

/// Everything a predicate may look at during one tick. Read-only copies;
/// the engine never mutates coordinator state directly.
#[derive(Debug)]
pub struct ProtectionContext<'a> {
    pub price: f64,
    pub spec: &'a DesiredGridSpec,
    pub position: &'a PositionSnapshot,
    pub realized_pnl: f64,
    pub direction: GridDirection,
}

/// What the coordinator must do after a state change. Entry actions run in
/// the serialized loop; the engine has already moved to the new state when
/// a decision is returned.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtectionDecision {
    /// Suspend all new order placement; touch nothing else.
    ActivateCapitalProtection,
    /// Cancel reverse-direction orders and place a single take-profit order.
    ActivateScalping {
        cancel_side: Side,
        take_profit_price: f64,
        take_profit_quantity: f64,
    },
    /// Flatten the position and cancel all open orders.
    ActivateTakeProfit,
    /// Freeze activity; no orders are cancelled.
    LockPrice,
    /// Price re-entered the window; resume with the original ladder.
    UnlockPrice,
    /// Collateral recovered (capital protection) - cancel, confirm, rebuild.
    BeginReset,
}

/// Scalping exit math: the price at which closing the position recovers
/// accumulated realized losses plus a configured margin.
/// `required_move = -realized_pnl / position`, breakeven is the current
/// price shifted by that move, and the take-profit sits
/// `take_profit_grids` grid-widths beyond breakeven in the profit direction.
pub fn scalping_take_profit_price(
    realized_pnl: f64,
    position: f64,
    current_price: f64,
    take_profit_grids: u32,
    grid_interval: f64,
    direction: GridDirection,
) -> f64 {
    let required_move = -realized_pnl / position;
    let breakeven = current_price + required_move;
    match direction {
        GridDirection::Long => breakeven + take_profit_grids as f64 * grid_interval,
        GridDirection::Short => breakeven - take_profit_grids as f64 * grid_interval,
    }
}

/// Fixed-priority protection engine. Predicates are evaluated top-down in
/// a deliberate order (capital protection, scalping, take profit) so a
/// price gap that satisfies several thresholds in one tick deterministically
/// lands on the deepest protection. Price lock sits on the orthogonal
/// (breakout) axis and is evaluated independently.
#[derive(Debug)]
pub struct ProtectionEngine {
    config: ProtectionConfig,
    state: ProtectionState,
    initial_capital: f64,
    /// State to return to when a price lock releases.
    locked_from: Option<ProtectionState>,
}

impl ProtectionEngine {
    pub fn new(config: ProtectionConfig, initial_capital: f64) -> Self {
        Self {
            config,
            state: ProtectionState::Normal,
            initial_capital,
            locked_from: None,
        }
    }

    pub fn state(&self) -> ProtectionState {
        self.state
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    /// Restore a persisted state across a restart.
    pub fn restore_state(&mut self, state: ProtectionState) {
        self.state = state;
    }

    /// Re-baseline the capital reference after a completed reset so the
    /// take-profit and recovery predicates measure the next cycle's gain,
    /// not the banked one.
    pub fn rebase_capital(&mut self, collateral: f64) {
        if (collateral - self.initial_capital).abs() > f64::EPSILON {
            info!(
                "📊 Capital baseline rebased: {:.2} -> {:.2}",
                self.initial_capital, collateral
            );
        }
        self.initial_capital = collateral;
    }

    /// One evaluation pass. Returns at most one decision per tick; the
    /// engine's state is already updated when a decision comes back.
    pub fn evaluate(&mut self, ctx: &ProtectionContext<'_>) -> Option<ProtectionDecision> {
        match self.state {
            ProtectionState::Normal => self.evaluate_from_normal(ctx),
            ProtectionState::PriceLocked => self.evaluate_while_locked(ctx),
            ProtectionState::CapitalProtectionActive => {
                if ctx.position.current_collateral >= self.initial_capital {
                    info!(
                        "💰 Collateral recovered ({:.2} >= {:.2}) - leaving capital protection",
                        ctx.position.current_collateral, self.initial_capital
                    );
                    self.state = ProtectionState::Resetting;
                    Some(ProtectionDecision::BeginReset)
                } else {
                    None
                }
            }
            // Scalping / take-profit / resetting exits are event-driven,
            // not predicate-driven
            _ => None,
        }
    }

    fn evaluate_from_normal(&mut self, ctx: &ProtectionContext<'_>) -> Option<ProtectionDecision> {
        if self.config.capital_protection_enabled && self.falling_predicate(
            ctx,
            self.config.capital_protection_trigger_percent,
        ) {
            warn!(
                "🛡️  Capital protection armed at price {:.4} - suspending placement",
                ctx.price
            );
            self.state = ProtectionState::CapitalProtectionActive;
            return Some(ProtectionDecision::ActivateCapitalProtection);
        }

        if self.config.scalping_enabled
            && self.falling_predicate(ctx, self.config.scalping_trigger_percent)
        {
            let quantity = ctx.position.quantity.abs();
            if quantity > 0.0 {
                let take_profit_price = scalping_take_profit_price(
                    ctx.realized_pnl,
                    ctx.position.quantity,
                    ctx.price,
                    self.config.scalping_take_profit_grids,
                    ctx.spec.grid_interval,
                    ctx.direction,
                );
                warn!(
                    "⚡ Scalping armed at price {:.4}, take-profit at {:.4}",
                    ctx.price, take_profit_price
                );
                self.state = ProtectionState::ScalpingActive;
                return Some(ProtectionDecision::ActivateScalping {
                    cancel_side: ctx.direction.exit_side(),
                    take_profit_price,
                    take_profit_quantity: quantity,
                });
            }
        }

        if self.config.take_profit_enabled && self.initial_capital > 0.0 {
            let gain =
                (ctx.position.current_collateral - self.initial_capital) / self.initial_capital;
            if gain >= self.config.take_profit_percentage {
                info!("🎯 Take profit triggered: collateral up {:.2}%", gain * 100.0);
                self.state = ProtectionState::TakeProfitActive;
                return Some(ProtectionDecision::ActivateTakeProfit);
            }
        }

        // Orthogonal axis: breakout beyond the window
        if self.config.price_lock_enabled && self.lock_predicate(ctx) {
            warn!("🔒 Price lock engaged at {:.4}", ctx.price);
            self.locked_from = Some(ProtectionState::Normal);
            self.state = ProtectionState::PriceLocked;
            return Some(ProtectionDecision::LockPrice);
        }

        None
    }

    fn evaluate_while_locked(&mut self, ctx: &ProtectionContext<'_>) -> Option<ProtectionDecision> {
        // Locks are mutually exclusive with the falling-price protections;
        // a real overlap is an anomaly, never silently resolved
        if self.config.capital_protection_enabled
            && self.falling_predicate(ctx, self.config.capital_protection_trigger_percent)
        {
            warn!(
                "🚨 Anomaly: capital protection predicate true while price-locked at {:.4}",
                ctx.price
            );
        }

        if self.price_inside_window(ctx) {
            info!("🔓 Price re-entered the window at {:.4} - unlocking", ctx.price);
            self.state = self.locked_from.take().unwrap_or(ProtectionState::Normal);
            return Some(ProtectionDecision::UnlockPrice);
        }
        None
    }

    /// Take-profit order placed by scalping has filled.
    pub fn on_scalping_take_profit_filled(&mut self) -> bool {
        if self.state == ProtectionState::ScalpingActive {
            self.state = ProtectionState::Resetting;
            true
        } else {
            false
        }
    }

    /// Take-profit flatten + cancel confirmed by the coordinator.
    pub fn on_flatten_confirmed(&mut self) -> bool {
        if self.state == ProtectionState::TakeProfitActive {
            self.state = ProtectionState::Resetting;
            true
        } else {
            false
        }
    }

    /// New ladder built and verified after a reset.
    pub fn on_reset_complete(&mut self) {
        self.state = ProtectionState::Normal;
    }

    /// Entry actions failed (e.g. cancellation could not be verified);
    /// abandon the protection rather than run it half-armed.
    pub fn abort_to_normal(&mut self, reason: &str) {
        warn!("↩️  Protection {} aborted: {}", self.state, reason);
        self.state = ProtectionState::Normal;
        self.locked_from = None;
    }

    /// Prices at which each enabled protection would fire, for the status
    /// snapshot.
    pub fn trigger_prices(&self, spec: &DesiredGridSpec, direction: GridDirection) -> TriggerPrices {
        let mut prices = TriggerPrices::default();
        if self.config.capital_protection_enabled {
            prices.capital_protection = Some(self.falling_trigger_price(
                spec,
                direction,
                self.config.capital_protection_trigger_percent,
            ));
        }
        if self.config.scalping_enabled {
            prices.scalping = Some(self.falling_trigger_price(
                spec,
                direction,
                self.config.scalping_trigger_percent,
            ));
        }
        if self.config.price_lock_enabled {
            prices.price_lock = Some(self.config.price_lock_threshold);
        }
        prices
    }

    /// Adverse-move predicate shared by capital protection and scalping:
    /// price has crossed `percent` of the grid range away from the anchored
    /// edge.
    fn falling_predicate(&self, ctx: &ProtectionContext<'_>, percent: f64) -> bool {
        let trigger = self.falling_trigger_price(ctx.spec, ctx.direction, percent);
        match ctx.direction {
            GridDirection::Long => ctx.price <= trigger,
            GridDirection::Short => ctx.price >= trigger,
        }
    }

    fn falling_trigger_price(
        &self,
        spec: &DesiredGridSpec,
        direction: GridDirection,
        percent: f64,
    ) -> f64 {
        let depth = percent / 100.0 * spec.grid_count() as f64 * spec.grid_interval;
        match direction {
            GridDirection::Long => spec.upper_price() - depth,
            GridDirection::Short => spec.lower_price() + depth,
        }
    }

    fn lock_predicate(&self, ctx: &ProtectionContext<'_>) -> bool {
        let outside = match ctx.direction {
            GridDirection::Long => ctx.price > ctx.spec.upper_price(),
            GridDirection::Short => ctx.price < ctx.spec.lower_price(),
        };
        if !outside {
            return false;
        }
        if self.config.price_lock_start_at_threshold {
            match ctx.direction {
                GridDirection::Long => ctx.price >= self.config.price_lock_threshold,
                GridDirection::Short => ctx.price <= self.config.price_lock_threshold,
            }
        } else {
            true
        }
    }

    fn price_inside_window(&self, ctx: &ProtectionContext<'_>) -> bool {
        ctx.price >= ctx.spec.lower_price() && ctx.price <= ctx.spec.upper_price()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::planner::GridPlanner;
    use chrono::Utc;

    fn protection_config() -> ProtectionConfig {
        let mut config = Config::default().protection;
        config.capital_protection_enabled = true;
        config.capital_protection_trigger_percent = 50.0;
        config.scalping_enabled = true;
        config.scalping_trigger_percent = 10.0;
        config.scalping_take_profit_grids = 2;
        config
    }

    fn test_spec() -> DesiredGridSpec {
        let mut grid = Config::default().grid;
        grid.lower_price = 900.0;
        grid.upper_price = 1100.0;
        grid.grid_interval = 10.0;
        GridPlanner::new(grid).build(1000.0, Utc::now())
    }

    fn snapshot(quantity: f64, collateral: f64) -> PositionSnapshot {
        PositionSnapshot {
            quantity,
            average_cost: 1000.0,
            current_collateral: collateral,
            unrealized_pnl: 0.0,
            timestamp: Utc::now(),
        }
    }

    fn ctx<'a>(
        price: f64,
        spec: &'a DesiredGridSpec,
        position: &'a PositionSnapshot,
    ) -> ProtectionContext<'a> {
        ProtectionContext {
            price,
            spec,
            position,
            realized_pnl: -10.0,
            direction: GridDirection::Long,
        }
    }

    #[test]
    fn test_scalping_take_profit_price_math() {
        let tp = scalping_take_profit_price(-50.0, 2.5, 1000.0, 2, 1.3, GridDirection::Long);
        // required move 20, breakeven 1020, plus 2 grids of 1.3
        assert!((tp - 1022.6).abs() < 1e-9);
    }

    #[test]
    fn test_capital_protection_beats_scalping_when_both_true() {
        let mut engine = ProtectionEngine::new(protection_config(), 10_000.0);
        let spec = test_spec();
        let position = snapshot(2.5, 9_000.0);

        // Deep gap: both predicates true at evaluation time.
        // Ladder top is 1090: scalping trigger 1070, capital protection 990.
        let decision = engine.evaluate(&ctx(985.0, &spec, &position));

        assert_eq!(decision, Some(ProtectionDecision::ActivateCapitalProtection));
        assert_eq!(engine.state(), ProtectionState::CapitalProtectionActive);
    }

    #[test]
    fn test_gradual_decline_arms_scalping_first() {
        let mut engine = ProtectionEngine::new(protection_config(), 10_000.0);
        let spec = test_spec();
        let position = snapshot(2.5, 9_500.0);

        // Below the scalping trigger (1070) but above capital protection (990)
        let decision = engine.evaluate(&ctx(1065.0, &spec, &position));
        match decision {
            Some(ProtectionDecision::ActivateScalping { cancel_side, .. }) => {
                assert_eq!(cancel_side, Side::Sell);
            }
            other => panic!("expected scalping activation, got {:?}", other),
        }
        assert_eq!(engine.state(), ProtectionState::ScalpingActive);
    }

    #[test]
    fn test_capital_protection_recovery_begins_reset() {
        let mut engine = ProtectionEngine::new(protection_config(), 10_000.0);
        let spec = test_spec();

        engine.evaluate(&ctx(985.0, &spec, &snapshot(2.5, 9_000.0)));
        assert_eq!(engine.state(), ProtectionState::CapitalProtectionActive);

        // Still underwater: nothing happens
        assert_eq!(engine.evaluate(&ctx(985.0, &spec, &snapshot(2.5, 9_500.0))), None);

        // Collateral back to initial capital
        let decision = engine.evaluate(&ctx(1010.0, &spec, &snapshot(2.5, 10_050.0)));
        assert_eq!(decision, Some(ProtectionDecision::BeginReset));
        assert_eq!(engine.state(), ProtectionState::Resetting);

        engine.on_reset_complete();
        assert_eq!(engine.state(), ProtectionState::Normal);
    }

    #[test]
    fn test_take_profit_predicate() {
        let mut config = protection_config();
        config.capital_protection_enabled = false;
        config.scalping_enabled = false;
        config.take_profit_enabled = true;
        config.take_profit_percentage = 0.01;

        let mut engine = ProtectionEngine::new(config, 10_000.0);
        let spec = test_spec();

        assert_eq!(engine.evaluate(&ctx(1050.0, &spec, &snapshot(1.0, 10_050.0))), None);

        let decision = engine.evaluate(&ctx(1050.0, &spec, &snapshot(1.0, 10_150.0)));
        assert_eq!(decision, Some(ProtectionDecision::ActivateTakeProfit));
        assert_eq!(engine.state(), ProtectionState::TakeProfitActive);
    }

    #[test]
    fn test_price_lock_is_reversible() {
        let mut config = protection_config();
        config.capital_protection_enabled = false;
        config.scalping_enabled = false;
        config.price_lock_enabled = true;
        config.price_lock_threshold = 1150.0;
        config.price_lock_start_at_threshold = true;

        let mut engine = ProtectionEngine::new(config, 10_000.0);
        let spec = test_spec();
        let position = snapshot(1.0, 10_000.0);

        // Above the window but below the threshold: no lock
        assert_eq!(engine.evaluate(&ctx(1120.0, &spec, &position)), None);

        let decision = engine.evaluate(&ctx(1160.0, &spec, &position));
        assert_eq!(decision, Some(ProtectionDecision::LockPrice));
        assert_eq!(engine.state(), ProtectionState::PriceLocked);

        // Still outside: stays locked
        assert_eq!(engine.evaluate(&ctx(1130.0, &spec, &position)), None);
        assert_eq!(engine.state(), ProtectionState::PriceLocked);

        // Back inside the window: deterministic return to Normal
        let decision = engine.evaluate(&ctx(1050.0, &spec, &position));
        assert_eq!(decision, Some(ProtectionDecision::UnlockPrice));
        assert_eq!(engine.state(), ProtectionState::Normal);
    }

    #[test]
    fn test_scalping_fill_and_flatten_transitions() {
        let mut engine = ProtectionEngine::new(protection_config(), 10_000.0);
        let spec = test_spec();

        engine.evaluate(&ctx(1065.0, &spec, &snapshot(2.5, 9_500.0)));
        assert_eq!(engine.state(), ProtectionState::ScalpingActive);

        assert!(engine.on_scalping_take_profit_filled());
        assert_eq!(engine.state(), ProtectionState::Resetting);

        // Fill events for the wrong state are refused
        assert!(!engine.on_flatten_confirmed());
    }
}
