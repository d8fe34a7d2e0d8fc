// The serialized control loop that owns all grid state

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::health::OrderHealthChecker;
use crate::core::planner::{round_half_up, GridPlanner};
use crate::core::position::PositionTracker;
use crate::core::protection::{ProtectionContext, ProtectionDecision, ProtectionEngine};
use crate::core::types::{
    DesiredGridSpec, GridMode, LevelStatus, OrderAction, ProtectionState, Side, StatusSnapshot,
};
use crate::error::{TradingError, TradingResult};
use crate::exchange::{retry_read, ExchangeClient, ExchangeEvent, FillEvent};
use crate::persistence::StateStore;

/// Consecutive handler failures tolerated before the loop pauses itself.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Cancellation-confirmation polling during a reset: bounded, with backoff,
/// and nothing is placed until the venue reports zero open orders.
const RESET_CONFIRM_ATTEMPTS: usize = 3;
const RESET_CONFIRM_DELAYS_MS: [u64; RESET_CONFIRM_ATTEMPTS] = [800, 1500, 1500];

/// Orchestrates the whole grid instance. All mutations to the desired
/// ladder, the protection state and order bookkeeping happen inside this
/// one event loop; exchange I/O runs async but its effects land back here.
pub struct GridCoordinator {
    config: Config,
    planner: GridPlanner,
    tracker: PositionTracker,
    engine: ProtectionEngine,
    health: OrderHealthChecker,
    exchange: Arc<dyn ExchangeClient>,
    store: StateStore,
    events: mpsc::UnboundedReceiver<ExchangeEvent>,
    spec: Option<DesiredGridSpec>,
    current_price: f64,
    /// Exchange order id -> ladder index for orders this loop placed.
    order_levels: HashMap<String, usize>,
    /// Scalping take-profit order, tracked separately from the ladder.
    take_profit_order: Option<String>,
    consecutive_errors: u32,
}

impl GridCoordinator {
    /// Connect to the venue, capture initial capital and restore any
    /// persisted ladder state.
    pub async fn new(config: Config, exchange: Arc<dyn ExchangeClient>) -> TradingResult<Self> {
        let events = exchange.subscribe();

        let position = retry_read("get_position", || exchange.get_position()).await?;
        info!(
            "🔌 Connected: position {:.6}, collateral {:.2}",
            position.quantity, position.current_collateral
        );

        let planner = GridPlanner::new(config.grid.clone());
        let mut tracker = PositionTracker::new(config.grid.fee_rate);
        tracker.sync_authoritative(
            position.quantity,
            position.average_cost,
            position.current_collateral,
        );

        let mut engine =
            ProtectionEngine::new(config.protection.clone(), position.current_collateral);

        let store = StateStore::new(&config.state_file);
        let spec = match store.load()? {
            Some(persisted) => {
                match persisted.protection_state {
                    // In-flight scalping/take-profit/reset cycles cannot
                    // resume mid-step across a restart (the take-profit
                    // order id is gone); finish them with a full reset
                    ProtectionState::ScalpingActive
                    | ProtectionState::TakeProfitActive
                    | ProtectionState::Resetting => {
                        warn!(
                            "Restored mid-cycle state {} - resetting grid on first tick",
                            persisted.protection_state
                        );
                        engine.restore_state(ProtectionState::Resetting);
                    }
                    state => engine.restore_state(state),
                }
                Some(persisted.spec)
            }
            None => None,
        };

        let health = OrderHealthChecker::new(
            config.grid.price_tick,
            config.grid.epsilon(),
            config.grid.quantity_precision,
        );

        Ok(Self {
            config,
            planner,
            tracker,
            engine,
            health,
            exchange,
            store,
            events,
            spec,
            current_price: 0.0,
            order_levels: HashMap::new(),
            take_profit_order: None,
            consecutive_errors: 0,
        })
    }

    pub fn protection_state(&self) -> ProtectionState {
        self.engine.state()
    }

    pub fn spec(&self) -> Option<&DesiredGridSpec> {
        self.spec.as_ref()
    }

    /// Read-only snapshot for the status/UI collaborator.
    pub fn status(&self) -> StatusSnapshot {
        let position = self.tracker.snapshot(self.current_price);
        let (grid_range, triggers) = match &self.spec {
            Some(spec) => (
                (spec.lower_price(), spec.upper_price()),
                self.engine.trigger_prices(spec, self.config.grid.direction),
            ),
            None => ((0.0, 0.0), Default::default()),
        };
        StatusSnapshot {
            price: self.current_price,
            grid_range,
            position: position.quantity,
            unrealized_pnl: position.unrealized_pnl,
            protection_state: self.engine.state(),
            next_trigger_prices: triggers,
        }
    }

    /// Main loop: one consumer for the exchange event stream plus the
    /// health-check timer. Runs until a fatal error or channel close.
    pub async fn run(&mut self) -> TradingResult<()> {
        let mut health_timer = interval(Duration::from_secs(
            self.config.grid.order_health_check_interval_secs,
        ));
        health_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so the ladder gets
        // placed from a price event before the first reconciliation pass
        health_timer.tick().await;

        loop {
            let result = tokio::select! {
                maybe_event = self.events.recv() => match maybe_event {
                    Some(event) => self.process_event(event).await,
                    None => {
                        return Err(TradingError::ChannelClosed(
                            "exchange event stream ended".to_string(),
                        ))
                    }
                },
                _ = health_timer.tick() => self.run_health_check().await,
            };

            match result {
                Ok(()) => self.consecutive_errors = 0,
                Err(err) if err.is_fatal() => {
                    error!("🛑 Fatal: {}", err);
                    return Err(err);
                }
                Err(err) => {
                    self.consecutive_errors += 1;
                    error!(
                        "❌ Handler error ({}/{}): {}",
                        self.consecutive_errors, MAX_CONSECUTIVE_ERRORS, err
                    );
                    if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        return Err(TradingError::LoopPaused(format!(
                            "{} consecutive errors, last: {}",
                            self.consecutive_errors, err
                        )));
                    }
                }
            }
        }
    }

    /// Apply one event. Public so tests can drive the loop deterministically.
    pub async fn process_event(&mut self, event: ExchangeEvent) -> TradingResult<()> {
        match event {
            ExchangeEvent::PriceTick { price, .. } => self.on_price_tick(price).await,
            ExchangeEvent::Fill(fill) => self.on_fill(fill).await,
            ExchangeEvent::PositionUpdate(update) => {
                self.tracker.sync_authoritative(
                    update.quantity,
                    update.entry_price,
                    update.collateral,
                );
                Ok(())
            }
        }
    }

    async fn on_price_tick(&mut self, price: f64) -> TradingResult<()> {
        self.current_price = price;

        if self.spec.is_none() {
            self.build_and_place_ladder().await?;
            return Ok(());
        }

        // A reset interrupted by a restart is resumed here; live resets
        // complete inside apply_protection_decision before it returns
        if self.engine.state() == ProtectionState::Resetting {
            self.cancel_all_orders().await?;
            self.confirm_cancellations().await?;
            return self.rebuild_after_reset().await;
        }

        // Protection first: it can preempt everything below
        if let Some(decision) = self.evaluate_protection() {
            self.apply_protection_decision(decision).await?;
            return Ok(());
        }

        if self.engine.state() == ProtectionState::Normal {
            self.track_follow_drift().await?;
        }

        Ok(())
    }

    fn evaluate_protection(&mut self) -> Option<ProtectionDecision> {
        let spec = self.spec.as_ref()?;
        let position = self.tracker.snapshot(self.current_price);
        let ctx = ProtectionContext {
            price: self.current_price,
            spec,
            position: &position,
            realized_pnl: self.tracker.realized_pnl(),
            direction: self.config.grid.direction,
        };
        self.engine.evaluate(&ctx)
    }

    async fn apply_protection_decision(
        &mut self,
        decision: ProtectionDecision,
    ) -> TradingResult<()> {
        match decision {
            ProtectionDecision::ActivateCapitalProtection => {
                // Suspend placement only; every existing order stays live
                self.persist()?;
                Ok(())
            }
            ProtectionDecision::ActivateScalping {
                cancel_side,
                take_profit_price,
                take_profit_quantity,
            } => {
                if let Err(err) = self.cancel_side_verified(cancel_side).await {
                    self.engine.abort_to_normal(&err.to_string());
                    return Err(err);
                }
                match self
                    .exchange
                    .place_order(
                        take_profit_price,
                        round_half_up(take_profit_quantity, self.config.grid.quantity_precision),
                        cancel_side,
                    )
                    .await
                {
                    Ok(order_id) => {
                        info!(
                            "⚡ Scalping take-profit placed: {:.6} @ {:.4}",
                            take_profit_quantity, take_profit_price
                        );
                        self.take_profit_order = Some(order_id);
                        self.persist()?;
                        Ok(())
                    }
                    Err(err) => {
                        self.engine.abort_to_normal(&err.to_string());
                        Err(err)
                    }
                }
            }
            ProtectionDecision::ActivateTakeProfit => {
                self.flatten_position().await?;
                self.cancel_all_orders().await?;
                self.confirm_cancellations().await?;
                self.engine.on_flatten_confirmed();
                self.persist()?;
                self.rebuild_after_reset().await
            }
            ProtectionDecision::LockPrice | ProtectionDecision::UnlockPrice => {
                // Freeze/unfreeze only: the ladder is untouched either way
                self.persist()?;
                Ok(())
            }
            ProtectionDecision::BeginReset => {
                self.cancel_all_orders().await?;
                self.confirm_cancellations().await?;
                self.persist()?;
                self.rebuild_after_reset().await
            }
        }
    }

    async fn on_fill(&mut self, fill: FillEvent) -> TradingResult<()> {
        if !self.tracker.record_fill(&fill) {
            return Ok(());
        }
        if self.config.logging.enable_fill_logging {
            info!(
                "✅ Fill: {} {:.6} @ {:.4} (position {:.6}, realized {:.2})",
                fill.side,
                fill.quantity,
                fill.price,
                self.tracker.quantity(),
                self.tracker.realized_pnl()
            );
        }

        // Scalping exit order?
        if self.take_profit_order.as_deref() == Some(fill.order_id.as_str()) {
            self.take_profit_order = None;
            if self.engine.on_scalping_take_profit_filled() {
                info!("⚡ Scalping take-profit filled - resetting grid");
                self.cancel_all_orders().await?;
                self.confirm_cancellations().await?;
                self.persist()?;
                return self.rebuild_after_reset().await;
            }
            return Ok(());
        }

        let Some(level_index) = self.order_levels.remove(&fill.order_id) else {
            debug!("Fill for untracked order {} ignored", fill.order_id);
            return Ok(());
        };

        let entry_side = self.config.grid.direction.entry_side();
        if let Some(spec) = self.spec.as_mut() {
            if let Some(level) = spec.level_mut(level_index) {
                // Entry fills carry position; exit fills just free the slot
                level.status = if fill.side == entry_side {
                    LevelStatus::Filled
                } else {
                    LevelStatus::Pending
                };
            }
        }

        self.place_reverse_order(level_index, &fill).await?;
        self.persist()?;
        Ok(())
    }

    /// A fill at level N immediately triggers the opposite-side order
    /// `reverse_order_grid_distance` levels away, independent of the next
    /// scheduled health check.
    async fn place_reverse_order(&mut self, level_index: usize, fill: &FillEvent) -> TradingResult<()> {
        match self.engine.state() {
            ProtectionState::Normal => {}
            // While scalping, only position-reducing fills get reverses
            ProtectionState::ScalpingActive
                if fill.side == self.config.grid.direction.exit_side() => {}
            _ => return Ok(()),
        }

        let distance = self.config.grid.reverse_order_grid_distance as i64;
        let target = match fill.side {
            Side::Buy => level_index as i64 + distance,
            Side::Sell => level_index as i64 - distance,
        };

        let Some(spec) = self.spec.as_mut() else {
            return Ok(());
        };
        if target < 1 || target > spec.grid_count() as i64 {
            warn!(
                "Reverse order for level {} would land outside the ladder - skipped",
                level_index
            );
            return Ok(());
        }
        let target = target as usize;
        let reverse_side = fill.side.opposite();
        let quantity = fill.quantity;

        let price = match spec.level_mut(target) {
            Some(level) => {
                level.side = reverse_side;
                level.target_quantity = quantity;
                level.price
            }
            None => return Ok(()),
        };

        match self.exchange.place_order(price, quantity, reverse_side).await {
            Ok(order_id) => {
                if let Some(level) = self.spec.as_mut().and_then(|s| s.level_mut(target)) {
                    level.status = LevelStatus::Open;
                }
                self.order_levels.insert(order_id, target);
                debug!(
                    "🔁 Reverse order: {} {:.6} @ {:.4} (level {})",
                    reverse_side, quantity, price, target
                );
                Ok(())
            }
            Err(err) => {
                error!("Reverse order placement failed at level {}: {}", target, err);
                Err(err)
            }
        }
    }

    /// Periodic reconciliation. Only runs in Normal: every other state either
    /// suspends placement or owns the order book exclusively.
    pub async fn run_health_check(&mut self) -> TradingResult<()> {
        if self.engine.state() != ProtectionState::Normal || self.spec.is_none() {
            return Ok(());
        }

        let exchange = Arc::clone(&self.exchange);
        let observed = retry_read("list_open_orders", || exchange.list_open_orders()).await?;
        let position = retry_read("get_position", || exchange.get_position()).await?;

        self.tracker
            .update_collateral(position.current_collateral);

        let report = {
            let spec = self.spec.as_ref().ok_or_else(|| {
                TradingError::Internal("health check without a ladder".to_string())
            })?;
            self.health.check(spec, &observed, &position)
        };

        if self.config.logging.enable_health_logging && !report.is_clean() {
            info!(
                "🩺 Health check: {} corrective actions, drift {:.6}",
                report.actions.len(),
                report.position_drift
            );
        }
        for action in report.actions {
            self.execute_action(action).await?;
        }

        // Corrections above still ran; anomalies are surfaced on top of them
        if let Some(anomaly) = report.anomalies.first() {
            return Err(TradingError::ReconciliationAnomaly(anomaly.clone()));
        }
        Ok(())
    }

    async fn execute_action(&mut self, action: OrderAction) -> TradingResult<()> {
        match action {
            OrderAction::Place {
                level_index,
                price,
                quantity,
                side,
            } => {
                let order_id = self.exchange.place_order(price, quantity, side).await?;
                if let Some(level) = self.spec.as_mut().and_then(|s| s.level_mut(level_index)) {
                    level.status = LevelStatus::Open;
                }
                self.order_levels.insert(order_id, level_index);
                Ok(())
            }
            OrderAction::Cancel { order_id } => {
                self.exchange.cancel_order(&order_id).await?;
                self.order_levels.remove(&order_id);
                Ok(())
            }
            OrderAction::AdjustPosition { quantity } => {
                let side = if quantity > 0.0 { Side::Buy } else { Side::Sell };
                let amount = round_half_up(quantity.abs(), self.config.grid.quantity_precision);
                if amount <= 0.0 {
                    return Ok(());
                }
                warn!(
                    "🔧 Correcting position drift: {} {:.6} at market",
                    side, amount
                );
                self.exchange
                    .place_order(self.aggressive_price(side), amount, side)
                    .await?;
                Ok(())
            }
        }
    }

    async fn build_and_place_ladder(&mut self) -> TradingResult<()> {
        let spec = self.planner.build(self.current_price, Utc::now());
        info!(
            "🎯 Ladder built: {} levels [{:.4}, {:.4}], interval {:.4}{}",
            spec.grid_count(),
            spec.lower_price(),
            spec.upper_price(),
            spec.grid_interval,
            if spec.martingale {
                format!(
                    ", martingale x{:.2}",
                    self.planner.martingale_multiplier()
                )
            } else {
                String::new()
            }
        );
        self.spec = Some(spec);
        self.place_pending_levels().await?;
        self.persist()?;
        Ok(())
    }

    /// Place every Pending level except the slot straddling the current
    /// price, which would cross immediately.
    async fn place_pending_levels(&mut self) -> TradingResult<()> {
        let Some(spec) = self.spec.as_ref() else {
            return Ok(());
        };
        let half_interval = spec.grid_interval / 2.0;
        let to_place: Vec<(usize, f64, f64, Side)> = spec
            .levels
            .iter()
            .filter(|l| {
                l.status == LevelStatus::Pending
                    && (l.price - self.current_price).abs() > half_interval
            })
            .map(|l| (l.index, l.price, l.target_quantity, l.side))
            .collect();

        for (index, price, quantity, side) in to_place {
            let order_id = self.exchange.place_order(price, quantity, side).await?;
            if let Some(level) = self.spec.as_mut().and_then(|s| s.level_mut(index)) {
                level.status = LevelStatus::Open;
            }
            self.order_levels.insert(order_id, index);
        }
        Ok(())
    }

    /// Follow mode: recenter the window once price has sat beyond
    /// `follow_distance` grid-widths outside it for `follow_timeout`
    /// continuous seconds.
    async fn track_follow_drift(&mut self) -> TradingResult<()> {
        if self.config.grid.grid_type != GridMode::Follow {
            return Ok(());
        }
        let Some(spec) = self.spec.as_ref() else {
            return Ok(());
        };

        let escaped = self.planner.price_escaped(spec, self.current_price);
        let now = Utc::now();

        let timed_out = {
            let Some(anchor) = self.spec.as_mut().and_then(|s| s.anchor.as_mut()) else {
                return Ok(());
            };
            if !escaped {
                anchor.drift_since = None;
                return Ok(());
            }
            let since = *anchor.drift_since.get_or_insert(now);
            (now - since).num_seconds() >= self.config.grid.follow_timeout_secs as i64
        };

        if !timed_out {
            return Ok(());
        }

        info!(
            "🧭 Price {:.4} escaped the follow window - recentering",
            self.current_price
        );
        self.recenter_ladder().await
    }

    async fn recenter_ladder(&mut self) -> TradingResult<()> {
        let Some(old_spec) = self.spec.clone() else {
            return Ok(());
        };
        let (fresh, dropped) = self
            .planner
            .recenter(&old_spec, self.current_price, Utc::now());

        // Cancel orders whose levels fell out of the new window, and remap
        // surviving orders onto their new indices by price
        let half_tick = self.config.grid.price_tick / 2.0;
        let mut remapped = HashMap::new();
        for (order_id, old_index) in self.order_levels.drain() {
            let Some(old_level) = old_spec.level(old_index) else {
                continue;
            };
            let was_dropped = dropped.iter().any(|l| l.index == old_index);
            if was_dropped {
                if let Err(err) = self.exchange.cancel_order(&order_id).await {
                    warn!("Cancel during recenter failed for {}: {}", order_id, err);
                }
                continue;
            }
            if let Some(new_level) = fresh
                .levels
                .iter()
                .find(|l| (l.price - old_level.price).abs() < half_tick)
            {
                remapped.insert(order_id, new_level.index);
            }
        }

        // Surviving open orders keep their levels marked Open
        let mut fresh = fresh;
        for &index in remapped.values() {
            if let Some(level) = fresh.level_mut(index) {
                if level.status == LevelStatus::Pending {
                    level.status = LevelStatus::Open;
                }
            }
        }

        self.order_levels = remapped;
        self.spec = Some(fresh);
        self.place_pending_levels().await?;
        self.persist()?;
        Ok(())
    }

    /// Cancel one side of the book and verify the venue agrees, retrying the
    /// confirmation up to the reset limit. Scalping never proceeds on an
    /// unverified cancellation.
    async fn cancel_side_verified(&mut self, side: Side) -> TradingResult<()> {
        let exchange = Arc::clone(&self.exchange);
        let open = retry_read("list_open_orders", || exchange.list_open_orders()).await?;
        for order in open.iter().filter(|o| o.side == side) {
            self.exchange.cancel_order(&order.id).await?;
            self.order_levels.remove(&order.id);
        }

        for (attempt, delay_ms) in RESET_CONFIRM_DELAYS_MS.iter().enumerate() {
            sleep(Duration::from_millis(*delay_ms)).await;
            let open = retry_read("list_open_orders", || exchange.list_open_orders()).await?;
            if !open.iter().any(|o| o.side == side) {
                return Ok(());
            }
            warn!(
                "⏳ {} orders on {} side still open after cancel (poll {}/{})",
                open.iter().filter(|o| o.side == side).count(),
                side,
                attempt + 1,
                RESET_CONFIRM_ATTEMPTS
            );
        }
        Err(TradingError::ResetConfirmationTimeout(RESET_CONFIRM_ATTEMPTS))
    }

    async fn cancel_all_orders(&mut self) -> TradingResult<()> {
        let exchange = Arc::clone(&self.exchange);
        let open = retry_read("list_open_orders", || exchange.list_open_orders()).await?;
        for order in &open {
            if let Err(err) = self.exchange.cancel_order(&order.id).await {
                warn!("Cancel failed for {}: {}", order.id, err);
            }
            self.order_levels.remove(&order.id);
        }
        Ok(())
    }

    /// Poll until the venue confirms zero open orders, bounded by the reset
    /// limit. A timeout here is fatal: placing fresh orders over unconfirmed
    /// cancellations risks exceeding exchange open-order limits.
    async fn confirm_cancellations(&mut self) -> TradingResult<()> {
        let exchange = Arc::clone(&self.exchange);
        for (attempt, delay_ms) in RESET_CONFIRM_DELAYS_MS.iter().enumerate() {
            let open = retry_read("list_open_orders", || exchange.list_open_orders()).await?;
            if open.is_empty() {
                return Ok(());
            }
            warn!(
                "⏳ {} orders still open during reset (poll {}/{})",
                open.len(),
                attempt + 1,
                RESET_CONFIRM_ATTEMPTS
            );
            sleep(Duration::from_millis(*delay_ms)).await;
        }
        Err(TradingError::ResetConfirmationTimeout(RESET_CONFIRM_ATTEMPTS))
    }

    /// Rebuild the ladder after a confirmed reset and return to Normal.
    async fn rebuild_after_reset(&mut self) -> TradingResult<()> {
        self.order_levels.clear();
        self.take_profit_order = None;

        // Re-baseline against an authoritative read: a banked take-profit
        // gain must not keep the predicate true on the next tick
        let exchange = Arc::clone(&self.exchange);
        let position = retry_read("get_position", || exchange.get_position()).await?;
        self.tracker.reset();
        self.tracker.sync_authoritative(
            position.quantity,
            position.average_cost,
            position.current_collateral,
        );
        self.engine.rebase_capital(position.current_collateral);

        let spec = self.planner.build(self.current_price, Utc::now());
        info!(
            "🔄 Grid rebuilt after reset: {} levels around {:.4}",
            spec.grid_count(),
            self.current_price
        );
        self.spec = Some(spec);
        self.engine.on_reset_complete();
        self.place_pending_levels().await?;
        self.persist()?;
        Ok(())
    }

    async fn flatten_position(&mut self) -> TradingResult<()> {
        let quantity = round_half_up(
            self.tracker.quantity().abs(),
            self.config.grid.quantity_precision,
        );
        if quantity <= 0.0 {
            return Ok(());
        }
        let side = if self.tracker.quantity() > 0.0 {
            Side::Sell
        } else {
            Side::Buy
        };
        info!("📤 Flattening position: {} {:.6}", side, quantity);
        self.exchange
            .place_order(self.aggressive_price(side), quantity, side)
            .await?;
        Ok(())
    }

    /// Crossable limit price for immediate execution.
    fn aggressive_price(&self, side: Side) -> f64 {
        match side {
            Side::Buy => self.current_price * 1.005,
            Side::Sell => self.current_price * 0.995,
        }
    }

    fn persist(&self) -> TradingResult<()> {
        if let Some(spec) = &self.spec {
            self.store.save(spec, self.engine.state())?;
        }
        Ok(())
    }
}
