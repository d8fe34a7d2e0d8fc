// Desired-vs-observed reconciliation driven through the coordinator

mod common;

use std::sync::Arc;

use chrono::Utc;
use common::{create_test_config, MockCall, MockExchange};
use perp_grid_bot::exchange::ExchangeEvent;
use perp_grid_bot::{
    GridCoordinator, ObservedOrder, OrderHealthChecker, PositionSnapshot, ProtectionState, Side,
    TradingError,
};
use perp_grid_bot::core::types::{LevelStatus, ObservedOrderStatus};
use perp_grid_bot::core::GridPlanner;
use perp_grid_bot::core::planner::round_half_up;

async fn ready_coordinator(
    config: perp_grid_bot::Config,
    exchange: &Arc<MockExchange>,
) -> GridCoordinator {
    let mut coordinator = GridCoordinator::new(
        config,
        Arc::clone(exchange) as Arc<dyn perp_grid_bot::ExchangeClient>,
    )
    .await
    .expect("coordinator construction");
    coordinator
        .process_event(ExchangeEvent::PriceTick {
            price: 1000.0,
            timestamp: Utc::now(),
        })
        .await
        .expect("ladder placement");
    coordinator
}

#[tokio::test(start_paused = true)]
async fn test_missing_ladder_order_is_replaced() {
    let exchange = Arc::new(MockExchange::new(10_000.0));
    let mut coordinator = ready_coordinator(create_test_config(), &exchange).await;

    // The venue silently loses the order resting at 950
    let lost = exchange.order_at(950.0).expect("buy level at 950");
    exchange.fill_order(&lost.id);
    assert!(exchange.order_at(950.0).is_none());

    coordinator.run_health_check().await.unwrap();

    let replaced = exchange.order_at(950.0).expect("level re-placed");
    assert_eq!(replaced.side, Side::Buy);
    assert!((replaced.quantity - 0.01).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_order_is_cancelled_by_health_check() {
    let exchange = Arc::new(MockExchange::new(10_000.0));
    let mut coordinator = ready_coordinator(create_test_config(), &exchange).await;

    // One pass sees the real book plus an order nothing in the ladder owns
    let mut observed = exchange.open_orders();
    observed.push(ObservedOrder {
        id: "ghost".to_string(),
        price: 951.3,
        quantity: 0.02,
        side: Side::Sell,
        status: ObservedOrderStatus::Open,
    });
    exchange.script_open_orders(observed);

    coordinator.run_health_check().await.unwrap();

    assert!(exchange.calls().iter().any(|c| matches!(
        c,
        MockCall::Cancel { order_id } if order_id == "ghost"
    )));
}

#[tokio::test(start_paused = true)]
async fn test_position_drift_corrected_at_market() {
    let exchange = Arc::new(MockExchange::new(10_000.0));
    let mut coordinator = ready_coordinator(create_test_config(), &exchange).await;

    // A buy fill the exchange's position feed never reflects
    let buy = exchange.order_at(990.0).unwrap();
    let fill = exchange.fill_order(&buy.id);
    coordinator
        .process_event(ExchangeEvent::Fill(fill))
        .await
        .unwrap();

    coordinator.run_health_check().await.unwrap();

    // Expected +0.01 vs reported 0.0: a crossable buy closes the gap
    let correction = exchange
        .calls()
        .iter()
        .rev()
        .find_map(|c| match c {
            MockCall::Place { price, quantity, side: Side::Buy } if *price > 1000.0 => {
                Some((*price, *quantity))
            }
            _ => None,
        })
        .expect("market-style correction order");
    assert!((correction.1 - 0.01).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_drift_surfaces_anomaly_after_correcting() {
    let exchange = Arc::new(MockExchange::new(10_000.0));
    let mut coordinator = ready_coordinator(create_test_config(), &exchange).await;

    let buy = exchange.order_at(990.0).unwrap();
    let fill = exchange.fill_order(&buy.id);
    coordinator
        .process_event(ExchangeEvent::Fill(fill))
        .await
        .unwrap();

    // First pass corrects quietly
    coordinator.run_health_check().await.unwrap();

    // The reported position is still stuck at zero on the second pass
    let err = coordinator.run_health_check().await.unwrap_err();
    assert!(matches!(err, TradingError::ReconciliationAnomaly(_)));
    assert!(!err.is_fatal());

    // The correction itself was still issued before the anomaly surfaced
    let corrections = exchange
        .calls()
        .iter()
        .filter(|c| matches!(c, MockCall::Place { price, side: Side::Buy, .. } if *price > 1000.0))
        .count();
    assert_eq!(corrections, 2);
}

#[tokio::test(start_paused = true)]
async fn test_health_check_suspended_outside_normal_state() {
    let mut config = create_test_config();
    config.protection.capital_protection_enabled = true;
    config.protection.capital_protection_trigger_percent = 50.0;

    let exchange = Arc::new(MockExchange::new(10_000.0));
    let mut coordinator = ready_coordinator(config, &exchange).await;

    coordinator
        .process_event(ExchangeEvent::PriceTick {
            price: 985.0,
            timestamp: Utc::now(),
        })
        .await
        .unwrap();
    assert_eq!(
        coordinator.protection_state(),
        ProtectionState::CapitalProtectionActive
    );

    let calls_before = exchange.calls().len();
    coordinator.run_health_check().await.unwrap();
    assert_eq!(exchange.calls().len(), calls_before);
}

#[test]
fn test_martingale_ladder_aggregate_is_never_rounded() {
    // 200 martingale levels at 4-decimal precision: summing the per-level
    // pre-rounded quantities must agree exactly with what an exchange that
    // fills them one by one would report
    let mut grid = create_test_config().grid;
    grid.lower_price = 0.0;
    grid.upper_price = 2000.0;
    grid.martingale_increment = 0.0005;
    let planner = GridPlanner::new(grid.clone());

    let mut spec = planner.build(2000.0, Utc::now());
    let mut reported = 0.0;
    for level in spec.levels.iter_mut() {
        if level.side == Side::Buy {
            level.status = LevelStatus::Filled;
            reported += round_half_up(level.target_quantity, grid.quantity_precision);
        }
    }

    let mut checker = OrderHealthChecker::new(grid.price_tick, grid.epsilon(), grid.quantity_precision);
    let position = PositionSnapshot {
        quantity: reported,
        average_cost: 1000.0,
        current_collateral: 10_000.0,
        unrealized_pnl: 0.0,
        timestamp: Utc::now(),
    };
    let report = checker.check(&spec, &[], &position);

    assert!(report.position_drift.abs() < grid.epsilon());
    assert!(
        !report
            .actions
            .iter()
            .any(|a| matches!(a, perp_grid_bot::OrderAction::AdjustPosition { .. })),
        "precision-only accumulation must never be corrected"
    );
}
