// Ladder construction tests through the public API

mod common;

use chrono::Utc;
use common::create_test_config;
use perp_grid_bot::core::planner::round_half_up;
use perp_grid_bot::{GridDirection, GridMode, GridPlanner, LevelStatus, Side};

#[test]
fn test_martingale_ladder_quantities_non_decreasing_away_from_anchor() {
    let mut config = create_test_config().grid;
    config.direction = GridDirection::Long;
    config.martingale_increment = 0.0005;
    let planner = GridPlanner::new(config);

    let spec = planner.build(1000.0, Utc::now());
    // Long grids anchor at the top: quantities grow toward the bottom
    for pair in spec.levels.windows(2) {
        assert!(pair[0].target_quantity >= pair[1].target_quantity);
    }
}

#[test]
fn test_flat_quantity_formatted_to_precision() {
    let mut config = create_test_config().grid;
    config.order_amount = 0.0123456;
    config.quantity_precision = 4;
    let planner = GridPlanner::new(config);

    let spec = planner.build(1000.0, Utc::now());
    for level in &spec.levels {
        assert!((level.target_quantity - round_half_up(0.0123456, 4)).abs() < 1e-12);
    }
}

#[test]
fn test_follow_recenter_drops_out_of_window_levels() {
    let mut config = create_test_config().grid;
    config.grid_type = GridMode::Follow;
    config.follow_grid_count = 10;
    let planner = GridPlanner::new(config);

    let mut spec = planner.build(1000.0, Utc::now());
    spec.levels[3].status = LevelStatus::Filled;

    let (fresh, dropped) = planner.recenter(&spec, 1030.0, Utc::now());
    assert_eq!(fresh.grid_count(), 10);
    // Everything below the new lower bound was dropped
    for level in &dropped {
        assert!(level.price < fresh.lower_price());
    }
    // The filled level sat at 980, inside the new [980, 1070] window
    let survivor = fresh
        .levels
        .iter()
        .find(|l| (l.price - spec.levels[3].price).abs() < 0.05)
        .expect("level survives recenter");
    assert_eq!(survivor.status, LevelStatus::Filled);
}

#[test]
fn test_short_grid_sides_mirror_long() {
    let mut config = create_test_config().grid;
    config.direction = GridDirection::Short;
    let planner = GridPlanner::new(config);

    let spec = planner.build(1000.0, Utc::now());
    for level in &spec.levels {
        if level.price > 1000.0 {
            assert_eq!(level.side, Side::Sell);
        } else {
            assert_eq!(level.side, Side::Buy);
        }
    }
}
