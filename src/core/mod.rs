// Core control-loop modules

pub mod types;
pub mod planner;
pub mod position;
pub mod health;
pub mod protection;
pub mod coordinator;

// Re-export commonly used types
pub use types::{
    DesiredGridSpec, GridAnchor, GridDirection, GridLevel, GridMode, LevelStatus, ObservedOrder,
    OrderAction, PositionSnapshot, ProtectionState, Side, StatusSnapshot,
};
pub use planner::GridPlanner;
pub use position::PositionTracker;
pub use health::{HealthReport, OrderHealthChecker};
pub use protection::{ProtectionDecision, ProtectionEngine};
pub use coordinator::GridCoordinator;
