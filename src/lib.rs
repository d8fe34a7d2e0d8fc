// Perp Grid Bot Library
//
// A grid reconciliation control loop for derivatives exchanges: desired-state
// order laddering with martingale sizing, drift self-healing and a
// prioritized capital-protection state machine.

pub mod core;
pub mod config;
pub mod error;       // Unified error handling
pub mod exchange;    // Venue boundary: async trait + paper implementation
pub mod persistence; // Restart state snapshots

// Re-export core trading types
pub use crate::core::{
    DesiredGridSpec, GridCoordinator, GridDirection, GridLevel, GridMode, GridPlanner,
    LevelStatus, ObservedOrder, OrderAction, OrderHealthChecker, PositionSnapshot,
    PositionTracker, ProtectionEngine, ProtectionState, Side, StatusSnapshot,
};

// Re-export error types
pub use error::{TradingError, TradingResult};

// Re-export configuration
pub use config::{Config, ConfigError, GridConfig, LoggingConfig, ProtectionConfig};

// Re-export the exchange boundary
pub use exchange::{paper::PaperExchange, ExchangeClient, ExchangeEvent, FillEvent, PositionUpdate};

// Re-export persistence
pub use persistence::{PersistedState, StateStore};
