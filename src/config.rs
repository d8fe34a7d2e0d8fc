// Configuration management for the grid bot

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::types::{GridDirection, GridMode};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    pub symbol: String,
    pub direction: GridDirection,
    pub grid_type: GridMode,
    /// Fixed-mode bounds; ignored in follow mode.
    pub lower_price: f64,
    pub upper_price: f64,
    pub grid_interval: f64,
    pub order_amount: f64,
    /// Per-level quantity escalation; 0.0 disables the martingale variant.
    pub martingale_increment: f64,
    pub quantity_precision: u32,
    pub price_tick: f64,
    pub follow_grid_count: usize,
    pub follow_timeout_secs: u64,
    pub follow_distance: f64,
    pub reverse_order_grid_distance: usize,
    pub order_health_check_interval_secs: u64,
    pub fee_rate: f64,
    /// Expected-vs-actual position tolerance; 0.0 means one quantum at
    /// quantity_precision.
    pub position_epsilon: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionConfig {
    pub scalping_enabled: bool,
    pub scalping_trigger_percent: f64,
    pub scalping_take_profit_grids: u32,
    pub capital_protection_enabled: bool,
    pub capital_protection_trigger_percent: f64,
    pub take_profit_enabled: bool,
    pub take_profit_percentage: f64,
    pub price_lock_enabled: bool,
    pub price_lock_threshold: f64,
    pub price_lock_start_at_threshold: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub enable_fill_logging: bool,
    pub enable_health_logging: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            enable_fill_logging: true,
            enable_health_logging: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub grid: GridConfig,
    pub protection: ProtectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Where DesiredGridSpec + ProtectionState snapshots are written.
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

fn default_state_file() -> String {
    "grid-state.json".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grid: GridConfig {
                symbol: "BTC-USDT".to_string(),
                direction: GridDirection::Long,
                grid_type: GridMode::Fixed,
                lower_price: 90_000.0,
                upper_price: 110_000.0,
                grid_interval: 100.0,
                order_amount: 0.01,
                martingale_increment: 0.0,
                quantity_precision: 3,
                price_tick: 0.1,
                follow_grid_count: 100,
                follow_timeout_secs: 300,
                follow_distance: 1.0,
                reverse_order_grid_distance: 1,
                order_health_check_interval_secs: 300,
                fee_rate: 0.0001,
                position_epsilon: 0.0,
            },
            protection: ProtectionConfig {
                scalping_enabled: false,
                scalping_trigger_percent: 80.0,
                scalping_take_profit_grids: 2,
                capital_protection_enabled: false,
                capital_protection_trigger_percent: 50.0,
                take_profit_enabled: false,
                take_profit_percentage: 0.01,
                price_lock_enabled: false,
                price_lock_threshold: 0.0,
                price_lock_start_at_threshold: false,
            },
            logging: LoggingConfig::default(),
            state_file: default_state_file(),
        }
    }
}

impl GridConfig {
    /// Number of ladder levels implied by the configured price range.
    pub fn grid_count(&self) -> usize {
        match self.grid_type {
            GridMode::Fixed => {
                ((self.upper_price - self.lower_price) / self.grid_interval).round() as usize
            }
            GridMode::Follow => self.follow_grid_count,
        }
    }

    /// Effective reconciliation tolerance: configured epsilon, or one
    /// quantity quantum when left at zero.
    pub fn epsilon(&self) -> f64 {
        if self.position_epsilon > 0.0 {
            self.position_epsilon
        } else {
            10f64.powi(-(self.quantity_precision as i32))
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::FileWrite(e.to_string()))?;

        Ok(())
    }

    /// Load configuration from file, or create default if file doesn't exist
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            let config = Self::default();
            config.to_file(&path)?;
            println!("📁 Created default config file: {}", path.as_ref().display());
            Ok(config)
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.grid;

        if g.grid_interval <= 0.0 {
            return Err(ConfigError::Validation("grid_interval must be positive".to_string()));
        }

        if g.order_amount <= 0.0 {
            return Err(ConfigError::Validation("order_amount must be positive".to_string()));
        }

        if g.martingale_increment < 0.0 {
            return Err(ConfigError::Validation("martingale_increment must be non-negative".to_string()));
        }

        if g.price_tick <= 0.0 {
            return Err(ConfigError::Validation("price_tick must be positive".to_string()));
        }

        match g.grid_type {
            GridMode::Fixed => {
                if g.upper_price <= g.lower_price {
                    return Err(ConfigError::Validation(
                        "upper_price must be greater than lower_price".to_string(),
                    ));
                }
                if g.grid_count() == 0 {
                    return Err(ConfigError::Validation(
                        "price range must span at least one grid_interval".to_string(),
                    ));
                }
            }
            GridMode::Follow => {
                if g.follow_grid_count == 0 {
                    return Err(ConfigError::Validation(
                        "follow_grid_count must be greater than 0".to_string(),
                    ));
                }
                if g.follow_distance <= 0.0 {
                    return Err(ConfigError::Validation(
                        "follow_distance must be positive".to_string(),
                    ));
                }
            }
        }

        if g.reverse_order_grid_distance == 0 {
            return Err(ConfigError::Validation(
                "reverse_order_grid_distance must be at least 1".to_string(),
            ));
        }

        if g.order_health_check_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "order_health_check_interval_secs must be greater than 0".to_string(),
            ));
        }

        let p = &self.protection;

        if p.scalping_enabled
            && !(0.0..=100.0).contains(&p.scalping_trigger_percent)
        {
            return Err(ConfigError::Validation(
                "scalping_trigger_percent must be between 0 and 100".to_string(),
            ));
        }

        if p.capital_protection_enabled
            && !(0.0..=100.0).contains(&p.capital_protection_trigger_percent)
        {
            return Err(ConfigError::Validation(
                "capital_protection_trigger_percent must be between 0 and 100".to_string(),
            ));
        }

        if p.take_profit_enabled && p.take_profit_percentage <= 0.0 {
            return Err(ConfigError::Validation(
                "take_profit_percentage must be positive".to_string(),
            ));
        }

        if p.price_lock_enabled && p.price_lock_threshold <= 0.0 {
            return Err(ConfigError::Validation(
                "price_lock_threshold must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(String),

    #[error("Failed to write config file: {0}")]
    FileWrite(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}
