//! Unified error handling for the grid reconciliation loop
//!
//! This module provides a single error type that replaces Box<dyn Error>
//! throughout the application with context-rich, actionable error messages.

use std::fmt;
use std::io;

/// Main error type for the grid bot
#[derive(Debug)]
pub enum TradingError {
    // Configuration errors
    ConfigNotFound(String),
    ConfigParse(String),
    ConfigValidation(String),

    // Exchange errors
    ExchangeConnection(String),
    ExchangeTimeout(String),
    ExchangeRateLimit(String),
    ExchangeResponse(String),

    // Order errors
    OrderRejected(String),
    OrderFailed(String),
    CancelFailed(String),

    // Reconciliation / protection errors
    ResetConfirmationTimeout(usize), // polls attempted
    ReconciliationAnomaly(String),
    ProtectionConflict(String),
    LoopPaused(String),

    // Persistence errors
    StateRead(String),
    StateWrite(String),
    StateParse(String),

    // General errors
    ChannelClosed(String),
    Internal(String),
}

impl TradingError {
    /// Check if error is retryable (transient exchange conditions only)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TradingError::ExchangeConnection(_)
                | TradingError::ExchangeTimeout(_)
                | TradingError::ExchangeRateLimit(_)
        )
    }

    /// Get error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            TradingError::ConfigNotFound(_)
            | TradingError::ConfigParse(_)
            | TradingError::ConfigValidation(_) => "config",

            TradingError::ExchangeConnection(_)
            | TradingError::ExchangeTimeout(_)
            | TradingError::ExchangeRateLimit(_)
            | TradingError::ExchangeResponse(_) => "exchange",

            TradingError::OrderRejected(_)
            | TradingError::OrderFailed(_)
            | TradingError::CancelFailed(_) => "order",

            TradingError::ResetConfirmationTimeout(_)
            | TradingError::ReconciliationAnomaly(_)
            | TradingError::ProtectionConflict(_)
            | TradingError::LoopPaused(_) => "reconciliation",

            TradingError::StateRead(_)
            | TradingError::StateWrite(_)
            | TradingError::StateParse(_) => "persistence",

            TradingError::ChannelClosed(_) | TradingError::Internal(_) => "internal",
        }
    }

    /// Fatal errors stop the coordinator instead of being retried or logged
    /// and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TradingError::ResetConfirmationTimeout(_)
                | TradingError::LoopPaused(_)
                | TradingError::ChannelClosed(_)
        )
    }
}

impl fmt::Display for TradingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingError::ConfigNotFound(path) => {
                write!(f, "Configuration file not found: {}", path)
            }
            TradingError::ConfigParse(msg) => {
                write!(f, "Configuration parse error: {}", msg)
            }
            TradingError::ConfigValidation(msg) => {
                write!(f, "Configuration validation error: {}", msg)
            }

            TradingError::ExchangeConnection(msg) => {
                write!(f, "Exchange connection error: {}", msg)
            }
            TradingError::ExchangeTimeout(msg) => {
                write!(f, "Exchange timeout: {}", msg)
            }
            TradingError::ExchangeRateLimit(msg) => {
                write!(f, "Exchange rate limit exceeded: {}", msg)
            }
            TradingError::ExchangeResponse(msg) => {
                write!(f, "Exchange response error: {}", msg)
            }

            TradingError::OrderRejected(msg) => {
                write!(f, "Order rejected: {}", msg)
            }
            TradingError::OrderFailed(msg) => {
                write!(f, "Order failed: {}", msg)
            }
            TradingError::CancelFailed(msg) => {
                write!(f, "Cancel failed: {}", msg)
            }

            TradingError::ResetConfirmationTimeout(polls) => {
                write!(
                    f,
                    "Reset aborted: open orders still unconfirmed after {} cancellation polls",
                    polls
                )
            }
            TradingError::ReconciliationAnomaly(msg) => {
                write!(f, "Reconciliation anomaly: {}", msg)
            }
            TradingError::ProtectionConflict(msg) => {
                write!(f, "Protection state conflict: {}", msg)
            }
            TradingError::LoopPaused(msg) => {
                write!(f, "Trading loop paused: {}", msg)
            }

            TradingError::StateRead(msg) => {
                write!(f, "State file read error: {}", msg)
            }
            TradingError::StateWrite(msg) => {
                write!(f, "State file write error: {}", msg)
            }
            TradingError::StateParse(msg) => {
                write!(f, "State file parse error: {}", msg)
            }

            TradingError::ChannelClosed(msg) => {
                write!(f, "Event channel closed: {}", msg)
            }
            TradingError::Internal(msg) => {
                write!(f, "Internal error: {}", msg)
            }
        }
    }
}

impl std::error::Error for TradingError {}

// Conversion implementations for common error types

impl From<io::Error> for TradingError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => TradingError::StateRead(err.to_string()),
            io::ErrorKind::TimedOut => TradingError::ExchangeTimeout(err.to_string()),
            io::ErrorKind::ConnectionRefused => TradingError::ExchangeConnection(err.to_string()),
            _ => TradingError::Internal(format!("IO error: {}", err)),
        }
    }
}

impl From<serde_json::Error> for TradingError {
    fn from(err: serde_json::Error) -> Self {
        TradingError::StateParse(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for TradingError {
    fn from(err: toml::de::Error) -> Self {
        TradingError::ConfigParse(format!("TOML parse error: {}", err))
    }
}

impl From<crate::config::ConfigError> for TradingError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::FileRead(msg) => TradingError::ConfigNotFound(msg),
            ConfigError::FileWrite(msg) => TradingError::Internal(msg),
            ConfigError::Parse(msg) => TradingError::ConfigParse(msg),
            ConfigError::Serialize(msg) => TradingError::Internal(msg),
            ConfigError::Validation(msg) => TradingError::ConfigValidation(msg),
        }
    }
}

impl From<String> for TradingError {
    fn from(msg: String) -> Self {
        TradingError::Internal(msg)
    }
}

impl From<&str> for TradingError {
    fn from(msg: &str) -> Self {
        TradingError::Internal(msg.to_string())
    }
}

/// Result type alias using TradingError
pub type TradingResult<T> = Result<T, TradingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TradingError::OrderRejected("below minimum size".to_string());
        assert!(err.to_string().contains("below minimum size"));
    }

    #[test]
    fn test_error_category() {
        let err = TradingError::ConfigValidation("test".to_string());
        assert_eq!(err.category(), "config");

        let err = TradingError::ExchangeTimeout("test".to_string());
        assert_eq!(err.category(), "exchange");

        let err = TradingError::ResetConfirmationTimeout(3);
        assert_eq!(err.category(), "reconciliation");
    }

    #[test]
    fn test_retryable() {
        assert!(TradingError::ExchangeTimeout("test".to_string()).is_retryable());
        assert!(TradingError::ExchangeRateLimit("test".to_string()).is_retryable());
        // Placement rejections indicate a configuration problem, never retried
        assert!(!TradingError::OrderRejected("test".to_string()).is_retryable());
    }

    #[test]
    fn test_fatal() {
        assert!(TradingError::ResetConfirmationTimeout(3).is_fatal());
        assert!(!TradingError::ExchangeTimeout("test".to_string()).is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "test");
        let err: TradingError = io_err.into();
        assert!(matches!(err, TradingError::StateRead(_)));
    }
}
