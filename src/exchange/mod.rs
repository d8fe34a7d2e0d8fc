// Exchange collaborator boundary: everything the control loop needs from
// the venue, behind one async trait.

pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::warn;

use crate::core::types::{ObservedOrder, PositionSnapshot, Side};
use crate::error::{TradingError, TradingResult};

/// Exchange-assigned fill notification.
#[derive(Debug, Clone, PartialEq)]
pub struct FillEvent {
    pub fill_id: String,
    pub order_id: String,
    pub price: f64,
    pub quantity: f64,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
}

/// Authoritative position push from the venue.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionUpdate {
    pub quantity: f64,
    pub entry_price: f64,
    pub collateral: f64,
    pub timestamp: DateTime<Utc>,
}

/// Streamed events feeding the coordinator's single consumer queue.
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeEvent {
    Fill(FillEvent),
    PositionUpdate(PositionUpdate),
    PriceTick { price: f64, timestamp: DateTime<Utc> },
}

/// The venue interface. I/O may run concurrently; its effects are always
/// applied back through the coordinator's serialized loop.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn place_order(&self, price: f64, quantity: f64, side: Side) -> TradingResult<String>;

    async fn cancel_order(&self, order_id: &str) -> TradingResult<()>;

    async fn list_open_orders(&self) -> TradingResult<Vec<ObservedOrder>>;

    async fn get_position(&self) -> TradingResult<PositionSnapshot>;

    /// Register a new event stream consumer. Events from the exchange
    /// preserve arrival order per producer.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ExchangeEvent>;
}

const READ_RETRY_ATTEMPTS: usize = 3;

/// Retry a read call with exponential backoff on transient exchange errors.
/// Mutating calls are never routed through here; a rejected placement is a
/// configuration problem, not a network hiccup.
pub async fn retry_read<T, F, Fut>(description: &str, mut op: F) -> TradingResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = TradingResult<T>>,
{
    let mut delay = Duration::from_millis(250);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < READ_RETRY_ATTEMPTS => {
                warn!(
                    "⚠️  {} failed (attempt {}/{}): {} - retrying in {:?}",
                    description, attempt, READ_RETRY_ATTEMPTS, err, delay
                );
                sleep(delay).await;
                delay *= 2;
            }
            Err(err) => {
                return Err(match err {
                    e if e.is_retryable() => {
                        TradingError::ExchangeTimeout(format!("{} exhausted retries: {}", description, e))
                    }
                    e => e,
                })
            }
        }
    }
}
