// In-process simulated exchange for dry runs and integration tests.
// Fills crossed limit orders on each price tick with a little execution
// jitter so the loop sees realistic event interleavings.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rand::{thread_rng, Rng};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::types::{ObservedOrder, ObservedOrderStatus, PositionSnapshot, Side};
use crate::error::{TradingError, TradingResult};
use crate::exchange::{ExchangeClient, ExchangeEvent, FillEvent, PositionUpdate};

#[derive(Debug, Clone)]
struct PaperOrder {
    id: String,
    price: f64,
    quantity: f64,
    side: Side,
}

#[derive(Debug)]
struct PaperBook {
    open_orders: Vec<PaperOrder>,
    quantity: f64,
    position_cost: f64,
    collateral: f64,
    last_price: f64,
    min_order_size: f64,
    subscribers: Vec<mpsc::UnboundedSender<ExchangeEvent>>,
}

/// Simulated venue backing `--paper` mode.
pub struct PaperExchange {
    book: Mutex<PaperBook>,
}

impl PaperExchange {
    pub fn new(initial_collateral: f64, min_order_size: f64) -> Self {
        Self {
            book: Mutex::new(PaperBook {
                open_orders: Vec::new(),
                quantity: 0.0,
                position_cost: 0.0,
                collateral: initial_collateral,
                last_price: 0.0,
                min_order_size,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Advance the simulated market to `price`, filling any crossed orders
    /// and emitting the resulting events.
    pub fn tick(&self, price: f64) {
        let mut events = Vec::new();
        {
            let mut book = self.book.lock().unwrap();
            book.last_price = price;

            let crossed: Vec<PaperOrder> = book
                .open_orders
                .iter()
                .filter(|o| match o.side {
                    Side::Buy => price <= o.price,
                    Side::Sell => price >= o.price,
                })
                .cloned()
                .collect();

            for order in crossed {
                book.open_orders.retain(|o| o.id != order.id);

                // Small favourable-jitter on execution, as venues fill
                // resting limit orders at or better than the limit price
                let jitter = thread_rng().gen_range(0.0..0.0005);
                let exec_price = match order.side {
                    Side::Buy => order.price * (1.0 - jitter),
                    Side::Sell => order.price * (1.0 + jitter),
                };

                let signed = match order.side {
                    Side::Buy => order.quantity,
                    Side::Sell => -order.quantity,
                };
                if book.quantity != 0.0 && book.quantity.signum() != signed.signum() {
                    let avg = book.position_cost / book.quantity.abs();
                    let closed = order.quantity.min(book.quantity.abs());
                    let pnl = if book.quantity > 0.0 {
                        (exec_price - avg) * closed
                    } else {
                        (avg - exec_price) * closed
                    };
                    book.collateral += pnl;
                    book.position_cost -= avg * closed;
                    // Remainder of a zero-crossing fill opens at execution
                    let flipped = order.quantity - closed;
                    if flipped > 0.0 {
                        book.position_cost = exec_price * flipped;
                    }
                } else {
                    book.position_cost += exec_price * order.quantity;
                }
                book.quantity += signed;
                if book.quantity == 0.0 {
                    book.position_cost = 0.0;
                }

                debug!("📝 Paper fill: {} {:.6} @ {:.4}", order.side, order.quantity, exec_price);

                events.push(ExchangeEvent::Fill(FillEvent {
                    fill_id: Uuid::new_v4().to_string(),
                    order_id: order.id.clone(),
                    price: exec_price,
                    quantity: order.quantity,
                    side: order.side,
                    timestamp: Utc::now(),
                }));
                events.push(ExchangeEvent::PositionUpdate(PositionUpdate {
                    quantity: book.quantity,
                    entry_price: if book.quantity != 0.0 {
                        book.position_cost / book.quantity.abs()
                    } else {
                        0.0
                    },
                    collateral: book.collateral,
                    timestamp: Utc::now(),
                }));
            }

            events.push(ExchangeEvent::PriceTick {
                price,
                timestamp: Utc::now(),
            });
        }
        self.broadcast(events);
    }

    fn broadcast(&self, events: Vec<ExchangeEvent>) {
        let mut book = self.book.lock().unwrap();
        for event in events {
            book.subscribers
                .retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn place_order(&self, price: f64, quantity: f64, side: Side) -> TradingResult<String> {
        let mut book = self.book.lock().unwrap();
        if quantity < book.min_order_size {
            return Err(TradingError::OrderRejected(format!(
                "quantity {:.8} below minimum size {:.8}",
                quantity, book.min_order_size
            )));
        }
        let id = Uuid::new_v4().to_string();
        book.open_orders.push(PaperOrder {
            id: id.clone(),
            price,
            quantity,
            side,
        });
        info!("📬 Paper order placed: {} {:.6} @ {:.4}", side, quantity, price);
        Ok(id)
    }

    async fn cancel_order(&self, order_id: &str) -> TradingResult<()> {
        let mut book = self.book.lock().unwrap();
        let before = book.open_orders.len();
        book.open_orders.retain(|o| o.id != order_id);
        if book.open_orders.len() == before {
            return Err(TradingError::CancelFailed(format!(
                "order {} not found",
                order_id
            )));
        }
        Ok(())
    }

    async fn list_open_orders(&self) -> TradingResult<Vec<ObservedOrder>> {
        let book = self.book.lock().unwrap();
        Ok(book
            .open_orders
            .iter()
            .map(|o| ObservedOrder {
                id: o.id.clone(),
                price: o.price,
                quantity: o.quantity,
                side: o.side,
                status: ObservedOrderStatus::Open,
            })
            .collect())
    }

    async fn get_position(&self) -> TradingResult<PositionSnapshot> {
        let book = self.book.lock().unwrap();
        let average_cost = if book.quantity != 0.0 {
            book.position_cost / book.quantity.abs()
        } else {
            0.0
        };
        let unrealized = if book.quantity != 0.0 {
            (book.last_price - average_cost) * book.quantity
        } else {
            0.0
        };
        Ok(PositionSnapshot {
            quantity: book.quantity,
            average_cost,
            current_collateral: book.collateral,
            unrealized_pnl: unrealized,
            timestamp: Utc::now(),
        })
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ExchangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.book.lock().unwrap().subscribers.push(tx);
        rx
    }
}
