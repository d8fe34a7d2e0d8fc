// Shared test helpers: canonical config + a scripted mock exchange

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use perp_grid_bot::exchange::{ExchangeClient, ExchangeEvent, FillEvent};
use perp_grid_bot::{
    Config, GridDirection, GridMode, ObservedOrder, PositionSnapshot, Side, TradingError,
    TradingResult,
};
use perp_grid_bot::core::types::ObservedOrderStatus;

/// A 20-level long ladder over [900, 1100] with a 10.0 interval.
pub fn create_test_config() -> Config {
    let mut config = Config::default();
    config.grid.symbol = "TEST-PERP".to_string();
    config.grid.direction = GridDirection::Long;
    config.grid.grid_type = GridMode::Fixed;
    config.grid.lower_price = 900.0;
    config.grid.upper_price = 1100.0;
    config.grid.grid_interval = 10.0;
    config.grid.order_amount = 0.01;
    config.grid.martingale_increment = 0.0;
    config.grid.quantity_precision = 4;
    config.grid.price_tick = 0.1;
    config.grid.reverse_order_grid_distance = 1;
    config.state_file = format!(
        "{}/grid-state-{}.json",
        std::env::temp_dir().display(),
        uuid::Uuid::new_v4()
    );
    config
}

/// One recorded exchange interaction, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Place { price: f64, quantity: f64, side: Side },
    Cancel { order_id: String },
    ListOpenOrders { returned: usize },
}

#[derive(Debug)]
struct MockState {
    open_orders: Vec<ObservedOrder>,
    scripted_lists: VecDeque<Vec<ObservedOrder>>,
    position: PositionSnapshot,
    calls: Vec<MockCall>,
    reject_placements: bool,
    subscribers: Vec<mpsc::UnboundedSender<ExchangeEvent>>,
}

/// Trait-level mock: tracks placed/cancelled orders like a real venue, and
/// optionally serves scripted `list_open_orders` responses so tests can
/// simulate laggy cancellation confirmation.
pub struct MockExchange {
    state: Mutex<MockState>,
    next_id: AtomicU64,
}

impl MockExchange {
    pub fn new(collateral: f64) -> Self {
        Self {
            state: Mutex::new(MockState {
                open_orders: Vec::new(),
                scripted_lists: VecDeque::new(),
                position: PositionSnapshot {
                    quantity: 0.0,
                    average_cost: 0.0,
                    current_collateral: collateral,
                    unrealized_pnl: 0.0,
                    timestamp: Utc::now(),
                },
                calls: Vec::new(),
                reject_placements: false,
                subscribers: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Queue a canned `list_open_orders` response; once the queue drains,
    /// the mock falls back to its tracked open orders.
    pub fn script_open_orders(&self, response: Vec<ObservedOrder>) {
        self.state
            .lock()
            .unwrap()
            .scripted_lists
            .push_back(response);
    }

    pub fn stale_order(id: &str, price: f64, side: Side) -> ObservedOrder {
        ObservedOrder {
            id: id.to_string(),
            price,
            quantity: 0.01,
            side,
            status: ObservedOrderStatus::Open,
        }
    }

    pub fn set_position(&self, quantity: f64, average_cost: f64, collateral: f64) {
        let mut state = self.state.lock().unwrap();
        state.position.quantity = quantity;
        state.position.average_cost = average_cost;
        state.position.current_collateral = collateral;
        state.position.timestamp = Utc::now();
    }

    pub fn set_reject_placements(&self, reject: bool) {
        self.state.lock().unwrap().reject_placements = reject;
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn open_orders(&self) -> Vec<ObservedOrder> {
        self.state.lock().unwrap().open_orders.clone()
    }

    /// Find the tracked order resting at `price`.
    pub fn order_at(&self, price: f64) -> Option<ObservedOrder> {
        self.state
            .lock()
            .unwrap()
            .open_orders
            .iter()
            .find(|o| (o.price - price).abs() < 1e-9)
            .cloned()
    }

    pub fn emit(&self, event: ExchangeEvent) {
        let mut state = self.state.lock().unwrap();
        state.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn emit_tick(&self, price: f64) {
        self.emit(ExchangeEvent::PriceTick {
            price,
            timestamp: Utc::now(),
        });
    }

    /// Simulate an exchange-side fill of a resting order: removes it from
    /// the book and emits the fill event.
    pub fn fill_order(&self, order_id: &str) -> FillEvent {
        let mut state = self.state.lock().unwrap();
        let index = state
            .open_orders
            .iter()
            .position(|o| o.id == order_id)
            .expect("fill_order: unknown order id");
        let order = state.open_orders.remove(index);
        let fill = FillEvent {
            fill_id: format!("fill-{}", order.id),
            order_id: order.id.clone(),
            price: order.price,
            quantity: order.quantity,
            side: order.side,
            timestamp: Utc::now(),
        };
        let event = ExchangeEvent::Fill(fill.clone());
        state.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        fill
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn place_order(&self, price: f64, quantity: f64, side: Side) -> TradingResult<String> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(MockCall::Place {
            price,
            quantity,
            side,
        });
        if state.reject_placements {
            return Err(TradingError::OrderRejected(
                "placement rejected by test script".to_string(),
            ));
        }
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        state.open_orders.push(ObservedOrder {
            id: id.clone(),
            price,
            quantity,
            side,
            status: ObservedOrderStatus::Open,
        });
        Ok(id)
    }

    async fn cancel_order(&self, order_id: &str) -> TradingResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(MockCall::Cancel {
            order_id: order_id.to_string(),
        });
        state.open_orders.retain(|o| o.id != order_id);
        Ok(())
    }

    async fn list_open_orders(&self) -> TradingResult<Vec<ObservedOrder>> {
        let mut state = self.state.lock().unwrap();
        let response = match state.scripted_lists.pop_front() {
            Some(scripted) => scripted,
            None => state.open_orders.clone(),
        };
        state.calls.push(MockCall::ListOpenOrders {
            returned: response.len(),
        });
        Ok(response)
    }

    async fn get_position(&self) -> TradingResult<PositionSnapshot> {
        Ok(self.state.lock().unwrap().position.clone())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ExchangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().subscribers.push(tx);
        rx
    }
}
