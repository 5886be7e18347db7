/*
[INPUT]:  Orders from the engine in base units, scripted price moves and fault plans
[OUTPUT]: In-memory order book, position and fill history in contract units
[POS]:    Venue layer - paper executor for dry runs and tests
[UPDATE]: When simulated matching rules or fault injection options change
*/

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ExchangeError, Result};
use crate::executor::Executor;
use crate::types::{ContractSpec, OpenOrder, OrderStatus, Position, Side, Trade};

/// Failure plan applied to subsequent calls.
#[derive(Debug, Clone, Default)]
pub struct PaperFault {
    /// Cancels of these ids fail with a rejection.
    pub reject_cancel_ids: HashSet<String>,
    /// Every cancel fails while set.
    pub reject_all_cancels: bool,
    /// The next N place calls fail with `Unavailable`.
    pub fail_next_places: u32,
    /// The next N place calls rest on the book but report `Timeout`.
    pub timeout_next_places: u32,
    /// Place calls rest on the book, then answer only after this delay.
    pub place_latency: Option<Duration>,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    id: String,
    side: Side,
    price: Decimal,
    contracts: Decimal,
    filled_contracts: Decimal,
    status: OrderStatus,
    created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Book {
    mark_price: Decimal,
    position_contracts: Decimal,
    entry_price: Decimal,
    orders: Vec<PaperOrder>,
    trades: Vec<Trade>,
    faults: PaperFault,
    next_id: u64,
    last_ts: DateTime<Utc>,
    place_calls: u64,
    cancel_calls: u64,
}

impl Book {
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = if now > self.last_ts {
            now
        } else {
            self.last_ts + TimeDelta::microseconds(1)
        };
        self.last_ts = ts;
        ts
    }

    fn next_order_id(&mut self) -> String {
        self.next_id += 1;
        format!("P{:08}", self.next_id)
    }
}

/// In-memory venue that trades whole contracts.
///
/// Orders fill only when `fill_order`, `partial_fill` or `move_price` is called.
#[derive(Debug)]
pub struct PaperExchange {
    spec: ContractSpec,
    book: Mutex<Book>,
}

impl PaperExchange {
    pub fn new(spec: ContractSpec, mark_price: Decimal, initial_holdings: Decimal) -> Self {
        let position_contracts = spec.base_to_contracts(initial_holdings);
        Self {
            spec,
            book: Mutex::new(Book {
                mark_price,
                position_contracts,
                entry_price: if position_contracts > Decimal::ZERO {
                    mark_price
                } else {
                    Decimal::ZERO
                },
                orders: Vec::new(),
                trades: Vec::new(),
                faults: PaperFault::default(),
                next_id: 0,
                last_ts: DateTime::<Utc>::MIN_UTC,
                place_calls: 0,
                cancel_calls: 0,
            }),
        }
    }

    pub fn contract_spec(&self) -> &ContractSpec {
        &self.spec
    }

    pub async fn set_faults(&self, faults: PaperFault) {
        self.book.lock().await.faults = faults;
    }

    pub async fn clear_faults(&self) {
        self.book.lock().await.faults = PaperFault::default();
    }

    pub async fn set_mark_price(&self, price: Decimal) {
        self.book.lock().await.mark_price = price;
    }

    /// Number of place and cancel calls received, including failed ones.
    pub async fn call_counts(&self) -> (u64, u64) {
        let book = self.book.lock().await;
        (book.place_calls, book.cancel_calls)
    }

    /// Rest an order without counting it as an engine call.
    pub async fn seed_order(&self, side: Side, price: Decimal, qty: Decimal) -> String {
        let contracts = self.spec.base_to_contracts(qty);
        let mut book = self.book.lock().await;
        let id = book.next_order_id();
        let created_at = book.next_timestamp();
        book.orders.push(PaperOrder {
            id: id.clone(),
            side,
            price,
            contracts,
            filled_contracts: Decimal::ZERO,
            status: OrderStatus::Open,
            created_at,
        });
        id
    }

    /// Fully fill a resting order and return the resulting trade.
    pub async fn fill_order(&self, order_id: &str) -> Result<Trade> {
        let mut book = self.book.lock().await;
        let index = book
            .orders
            .iter()
            .position(|o| o.id == order_id && o.status.is_resting())
            .ok_or_else(|| ExchangeError::UnknownOrder {
                order_id: order_id.to_string(),
            })?;
        let remaining = book.orders[index].contracts - book.orders[index].filled_contracts;
        Ok(self.fill_at(&mut book, index, remaining))
    }

    /// Fill part of a resting order. The slice is capped at what remains.
    pub async fn partial_fill(&self, order_id: &str, qty: Decimal) -> Result<Trade> {
        let mut book = self.book.lock().await;
        let index = book
            .orders
            .iter()
            .position(|o| o.id == order_id && o.status.is_resting())
            .ok_or_else(|| ExchangeError::UnknownOrder {
                order_id: order_id.to_string(),
            })?;
        let order = &book.orders[index];
        let slice = self
            .spec
            .base_to_contracts(qty)
            .min(order.contracts - order.filled_contracts);
        if slice <= Decimal::ZERO {
            return Err(ExchangeError::InvalidOrder(format!("fill qty {qty}")));
        }
        Ok(self.fill_at(&mut book, index, slice))
    }

    /// Move the mark price and fill every order it crosses.
    pub async fn move_price(&self, price: Decimal) -> Vec<Trade> {
        let mut book = self.book.lock().await;
        book.mark_price = price;
        let crossed: Vec<usize> = book
            .orders
            .iter()
            .enumerate()
            .filter(|(_, o)| o.status.is_resting())
            .filter(|(_, o)| match o.side {
                Side::Buy => o.price >= price,
                Side::Sell => o.price <= price,
            })
            .map(|(i, _)| i)
            .collect();
        crossed
            .into_iter()
            .map(|index| {
                let remaining = book.orders[index].contracts - book.orders[index].filled_contracts;
                self.fill_at(&mut book, index, remaining)
            })
            .collect()
    }

    fn fill_at(&self, book: &mut Book, index: usize, fill_contracts: Decimal) -> Trade {
        let timestamp = book.next_timestamp();
        let order = &mut book.orders[index];
        order.filled_contracts += fill_contracts;
        order.status = if order.filled_contracts >= order.contracts {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        let side = order.side;
        let price = order.price;
        let order_id = order.id.clone();

        match side {
            Side::Buy => {
                let prior = book.position_contracts;
                let total = prior + fill_contracts;
                if total > Decimal::ZERO {
                    book.entry_price = (book.entry_price * prior + price * fill_contracts) / total;
                }
                book.position_contracts = total;
            }
            Side::Sell => {
                book.position_contracts -= fill_contracts;
                if book.position_contracts <= Decimal::ZERO {
                    book.entry_price = Decimal::ZERO;
                }
            }
        }

        let trade = Trade {
            id: format!("T{}", book.trades.len() + 1),
            order_id,
            side,
            price,
            qty: self.spec.contracts_to_base(fill_contracts),
            timestamp,
        };
        info!(
            order_id = %trade.order_id,
            side = %trade.side,
            price = %trade.price,
            qty = %trade.qty,
            "paper fill"
        );
        book.trades.push(trade.clone());
        trade
    }
}

#[async_trait]
impl Executor for PaperExchange {
    async fn get_position(&self) -> Result<Position> {
        let book = self.book.lock().await;
        Ok(Position {
            qty: self.spec.contracts_to_base(book.position_contracts),
            entry_price: book.entry_price,
            mark_price: book.mark_price,
        })
    }

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>> {
        let book = self.book.lock().await;
        Ok(book
            .orders
            .iter()
            .filter(|o| o.status.is_resting())
            .map(|o| OpenOrder {
                id: o.id.clone(),
                side: o.side,
                price: o.price,
                qty: self.spec.contracts_to_base(o.contracts),
                filled_qty: self.spec.contracts_to_base(o.filled_contracts),
                status: o.status,
                created_at: o.created_at,
            })
            .collect())
    }

    async fn place_order(&self, side: Side, price: Decimal, qty: Decimal) -> Result<String> {
        let mut book = self.book.lock().await;
        book.place_calls += 1;

        if book.faults.fail_next_places > 0 {
            book.faults.fail_next_places -= 1;
            return Err(ExchangeError::Unavailable("paper place fault".to_string()));
        }
        if price <= Decimal::ZERO {
            return Err(ExchangeError::InvalidOrder(format!("price {price}")));
        }
        let contracts = self.spec.base_to_contracts(qty);
        if contracts <= Decimal::ZERO || qty < self.spec.min_qty {
            return Err(ExchangeError::InvalidOrder(format!(
                "qty {qty} below minimum {}",
                self.spec.min_qty
            )));
        }

        let id = book.next_order_id();
        let created_at = book.next_timestamp();
        book.orders.push(PaperOrder {
            id: id.clone(),
            side,
            price,
            contracts,
            filled_contracts: Decimal::ZERO,
            status: OrderStatus::Open,
            created_at,
        });
        debug!(order_id = %id, side = %side, price = %price, contracts = %contracts, "paper order rested");

        if book.faults.timeout_next_places > 0 {
            book.faults.timeout_next_places -= 1;
            return Err(ExchangeError::Timeout { duration: 0 });
        }
        if let Some(latency) = book.faults.place_latency {
            drop(book);
            tokio::time::sleep(latency).await;
        }
        Ok(id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let mut book = self.book.lock().await;
        book.cancel_calls += 1;

        if book.faults.reject_all_cancels || book.faults.reject_cancel_ids.contains(order_id) {
            return Err(ExchangeError::Rejected {
                reason: format!("paper cancel fault for {order_id}"),
            });
        }
        let order = book
            .orders
            .iter_mut()
            .find(|o| o.id == order_id && o.status.is_resting())
            .ok_or_else(|| ExchangeError::UnknownOrder {
                order_id: order_id.to_string(),
            })?;
        order.status = OrderStatus::Cancelled;
        debug!(order_id = %order_id, "paper order cancelled");
        Ok(())
    }

    async fn get_trade_history(&self) -> Result<Vec<Trade>> {
        Ok(self.book.lock().await.trades.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn paper() -> PaperExchange {
        PaperExchange::new(ContractSpec::default(), dec("95000"), Decimal::ZERO)
    }

    #[tokio::test]
    async fn place_converts_to_contracts_and_back() {
        let ex = paper();
        let id = ex
            .place_order(Side::Sell, dec("96000"), dec("0.00149"))
            .await
            .expect("place");
        let orders = ex.get_open_orders().await.expect("orders");
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].id, id);
        assert_eq!(orders[0].qty, dec("0.0014"));
    }

    #[tokio::test]
    async fn place_below_min_is_rejected() {
        let ex = paper();
        let err = ex
            .place_order(Side::Buy, dec("94000"), dec("0.00005"))
            .await
            .expect_err("below min");
        assert!(matches!(err, ExchangeError::InvalidOrder(_)));
    }

    #[tokio::test]
    async fn buy_fill_grows_position() {
        let ex = paper();
        let id = ex
            .place_order(Side::Buy, dec("94000"), dec("0.001"))
            .await
            .expect("place");
        let trade = ex.fill_order(&id).await.expect("fill");
        assert_eq!(trade.qty, dec("0.001"));
        let position = ex.get_position().await.expect("position");
        assert_eq!(position.qty, dec("0.001"));
        assert_eq!(position.entry_price, dec("94000"));
        assert!(ex.get_open_orders().await.expect("orders").is_empty());
    }

    #[tokio::test]
    async fn partial_fill_keeps_order_resting_until_done() {
        let ex = paper();
        let id = ex
            .place_order(Side::Sell, dec("96000"), dec("0.0007"))
            .await
            .expect("place");
        let first = ex.partial_fill(&id, dec("0.0003")).await.expect("slice");
        assert_eq!(first.qty, dec("0.0003"));
        let orders = ex.get_open_orders().await.expect("orders");
        assert_eq!(orders[0].status, OrderStatus::PartiallyFilled);
        assert_eq!(orders[0].remaining_qty(), dec("0.0004"));

        let rest = ex.partial_fill(&id, dec("0.001")).await.expect("slice");
        assert_eq!(rest.qty, dec("0.0004"));
        assert!(ex.get_open_orders().await.expect("orders").is_empty());
        assert!(ex.partial_fill(&id, dec("0.0001")).await.is_err());
    }

    #[tokio::test]
    async fn move_price_fills_crossed_orders_only() {
        let ex = paper();
        ex.place_order(Side::Buy, dec("94000"), dec("0.001"))
            .await
            .expect("place");
        ex.place_order(Side::Buy, dec("93000"), dec("0.001"))
            .await
            .expect("place");
        let trades = ex.move_price(dec("93500")).await;
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].price, dec("94000"));
        assert_eq!(ex.get_open_orders().await.expect("orders").len(), 1);
    }

    #[tokio::test]
    async fn cancel_fault_leaves_order_resting() {
        let ex = paper();
        let id = ex
            .place_order(Side::Buy, dec("94000"), dec("0.001"))
            .await
            .expect("place");
        ex.set_faults(PaperFault {
            reject_all_cancels: true,
            ..PaperFault::default()
        })
        .await;
        assert!(ex.cancel_order(&id).await.is_err());
        assert_eq!(ex.get_open_orders().await.expect("orders").len(), 1);
        assert_eq!(ex.call_counts().await, (1, 1));
    }

    #[tokio::test]
    async fn timed_out_place_still_rests() {
        let ex = paper();
        ex.set_faults(PaperFault {
            timeout_next_places: 1,
            ..PaperFault::default()
        })
        .await;
        let err = ex
            .place_order(Side::Buy, dec("94000"), dec("0.001"))
            .await
            .expect_err("timeout");
        assert!(err.is_unknown_outcome());
        assert_eq!(ex.get_open_orders().await.expect("orders").len(), 1);
    }
}
