/*
[INPUT]:  Venue implementations (paper, live adapters)
[OUTPUT]: Executor trait consumed by the grid engine
[POS]:    Contract layer - the only seam between engine and venue
[UPDATE]: When the executor contract gains or changes operations
*/

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::Result;
use crate::types::{OpenOrder, Position, Side, Trade};

/// Order execution contract.
///
/// Every quantity crossing this trait is expressed in base-asset units. Venues that
/// trade contracts convert on their side of the boundary.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn get_position(&self) -> Result<Position>;

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>>;

    /// Submit a limit order and return the venue order id.
    async fn place_order(&self, side: Side, price: Decimal, qty: Decimal) -> Result<String>;

    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    /// Recent fills, newest last.
    async fn get_trade_history(&self) -> Result<Vec<Trade>>;
}

#[async_trait]
impl<E: Executor + ?Sized> Executor for Arc<E> {
    async fn get_position(&self) -> Result<Position> {
        (**self).get_position().await
    }

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>> {
        (**self).get_open_orders().await
    }

    async fn place_order(&self, side: Side, price: Decimal, qty: Decimal) -> Result<String> {
        (**self).place_order(side, price, qty).await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        (**self).cancel_order(order_id).await
    }

    async fn get_trade_history(&self) -> Result<Vec<Trade>> {
        (**self).get_trade_history().await
    }
}
