use crate::broker::adapter::{
    BrokerAck, BrokerError, BrokerOrder, BrokerOrderRequest, BrokerPort, BrokerPosition,
};
use crate::model::{OrderType, Side};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal::prelude::Signed;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Simulated broker backend. Market orders fill immediately at the marked
/// price; limit orders rest on the book until cancelled. Account balances
/// are mutated under a per-account lock so concurrent fills cannot lose an
/// update.
pub struct PaperBroker {
    marks: DashMap<String, Decimal>,
    accounts: DashMap<String, Mutex<PaperAccount>>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct PaperAccount {
    cash: Decimal,
    open_orders: Vec<BrokerOrder>,
    positions: Vec<BrokerPosition>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self {
            marks: DashMap::new(),
            accounts: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn set_mark_price(&self, symbol: &str, price: Decimal) {
        self.marks.insert(symbol.to_string(), price);
    }

    pub fn fund(&self, user_id: &str, cash: Decimal) {
        let account = self
            .accounts
            .entry(user_id.to_string())
            .or_insert_with(|| Mutex::new(PaperAccount::default()));
        account.lock().cash = cash;
    }

    /// Seed a resting order directly, used to model state the bot did not
    /// create (the reconciliation target scenario).
    pub fn seed_order(&self, user_id: &str, order: BrokerOrder) {
        let account = self
            .accounts
            .entry(user_id.to_string())
            .or_insert_with(|| Mutex::new(PaperAccount::default()));
        account.lock().open_orders.push(order);
    }

    pub fn seed_position(&self, user_id: &str, position: BrokerPosition) {
        let account = self
            .accounts
            .entry(user_id.to_string())
            .or_insert_with(|| Mutex::new(PaperAccount::default()));
        account.lock().positions.push(position);
    }

    fn new_order_id(&self) -> String {
        format!("paper-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn apply_fill(account: &mut PaperAccount, symbol: &str, side: Side, qty: Decimal, px: Decimal) {
        let signed = match side {
            Side::Buy => qty,
            Side::Sell => -qty,
        };
        account.cash -= signed * px;

        if let Some(pos) = account.positions.iter_mut().find(|p| p.symbol == symbol) {
            let prev_qty = pos.quantity;
            pos.quantity += signed;
            if pos.quantity.is_zero() {
                account.positions.retain(|p| p.symbol != symbol);
            } else if prev_qty.signum() == signed.signum() {
                // Adding to the position: blend the entry
                let total = prev_qty.abs() + qty;
                pos.average_entry_price =
                    (pos.average_entry_price * prev_qty.abs() + px * qty) / total;
            }
        } else {
            account.positions.push(BrokerPosition {
                symbol: symbol.to_string(),
                quantity: signed,
                average_entry_price: px,
            });
        }
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerPort for PaperBroker {
    async fn open_orders(&self, user_id: &str) -> Result<Vec<BrokerOrder>, BrokerError> {
        Ok(self
            .accounts
            .get(user_id)
            .map(|a| a.lock().open_orders.clone())
            .unwrap_or_default())
    }

    async fn open_positions(&self, user_id: &str) -> Result<Vec<BrokerPosition>, BrokerError> {
        Ok(self
            .accounts
            .get(user_id)
            .map(|a| a.lock().positions.clone())
            .unwrap_or_default())
    }

    async fn place_order(
        &self,
        user_id: &str,
        request: BrokerOrderRequest,
    ) -> Result<BrokerAck, BrokerError> {
        let mark = self
            .marks
            .get(&request.symbol)
            .map(|p| *p)
            .or(request.limit_price)
            .ok_or_else(|| {
                BrokerError::Rejected(format!("no market price for {}", request.symbol))
            })?;

        let account = self
            .accounts
            .entry(user_id.to_string())
            .or_insert_with(|| Mutex::new(PaperAccount::default()));
        let mut account = account.lock();

        let broker_order_id = self.new_order_id();

        match request.order_type {
            OrderType::Market => {
                Self::apply_fill(
                    &mut account,
                    &request.symbol,
                    request.side,
                    request.quantity,
                    mark,
                );
                info!(
                    user_id,
                    symbol = %request.symbol,
                    qty = %request.quantity,
                    price = %mark,
                    "Paper fill"
                );
                Ok(BrokerAck {
                    broker_order_id,
                    status: "FILLED".to_string(),
                    filled_quantity: request.quantity,
                    average_price: Some(mark),
                })
            }
            OrderType::Limit => {
                let limit = request
                    .limit_price
                    .ok_or_else(|| BrokerError::Rejected("limit order without price".into()))?;

                // Marketable limits fill at the limit; the rest go on the book
                let marketable = match request.side {
                    Side::Buy => limit >= mark,
                    Side::Sell => limit <= mark,
                };
                if marketable {
                    Self::apply_fill(
                        &mut account,
                        &request.symbol,
                        request.side,
                        request.quantity,
                        limit,
                    );
                    Ok(BrokerAck {
                        broker_order_id,
                        status: "FILLED".to_string(),
                        filled_quantity: request.quantity,
                        average_price: Some(limit),
                    })
                } else {
                    account.open_orders.push(BrokerOrder {
                        broker_order_id: broker_order_id.clone(),
                        client_order_id: Some(request.client_order_id.clone()),
                        symbol: request.symbol.clone(),
                        side: request.side,
                        quantity: request.quantity,
                        filled_quantity: Decimal::ZERO,
                        average_price: None,
                        status: "ACKED".to_string(),
                    });
                    Ok(BrokerAck {
                        broker_order_id,
                        status: "ACKED".to_string(),
                        filled_quantity: Decimal::ZERO,
                        average_price: None,
                    })
                }
            }
        }
    }

    async fn cancel_order(
        &self,
        user_id: &str,
        broker_order_id: &str,
    ) -> Result<(), BrokerError> {
        let account = self
            .accounts
            .get(user_id)
            .ok_or_else(|| BrokerError::Rejected(format!("unknown account {}", user_id)))?;
        let mut account = account.lock();
        let before = account.open_orders.len();
        account
            .open_orders
            .retain(|o| o.broker_order_id != broker_order_id);
        if account.open_orders.len() == before {
            return Err(BrokerError::Rejected(format!(
                "unknown order {}",
                broker_order_id
            )));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "paper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrderType;
    use rust_decimal_macros::dec;

    fn market_buy(qty: Decimal) -> BrokerOrderRequest {
        BrokerOrderRequest {
            client_order_id: uuid::Uuid::new_v4().to_string(),
            symbol: "AAPL".to_string(),
            side: Side::Buy,
            order_type: OrderType::Market,
            quantity: qty,
            limit_price: None,
        }
    }

    #[tokio::test]
    async fn test_market_order_fills_at_mark() {
        let broker = PaperBroker::new();
        broker.set_mark_price("AAPL", dec!(190));
        broker.fund("u1", dec!(10000));

        let ack = broker.place_order("u1", market_buy(dec!(10))).await.unwrap();
        assert_eq!(ack.status, "FILLED");
        assert_eq!(ack.average_price, Some(dec!(190)));

        let positions = broker.open_positions("u1").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, dec!(10));
    }

    #[tokio::test]
    async fn test_resting_limit_shows_as_open_until_cancelled() {
        let broker = PaperBroker::new();
        broker.set_mark_price("AAPL", dec!(190));
        broker.fund("u1", dec!(10000));

        let ack = broker
            .place_order(
                "u1",
                BrokerOrderRequest {
                    client_order_id: "c-1".to_string(),
                    symbol: "AAPL".to_string(),
                    side: Side::Buy,
                    order_type: OrderType::Limit,
                    quantity: dec!(5),
                    limit_price: Some(dec!(180)),
                },
            )
            .await
            .unwrap();
        assert_eq!(ack.status, "ACKED");
        assert_eq!(broker.open_orders("u1").await.unwrap().len(), 1);

        broker.cancel_order("u1", &ack.broker_order_id).await.unwrap();
        assert!(broker.open_orders("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_order_rejected() {
        let broker = PaperBroker::new();
        broker.fund("u1", dec!(1000));
        let err = broker.cancel_order("u1", "nope").await.unwrap_err();
        assert!(matches!(err, BrokerError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_opposite_fills_flatten_position() {
        let broker = PaperBroker::new();
        broker.set_mark_price("AAPL", dec!(100));
        broker.fund("u1", dec!(10000));

        broker.place_order("u1", market_buy(dec!(10))).await.unwrap();
        broker
            .place_order(
                "u1",
                BrokerOrderRequest {
                    client_order_id: "c-2".to_string(),
                    symbol: "AAPL".to_string(),
                    side: Side::Sell,
                    order_type: OrderType::Market,
                    quantity: dec!(10),
                    limit_price: None,
                },
            )
            .await
            .unwrap();

        assert!(broker.open_positions("u1").await.unwrap().is_empty());
    }
}
