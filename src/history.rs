//! Read side over settled business: transactions, price history, activity.
use chrono::Utc;
use std::sync::Arc;

use crate::error::Result;
use crate::model::{ServiceRun, Trade, Transaction};
use crate::store::Store;
use crate::time::TimeStamp;

pub struct History {
    store: Arc<Store>,
}

impl History {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn get_trade(&self, trade_id: &str) -> Result<Trade> {
        self.store.load(trade_id)
    }

    pub fn get_service_run(&self, run_id: &str) -> Result<ServiceRun> {
        self.store.load(run_id)
    }

    pub fn get_transaction(&self, transaction_id: &str) -> Result<Transaction> {
        self.store.load(transaction_id)
    }

    fn transactions_where(&self, keep: impl Fn(&Transaction) -> bool) -> Result<Vec<Transaction>> {
        let mut transactions: Vec<Transaction> = self
            .store
            .scan::<Transaction>()?
            .into_iter()
            .filter(|txn| keep(txn))
            .collect();
        transactions.sort_by(|a, b| a.completed_at.cmp(&b.completed_at));
        Ok(transactions)
    }

    /// Every transaction `user_id` took part in, oldest first.
    pub fn transactions_for_user(&self, user_id: &str) -> Result<Vec<Transaction>> {
        self.transactions_where(|txn| txn.is_party(user_id))
    }

    /// Settled prices for an item or service name, oldest first. Matching
    /// ignores case and surrounding whitespace.
    pub fn price_history(&self, item_name: &str) -> Result<Vec<(TimeStamp<Utc>, u64)>> {
        let wanted = item_name.trim().to_lowercase();
        Ok(self
            .transactions_where(|txn| txn.item_name.trim().to_lowercase() == wanted)?
            .into_iter()
            .map(|txn| (txn.completed_at, txn.price))
            .collect())
    }

    /// Last time `user_id` settled something, as recorded by the outbox
    /// dispatcher. Lags the settlement itself.
    pub fn activity(&self, user_id: &str) -> Result<Option<TimeStamp<Utc>>> {
        self.store.last_activity(user_id)
    }
}
