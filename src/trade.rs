//! Trade lifecycle: `Active -> Completed | Cancelled`.
//!
//! Completion is seller only, since the seller controls delivery. Either side
//! may cancel. While a trade is active its listing carries an
//! `active_trade/<listing>` index row which hides it from offerable results;
//! both terminal transitions remove that row.
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use crate::error::{Result, SettlementError};
use crate::model::{
    Listing, ListingStatus, Offer, OfferTarget, Settlement, SettlementRef, SettlementStatus, Trade,
    Transaction,
};
use crate::offer::decline_open_offers;
use crate::outbox::{Effect, Notification, NotificationKind};
use crate::settlement::open_chat;
use crate::store::{Store, Tx, TxResult, active_trade_key};
use crate::time::{Clock, TimeStamp};
use crate::utils;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeCompletion {
    pub trade: Trade,
    pub transaction: Transaction,
}

pub(crate) fn ensure_active<S: Settlement>(settlement: &S, id: &str) -> TxResult<()> {
    if settlement.status() != SettlementStatus::Active {
        return Err(SettlementError::InvalidState(format!(
            "{id} is {:?}, expected Active",
            settlement.status()
        ))
        .into());
    }
    Ok(())
}

pub struct TradeLifecycle {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
}

impl TradeLifecycle {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create an active trade and its chat for an accepted item offer. The
    /// caller has already checked the listing is free.
    pub(crate) fn open(
        tx: &Tx<'_>,
        offer: &Offer,
        listing: &Listing,
        now: &TimeStamp<Utc>,
    ) -> TxResult<Trade> {
        let trade_id = utils::new_uuid_to_bech32(utils::TRADE)?;
        let chat = open_chat(
            tx,
            SettlementRef::Trade(trade_id.clone()),
            [listing.owner_id.as_str(), offer.requester_id.as_str()],
            now,
        )?;

        let trade = Trade {
            id: trade_id,
            offer_id: offer.id.clone(),
            listing_id: listing.id.clone(),
            seller_id: listing.owner_id.clone(),
            buyer_id: offer.requester_id.clone(),
            status: SettlementStatus::Active,
            chat_id: chat.id,
            transaction_id: None,
            cancel_reason: None,
            cancelled_by: None,
            created_at: now.clone(),
            completed_at: None,
            cancelled_at: None,
        };
        tx.put(&trade)?;
        tx.index_put(&active_trade_key(&listing.id), &trade.id)?;
        Ok(trade)
    }

    // only clear the index if it still belongs to this trade
    fn release_listing(tx: &Tx<'_>, trade: &Trade) -> TxResult<()> {
        let key = active_trade_key(&trade.listing_id);
        if tx.index_get(&key)?.as_deref() == Some(trade.id.as_str()) {
            tx.index_remove(&key)?;
        }
        Ok(())
    }

    /// Mark the trade delivered, record its transaction and retire the listing.
    /// Offers still pending on the listing are then declined as unavailable.
    pub fn complete(&self, trade_id: &str, caller_id: &str) -> Result<TradeCompletion> {
        let now = self.clock.now();

        let completion = self.store.with_transaction("trade.complete", |tx| {
            let mut trade: Trade = tx.load(trade_id)?;
            if trade.seller_id != caller_id {
                return Err(SettlementError::Forbidden(format!(
                    "only the seller may complete trade {trade_id}"
                ))
                .into());
            }
            ensure_active(&trade, trade_id)?;

            let mut listing: Listing = tx.load(&trade.listing_id)?;
            let offer: Offer = tx.load(&trade.offer_id)?;

            let transaction = Transaction::seal(
                utils::new_uuid_to_bech32(utils::TRANSACTION)?,
                SettlementRef::Trade(trade.id.clone()),
                &trade.seller_id,
                &trade.buyer_id,
                &listing.item_name,
                &offer.offered_items,
                listing.price,
                now.clone(),
            )?;
            tx.put(&transaction)?;

            trade.status = SettlementStatus::Completed;
            trade.completed_at = Some(now.clone());
            trade.transaction_id = Some(transaction.id.clone());
            tx.put(&trade)?;

            // completed listings leave the market for good
            listing.status = ListingStatus::Completed;
            tx.put(&listing)?;
            Self::release_listing(tx, &trade)?;

            tx.emit(
                Effect::notify(&trade.buyer_id, NotificationKind::TradeCompleted, &trade.id),
                &now,
            )?;
            tx.emit(Effect::touch(&trade.seller_id, &now), &now)?;

            Ok(TradeCompletion { trade, transaction })
        })?;

        info!(
            trade_id,
            transaction_id = %completion.transaction.id,
            "trade completed"
        );
        decline_open_offers(
            &self.store,
            &OfferTarget::Listing(completion.trade.listing_id.clone()),
            "listing sold",
            &now,
        );
        Ok(completion)
    }

    /// Call the trade off. The listing becomes offerable again; no transaction
    /// is recorded so neither side can rate.
    pub fn cancel(&self, trade_id: &str, caller_id: &str, reason: Option<String>) -> Result<Trade> {
        let now = self.clock.now();

        let trade = self.store.with_transaction("trade.cancel", |tx| {
            let mut trade: Trade = tx.load(trade_id)?;
            let Some(other) = trade.other_party(caller_id).map(str::to_string) else {
                return Err(SettlementError::Forbidden(format!(
                    "{caller_id} is not a party to trade {trade_id}"
                ))
                .into());
            };
            ensure_active(&trade, trade_id)?;

            trade.status = SettlementStatus::Cancelled;
            trade.cancelled_at = Some(now.clone());
            trade.cancelled_by = Some(caller_id.to_string());
            trade.cancel_reason = reason.clone();
            tx.put(&trade)?;
            Self::release_listing(tx, &trade)?;

            tx.emit(
                Effect::Notify(
                    Notification::new(&other, NotificationKind::TradeCancelled, &trade.id)
                        .with_detail(reason.clone()),
                ),
                &now,
            )?;
            tx.emit(Effect::touch(caller_id, &now), &now)?;
            Ok(trade)
        })?;

        info!(trade_id, cancelled_by = caller_id, "trade cancelled");
        Ok(trade)
    }

    pub fn get(&self, trade_id: &str) -> Result<Trade> {
        self.store.load(trade_id)
    }

    /// The active trade of a listing, if any.
    pub fn active_for_listing(&self, listing_id: &str) -> Result<Option<Trade>> {
        Ok(self
            .store
            .scan::<Trade>()?
            .into_iter()
            .find(|trade| trade.listing_id == listing_id && trade.status == SettlementStatus::Active))
    }
}
