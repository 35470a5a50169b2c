//! Settlement coordinator: turns a pending offer into a trade or service run.
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use crate::error::{Result, SettlementError};
use crate::model::{Chat, Listing, Offer, OfferStatus, OfferTarget, Service, SettlementRef};
use crate::offer::{ensure_listing_offerable, ensure_pending, ensure_service_offerable};
use crate::outbox::{Effect, NotificationKind};
use crate::service_run::ServiceRunLifecycle;
use crate::store::{Store, Tx, TxResult};
use crate::time::{Clock, TimeStamp};
use crate::trade::TradeLifecycle;
use crate::utils;

/// Result of a successful accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acceptance {
    pub offer: Offer,
    pub settlement: SettlementRef,
    pub chat_id: String,
}

pub(crate) fn open_chat(
    tx: &Tx<'_>,
    owner: SettlementRef,
    participants: [&str; 2],
    now: &TimeStamp<Utc>,
) -> TxResult<Chat> {
    let chat = Chat {
        id: utils::new_uuid_to_bech32(utils::CHAT)?,
        owner,
        participants: participants.iter().map(|p| p.to_string()).collect(),
        created_at: now.clone(),
    };
    tx.put(&chat)?;
    Ok(chat)
}

fn ensure_owner(owner_id: &str, caller_id: &str, offer: &Offer) -> TxResult<()> {
    if owner_id != caller_id {
        return Err(SettlementError::Forbidden(format!(
            "{caller_id} cannot accept offer {}",
            offer.id
        ))
        .into());
    }
    Ok(())
}

pub struct SettlementCoordinator {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
}

impl SettlementCoordinator {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Accept a pending offer.
    ///
    /// Everything happens in one transaction: the offer is re-read, the caller
    /// and offer state are checked, item offers re-check that their listing is
    /// still free, then the trade or service run, its chat and the updated
    /// offer are written together. If any step fails nothing is written and
    /// the offer stays pending. Concurrent accepts against one listing run one
    /// after another; the first commits and every later one sees its active
    /// trade and fails with `InvalidState`.
    pub fn accept(&self, offer_id: &str, owner_id: &str) -> Result<Acceptance> {
        let now = self.clock.now();

        let acceptance = self.store.with_transaction("offer.accept", |tx| {
            let mut offer: Offer = tx.load(offer_id)?;

            let (settlement, chat_id) = match &offer.target {
                OfferTarget::Listing(listing_id) => {
                    let listing: Listing = tx.load(listing_id)?;
                    ensure_owner(&listing.owner_id, owner_id, &offer)?;
                    ensure_pending(&offer)?;
                    ensure_listing_offerable(tx, &listing)?;

                    let trade = TradeLifecycle::open(tx, &offer, &listing, &now)?;
                    (SettlementRef::Trade(trade.id), trade.chat_id)
                }
                OfferTarget::Service(service_id) => {
                    let service: Service = tx.load(service_id)?;
                    ensure_owner(&service.provider_id, owner_id, &offer)?;
                    ensure_pending(&offer)?;
                    ensure_service_offerable(&service)?;

                    // no exclusivity check, a service runs for many clients at once
                    let run = ServiceRunLifecycle::open(tx, &offer, &service, &now)?;
                    (SettlementRef::ServiceRun(run.id), run.chat_id)
                }
            };

            offer.status = OfferStatus::Accepted;
            offer.accepted_at = Some(now.clone());
            offer.decided_at = Some(now.clone());
            offer.settlement = Some(settlement.clone());
            tx.put(&offer)?;

            tx.emit(
                Effect::notify(&offer.requester_id, NotificationKind::OfferAccepted, &offer.id),
                &now,
            )?;
            tx.emit(Effect::touch(&offer.requester_id, &now), &now)?;
            tx.emit(Effect::touch(owner_id, &now), &now)?;

            Ok(Acceptance {
                offer,
                settlement,
                chat_id,
            })
        })?;

        info!(
            offer_id,
            settlement_id = acceptance.settlement.id(),
            chat_id = %acceptance.chat_id,
            "offer accepted"
        );
        Ok(acceptance)
    }
}
