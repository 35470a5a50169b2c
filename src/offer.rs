//! Offer engine: creation, rejection and withdrawal of offers.
//!
//! Accepting an offer is the settlement coordinator's job, see
//! [`crate::settlement`].
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::OfferConfig;
use crate::error::{Result, SettlementError};
use crate::model::{
    Decline, DeclineReason, Listing, ListingStatus, Offer, OfferStatus, OfferTarget, OfferedItem,
    Service, ServiceStatus,
};
use crate::outbox::{Effect, Notification, NotificationKind};
use crate::store::{Store, Tx, TxResult, active_trade_key};
use crate::time::{Clock, TimeStamp};
use crate::utils;

/// Owner of the listing or service an offer targets.
pub(crate) fn target_owner(tx: &Tx<'_>, target: &OfferTarget) -> TxResult<String> {
    match target {
        OfferTarget::Listing(id) => Ok(tx.load::<Listing>(id)?.owner_id),
        OfferTarget::Service(id) => Ok(tx.load::<Service>(id)?.provider_id),
    }
}

pub(crate) fn ensure_pending(offer: &Offer) -> TxResult<()> {
    if offer.status != OfferStatus::Pending {
        return Err(SettlementError::InvalidState(format!(
            "offer {} is {:?}, expected Pending",
            offer.id, offer.status
        ))
        .into());
    }
    Ok(())
}

/// A listing takes offers while it is active and has no active trade.
pub(crate) fn ensure_listing_offerable(tx: &Tx<'_>, listing: &Listing) -> TxResult<()> {
    if listing.status != ListingStatus::Active {
        return Err(SettlementError::InvalidState(format!(
            "listing {} is {:?}",
            listing.id, listing.status
        ))
        .into());
    }
    if let Some(trade_id) = tx.index_get(&active_trade_key(&listing.id))? {
        return Err(SettlementError::InvalidState(format!(
            "listing {} already has active trade {trade_id}",
            listing.id
        ))
        .into());
    }
    Ok(())
}

/// A service takes offers, and bookings, only while it is active.
pub(crate) fn ensure_service_offerable(service: &Service) -> TxResult<()> {
    if service.status != ServiceStatus::Active {
        return Err(SettlementError::InvalidState(format!(
            "service {} is {:?}",
            service.id, service.status
        ))
        .into());
    }
    Ok(())
}

/// Reject every offer still pending against a target that has left the
/// market. Runs after the closing transaction committed, when no new offer
/// can be made against the target, so nothing is missed. Each offer is
/// declined in its own transaction and failures are logged, not returned.
pub(crate) fn decline_open_offers(
    store: &Store,
    target: &OfferTarget,
    note: &str,
    now: &TimeStamp<Utc>,
) -> usize {
    let open = match store.scan::<Offer>() {
        Ok(offers) => offers
            .into_iter()
            .filter(|offer| &offer.target == target && offer.status == OfferStatus::Pending)
            .map(|offer| offer.id)
            .collect::<Vec<_>>(),
        Err(err) => {
            warn!(target_id = target.id(), error = %err, "could not list open offers");
            return 0;
        }
    };

    let mut declined = 0;
    for offer_id in open {
        let outcome = store.with_transaction("offer.expire", |tx| {
            let mut offer: Offer = tx.load(&offer_id)?;
            if offer.status != OfferStatus::Pending {
                return Ok(false);
            }
            offer.status = OfferStatus::Rejected;
            offer.decline = Some(Decline {
                reason: DeclineReason::ItemUnavailable,
                note: Some(note.to_string()),
            });
            offer.decided_at = Some(now.clone());
            tx.put(&offer)?;
            tx.emit(
                Effect::Notify(
                    Notification::new(&offer.requester_id, NotificationKind::OfferRejected, &offer.id)
                        .with_detail(Some(note.to_string())),
                ),
                now,
            )?;
            Ok(true)
        });
        match outcome {
            Ok(true) => declined += 1,
            Ok(false) => {}
            Err(err) => warn!(offer_id = %offer_id, error = %err, "open offer left pending"),
        }
    }

    if declined > 0 {
        info!(target_id = target.id(), declined, "open offers declined");
    }
    declined
}

pub struct OfferEngine {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    config: OfferConfig,
}

impl OfferEngine {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, config: OfferConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    fn validate(&self, offered_items: &[OfferedItem], message: &str) -> Result<()> {
        if message.chars().count() > self.config.max_message_len {
            return Err(SettlementError::Validation(format!(
                "message longer than {} characters",
                self.config.max_message_len
            )));
        }
        if let Some(item) = offered_items
            .iter()
            .find(|item| item.quantity == 0 || item.name.trim().is_empty())
        {
            return Err(SettlementError::Validation(format!(
                "offered item {:?} needs a name and a non-zero quantity",
                item.name
            )));
        }
        Ok(())
    }

    /// Propose a deal against a listing or a service.
    pub fn create(
        &self,
        requester_id: &str,
        target: OfferTarget,
        offered_items: Vec<OfferedItem>,
        message: &str,
    ) -> Result<Offer> {
        self.validate(&offered_items, message)?;
        let now = self.clock.now();

        let offer = self.store.with_transaction("offer.create", |tx| {
            let owner_id = match &target {
                OfferTarget::Listing(id) => {
                    let listing: Listing = tx.load(id)?;
                    if listing.owner_id == requester_id {
                        return Err(SettlementError::SelfAction(format!(
                            "{requester_id} owns listing {id}"
                        ))
                        .into());
                    }
                    ensure_listing_offerable(tx, &listing)?;
                    listing.owner_id
                }
                OfferTarget::Service(id) => {
                    let service: Service = tx.load(id)?;
                    if service.provider_id == requester_id {
                        return Err(SettlementError::SelfAction(format!(
                            "{requester_id} provides service {id}"
                        ))
                        .into());
                    }
                    ensure_service_offerable(&service)?;
                    service.provider_id
                }
            };

            let offer = Offer {
                id: utils::new_uuid_to_bech32(utils::OFFER)?,
                requester_id: requester_id.to_string(),
                target: target.clone(),
                offered_items: offered_items.clone(),
                message: message.to_string(),
                status: OfferStatus::Pending,
                decline: None,
                settlement: None,
                created_at: now.clone(),
                accepted_at: None,
                decided_at: None,
            };
            tx.put(&offer)?;
            tx.emit(
                Effect::notify(&owner_id, NotificationKind::OfferReceived, &offer.id),
                &now,
            )?;
            Ok(offer)
        })?;

        info!(
            offer_id = %offer.id,
            target_id = offer.target.id(),
            requester_id,
            "offer created"
        );
        Ok(offer)
    }

    /// Decline a pending offer. Only the target's owner may do this.
    pub fn reject(
        &self,
        offer_id: &str,
        owner_id: &str,
        reason_id: u16,
        note: Option<String>,
    ) -> Result<Offer> {
        let reason = DeclineReason::from_id(reason_id)
            .ok_or_else(|| SettlementError::Validation(format!("unknown decline reason {reason_id}")))?;
        let now = self.clock.now();

        let offer = self.store.with_transaction("offer.reject", |tx| {
            let mut offer: Offer = tx.load(offer_id)?;
            if target_owner(tx, &offer.target)? != owner_id {
                return Err(SettlementError::Forbidden(format!(
                    "{owner_id} does not own the target of offer {offer_id}"
                ))
                .into());
            }
            ensure_pending(&offer)?;

            offer.status = OfferStatus::Rejected;
            offer.decided_at = Some(now.clone());
            offer.decline = Some(Decline {
                reason,
                note: note.clone(),
            });
            tx.put(&offer)?;
            tx.emit(
                Effect::Notify(
                    Notification::new(&offer.requester_id, NotificationKind::OfferRejected, &offer.id)
                        .with_detail(note.clone()),
                ),
                &now,
            )?;
            Ok(offer)
        })?;

        info!(offer_id, reason = ?reason, "offer rejected");
        Ok(offer)
    }

    /// Withdraw a pending offer. Only the requester may do this.
    pub fn cancel(&self, offer_id: &str, requester_id: &str) -> Result<Offer> {
        let now = self.clock.now();

        let offer = self.store.with_transaction("offer.cancel", |tx| {
            let mut offer: Offer = tx.load(offer_id)?;
            if offer.requester_id != requester_id {
                return Err(SettlementError::Forbidden(format!(
                    "{requester_id} did not make offer {offer_id}"
                ))
                .into());
            }
            ensure_pending(&offer)?;

            let owner_id = target_owner(tx, &offer.target)?;
            offer.status = OfferStatus::Cancelled;
            offer.decided_at = Some(now.clone());
            tx.put(&offer)?;
            tx.emit(
                Effect::notify(&owner_id, NotificationKind::OfferCancelled, &offer.id),
                &now,
            )?;
            Ok(offer)
        })?;

        info!(offer_id, "offer cancelled");
        Ok(offer)
    }

    pub fn get(&self, offer_id: &str) -> Result<Offer> {
        self.store.load(offer_id)
    }

    pub fn offers_for_target(&self, target: &OfferTarget) -> Result<Vec<Offer>> {
        let mut offers: Vec<Offer> = self
            .store
            .scan::<Offer>()?
            .into_iter()
            .filter(|offer| &offer.target == target)
            .collect();
        offers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(offers)
    }

    pub fn offers_by_requester(&self, requester_id: &str) -> Result<Vec<Offer>> {
        let mut offers: Vec<Offer> = self
            .store
            .scan::<Offer>()?
            .into_iter()
            .filter(|offer| offer.requester_id == requester_id)
            .collect();
        offers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(offers)
    }
}
