//! Rows held by the entity store.
//!
//! Every row is CBOR encoded. Field indices are part of the storage format and
//! must never be reused.
use chrono::Utc;

use crate::error::Result;
use crate::time::TimeStamp;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingStatus {
    #[n(0)]
    Active,
    #[n(1)]
    Pending,
    #[n(2)]
    Completed,
    #[n(3)]
    Cancelled,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub owner_id: String,
    #[n(2)]
    pub item_name: String,
    #[n(3)]
    pub price: u64, // minor units
    #[n(4)]
    pub terms: String,
    #[n(5)]
    pub status: ListingStatus,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    #[n(0)]
    Active,
    #[n(1)]
    Paused,
    #[n(2)]
    Cancelled,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Service {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub provider_id: String,
    #[n(2)]
    pub service_type: String,
    #[n(3)]
    pub description: String,
    #[n(4)]
    pub price: u64,
    #[n(5)]
    pub status: ServiceStatus,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferKind {
    Item,
    Service,
}

/// What an offer is made against. Exactly one of the two, never both.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum OfferTarget {
    #[n(0)]
    Listing(#[n(0)] String),
    #[n(1)]
    Service(#[n(0)] String),
}

impl OfferTarget {
    pub fn kind(&self) -> OfferKind {
        match self {
            OfferTarget::Listing(_) => OfferKind::Item,
            OfferTarget::Service(_) => OfferKind::Service,
        }
    }
    pub fn id(&self) -> &str {
        match self {
            OfferTarget::Listing(id) | OfferTarget::Service(id) => id,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct OfferedItem {
    #[n(0)]
    pub name: String,
    #[n(1)]
    pub quantity: u32,
}

impl OfferedItem {
    pub fn new(name: impl Into<String>, quantity: u32) -> Self {
        Self {
            name: name.into(),
            quantity,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Accepted,
    #[n(2)]
    Rejected,
    #[n(3)]
    Cancelled,
}

impl OfferStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OfferStatus::Pending)
    }
}

/// Fixed table of reasons an owner may give when declining an offer.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    #[n(1)]
    PriceTooLow,
    #[n(2)]
    ItemUnavailable,
    #[n(3)]
    WantsDifferentItems,
    #[n(4)]
    NotInterested,
    #[n(99)]
    Other,
}

impl DeclineReason {
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            1 => Some(DeclineReason::PriceTooLow),
            2 => Some(DeclineReason::ItemUnavailable),
            3 => Some(DeclineReason::WantsDifferentItems),
            4 => Some(DeclineReason::NotInterested),
            99 => Some(DeclineReason::Other),
            _ => None,
        }
    }
    pub fn id(&self) -> u16 {
        match self {
            DeclineReason::PriceTooLow => 1,
            DeclineReason::ItemUnavailable => 2,
            DeclineReason::WantsDifferentItems => 3,
            DeclineReason::NotInterested => 4,
            DeclineReason::Other => 99,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Decline {
    #[n(0)]
    pub reason: DeclineReason,
    #[n(1)]
    pub note: Option<String>,
}

/// Link from an accepted offer (or a chat, or a transaction) to the binding
/// engagement it belongs to.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum SettlementRef {
    #[n(0)]
    Trade(#[n(0)] String),
    #[n(1)]
    ServiceRun(#[n(0)] String),
}

impl SettlementRef {
    pub fn id(&self) -> &str {
        match self {
            SettlementRef::Trade(id) | SettlementRef::ServiceRun(id) => id,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub requester_id: String,
    #[n(2)]
    pub target: OfferTarget,
    #[n(3)]
    pub offered_items: Vec<OfferedItem>,
    #[n(4)]
    pub message: String,
    #[n(5)]
    pub status: OfferStatus,
    #[n(6)]
    pub decline: Option<Decline>,
    #[n(7)]
    pub settlement: Option<SettlementRef>,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
    #[n(9)]
    pub accepted_at: Option<TimeStamp<Utc>>,
    #[n(10)]
    pub decided_at: Option<TimeStamp<Utc>>, // set on every terminal transition
}

impl Offer {
    pub fn kind(&self) -> OfferKind {
        self.target.kind()
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementStatus {
    #[n(0)]
    Active,
    #[n(1)]
    Completed,
    #[n(2)]
    Cancelled,
}

/// Shared view over the two settlement kinds.
pub trait Settlement {
    fn status(&self) -> SettlementStatus;
    /// (owning side, requesting side)
    fn parties(&self) -> (&str, &str);

    fn is_participant(&self, user_id: &str) -> bool {
        let (owner, requester) = self.parties();
        owner == user_id || requester == user_id
    }

    fn other_party(&self, user_id: &str) -> Option<&str> {
        let (owner, requester) = self.parties();
        if owner == user_id {
            Some(requester)
        } else if requester == user_id {
            Some(owner)
        } else {
            None
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Trade {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub offer_id: String,
    #[n(2)]
    pub listing_id: String,
    #[n(3)]
    pub seller_id: String,
    #[n(4)]
    pub buyer_id: String,
    #[n(5)]
    pub status: SettlementStatus,
    #[n(6)]
    pub chat_id: String,
    #[n(7)]
    pub transaction_id: Option<String>,
    #[n(8)]
    pub cancel_reason: Option<String>,
    #[n(9)]
    pub cancelled_by: Option<String>,
    #[n(10)]
    pub created_at: TimeStamp<Utc>,
    #[n(11)]
    pub completed_at: Option<TimeStamp<Utc>>,
    #[n(12)]
    pub cancelled_at: Option<TimeStamp<Utc>>,
}

impl Settlement for Trade {
    fn status(&self) -> SettlementStatus {
        self.status
    }
    fn parties(&self) -> (&str, &str) {
        (&self.seller_id, &self.buyer_id)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ServiceRun {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub offer_id: String,
    #[n(2)]
    pub service_id: String,
    #[n(3)]
    pub provider_id: String,
    #[n(4)]
    pub client_id: String,
    #[n(5)]
    pub status: SettlementStatus,
    #[n(6)]
    pub chat_id: String,
    #[n(7)]
    pub transaction_id: Option<String>,
    #[n(8)]
    pub cancel_reason: Option<String>,
    #[n(9)]
    pub cancelled_by: Option<String>,
    #[n(10)]
    pub created_at: TimeStamp<Utc>,
    #[n(11)]
    pub completed_at: Option<TimeStamp<Utc>>,
    #[n(12)]
    pub cancelled_at: Option<TimeStamp<Utc>>,
}

impl Settlement for ServiceRun {
    fn status(&self) -> SettlementStatus {
        self.status
    }
    fn parties(&self) -> (&str, &str) {
        (&self.provider_id, &self.client_id)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Chat {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub owner: SettlementRef,
    #[n(2)]
    pub participants: Vec<String>,
    #[n(3)]
    pub created_at: TimeStamp<Utc>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub chat_id: String,
    #[n(2)]
    pub sender_id: String,
    #[n(3)]
    pub body: String,
    #[n(4)]
    pub sent_at: TimeStamp<Utc>,
}

/// Immutable record of a completed settlement. Carries its own copy of the
/// item name and offered items so it stays meaningful after the settlement is
/// archived.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub settlement: SettlementRef,
    #[n(2)]
    pub owner_id: String, // seller or provider
    #[n(3)]
    pub counterparty_id: String, // buyer or client
    #[n(4)]
    pub item_name: String,
    #[n(5)]
    pub offered_items: Vec<OfferedItem>,
    #[n(6)]
    pub price: u64,
    #[n(7)]
    pub completed_at: TimeStamp<Utc>,
    #[n(8)]
    pub digest: String, // sha256 of the record encoded with an empty digest
}

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    pub fn seal(
        id: String,
        settlement: SettlementRef,
        owner_id: &str,
        counterparty_id: &str,
        item_name: &str,
        offered_items: &[OfferedItem],
        price: u64,
        completed_at: TimeStamp<Utc>,
    ) -> Result<Self> {
        let mut txn = Self {
            id,
            settlement,
            owner_id: owner_id.to_string(),
            counterparty_id: counterparty_id.to_string(),
            item_name: item_name.to_string(),
            offered_items: offered_items.to_vec(),
            price,
            completed_at,
            digest: String::new(),
        };
        txn.digest = txn.compute_digest()?;
        Ok(txn)
    }

    fn compute_digest(&self) -> Result<String> {
        let body = Self {
            digest: String::new(),
            ..self.clone()
        };
        let contents = minicbor::to_vec(&body)?;
        Ok(sha256::digest(&contents))
    }

    pub fn verify_digest(&self) -> Result<bool> {
        Ok(self.compute_digest()? == self.digest)
    }

    pub fn is_party(&self, user_id: &str) -> bool {
        self.owner_id == user_id || self.counterparty_id == user_id
    }

    pub fn counterpart_of(&self, user_id: &str) -> Option<&str> {
        if self.owner_id == user_id {
            Some(&self.counterparty_id)
        } else if self.counterparty_id == user_id {
            Some(&self.owner_id)
        } else {
            None
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Rating {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub transaction_id: String,
    #[n(2)]
    pub rater_id: String,
    #[n(3)]
    pub rated_id: String,
    #[n(4)]
    pub stars: u8,
    #[n(5)]
    pub comment: Option<String>,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
}

/// Running aggregate of the ratings a user has received.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct RatingSummary {
    #[n(0)]
    pub user_id: String,
    #[n(1)]
    pub count: u64,
    #[n(2)]
    pub total_stars: u64,
}

impl RatingSummary {
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            count: 0,
            total_stars: 0,
        }
    }

    pub fn record(&mut self, stars: u8) {
        self.count += 1;
        self.total_stars += u64::from(stars);
    }

    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.total_stars as f64 / self.count as f64)
    }
}
