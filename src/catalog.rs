//! Listings and services: the things offers are made against.
use std::sync::Arc;
use tracing::info;

use crate::error::{Result, SettlementError};
use crate::model::{Listing, ListingStatus, OfferTarget, Service, ServiceStatus};
use crate::offer::decline_open_offers;
use crate::store::{Store, Tx, TxResult, active_trade_key, service_type_key};
use crate::time::Clock;
use crate::utils;

pub struct Catalog {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
}

impl Catalog {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn create_listing(
        &self,
        owner_id: &str,
        item_name: &str,
        price: u64,
        terms: &str,
    ) -> Result<Listing> {
        if item_name.trim().is_empty() {
            return Err(SettlementError::Validation("listing needs an item name".into()));
        }
        let listing = Listing {
            id: utils::new_uuid_to_bech32(utils::LISTING)?,
            owner_id: owner_id.to_string(),
            item_name: item_name.trim().to_string(),
            price,
            terms: terms.to_string(),
            status: ListingStatus::Active,
            created_at: self.clock.now(),
        };
        self.store
            .with_transaction("listing.create", |tx| tx.put(&listing))?;

        info!(listing_id = %listing.id, owner_id, "listing created");
        Ok(listing)
    }

    /// Withdraw a listing. Not possible while a trade on it is active. Offers
    /// still pending on it are declined.
    pub fn cancel_listing(&self, listing_id: &str, owner_id: &str) -> Result<Listing> {
        let listing = self.store.with_transaction("listing.cancel", |tx| {
            let mut listing: Listing = tx.load(listing_id)?;
            if listing.owner_id != owner_id {
                return Err(SettlementError::Forbidden(format!(
                    "{owner_id} does not own listing {listing_id}"
                ))
                .into());
            }
            if let Some(trade_id) = tx.index_get(&active_trade_key(listing_id))? {
                return Err(SettlementError::InvalidState(format!(
                    "listing {listing_id} has active trade {trade_id}"
                ))
                .into());
            }
            if !matches!(listing.status, ListingStatus::Active | ListingStatus::Pending) {
                return Err(SettlementError::InvalidState(format!(
                    "listing {listing_id} is {:?}",
                    listing.status
                ))
                .into());
            }
            listing.status = ListingStatus::Cancelled;
            tx.put(&listing)?;
            Ok(listing)
        })?;

        info!(listing_id, "listing cancelled");
        decline_open_offers(
            &self.store,
            &OfferTarget::Listing(listing.id.clone()),
            "listing withdrawn",
            &self.clock.now(),
        );
        Ok(listing)
    }

    /// Register a service. A provider offers each service type at most once.
    pub fn create_service(
        &self,
        provider_id: &str,
        service_type: &str,
        description: &str,
        price: u64,
    ) -> Result<Service> {
        if service_type.trim().is_empty() {
            return Err(SettlementError::Validation("service needs a type".into()));
        }
        let now = self.clock.now();

        let service = self.store.with_transaction("service.create", |tx| {
            let index = service_type_key(provider_id, service_type);
            if tx.index_get(&index)?.is_some() {
                return Err(SettlementError::AlreadyExists(format!(
                    "{provider_id} already offers {service_type}"
                ))
                .into());
            }
            let service = Service {
                id: utils::new_uuid_to_bech32(utils::SERVICE)?,
                provider_id: provider_id.to_string(),
                service_type: service_type.trim().to_string(),
                description: description.to_string(),
                price,
                status: ServiceStatus::Active,
                created_at: now.clone(),
            };
            tx.put(&service)?;
            tx.index_put(&index, &service.id)?;
            Ok(service)
        })?;

        info!(service_id = %service.id, provider_id, "service created");
        Ok(service)
    }

    fn transition_service(
        &self,
        op: &'static str,
        service_id: &str,
        provider_id: &str,
        apply: impl Fn(&Tx<'_>, &mut Service) -> TxResult<()>,
    ) -> Result<Service> {
        let service = self.store.with_transaction(op, |tx| {
            let mut service: Service = tx.load(service_id)?;
            if service.provider_id != provider_id {
                return Err(SettlementError::Forbidden(format!(
                    "{provider_id} does not provide service {service_id}"
                ))
                .into());
            }
            apply(tx, &mut service)?;
            tx.put(&service)?;
            Ok(service)
        })?;

        info!(op, service_id, status = ?service.status, "service updated");
        Ok(service)
    }

    /// Hide a service from results. Runs already active are unaffected.
    pub fn pause_service(&self, service_id: &str, provider_id: &str) -> Result<Service> {
        self.transition_service("service.pause", service_id, provider_id, |_, service| {
            if service.status != ServiceStatus::Active {
                return Err(invalid_service(service).into());
            }
            service.status = ServiceStatus::Paused;
            Ok(())
        })
    }

    pub fn resume_service(&self, service_id: &str, provider_id: &str) -> Result<Service> {
        self.transition_service("service.resume", service_id, provider_id, |_, service| {
            if service.status != ServiceStatus::Paused {
                return Err(invalid_service(service).into());
            }
            service.status = ServiceStatus::Active;
            Ok(())
        })
    }

    /// Retire a service for good. Frees its type for a new registration.
    pub fn cancel_service(&self, service_id: &str, provider_id: &str) -> Result<Service> {
        self.transition_service("service.cancel", service_id, provider_id, |tx, service| {
            if service.status == ServiceStatus::Cancelled {
                return Err(invalid_service(service).into());
            }
            service.status = ServiceStatus::Cancelled;
            tx.index_remove(&service_type_key(&service.provider_id, &service.service_type))
        })
    }

    pub fn get_listing(&self, listing_id: &str) -> Result<Listing> {
        self.store.load(listing_id)
    }

    pub fn get_service(&self, service_id: &str) -> Result<Service> {
        self.store.load(service_id)
    }

    /// Active and without an active trade.
    pub fn is_listing_offerable(&self, listing_id: &str) -> Result<bool> {
        let listing: Listing = self.store.load(listing_id)?;
        Ok(listing.status == ListingStatus::Active
            && !self.store.contains(&active_trade_key(listing_id))?)
    }

    pub fn offerable_listings(&self) -> Result<Vec<Listing>> {
        let mut listings = Vec::new();
        for listing in self.store.scan::<Listing>()? {
            if listing.status == ListingStatus::Active
                && !self.store.contains(&active_trade_key(&listing.id))?
            {
                listings.push(listing);
            }
        }
        listings.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(listings)
    }

    pub fn offerable_services(&self) -> Result<Vec<Service>> {
        let mut services: Vec<Service> = self
            .store
            .scan::<Service>()?
            .into_iter()
            .filter(|service| service.status == ServiceStatus::Active)
            .collect();
        services.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(services)
    }
}

fn invalid_service(service: &Service) -> SettlementError {
    SettlementError::InvalidState(format!("service {} is {:?}", service.id, service.status))
}
