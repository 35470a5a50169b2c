//! Entry point wiring every component onto one store.
use std::sync::Arc;
use tracing::info;

use crate::catalog::Catalog;
use crate::chat::ChatService;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::history::History;
use crate::offer::OfferEngine;
use crate::outbox::{Notifier, OutboxDispatcher};
use crate::rating::RatingGate;
use crate::service_run::ServiceRunLifecycle;
use crate::settlement::SettlementCoordinator;
use crate::store::Store;
use crate::time::{Clock, SystemClock};
use crate::trade::TradeLifecycle;

/// The negotiation-to-settlement engine.
///
/// Holds no state of its own besides the shared store handle and clock, so
/// one instance can serve any number of threads.
pub struct Engine {
    store: Arc<Store>,
    config: EngineConfig,
    pub catalog: Catalog,
    pub offers: OfferEngine,
    pub settlement: SettlementCoordinator,
    pub trades: TradeLifecycle,
    pub service_runs: ServiceRunLifecycle,
    pub chats: ChatService,
    pub ratings: RatingGate,
    pub history: History,
}

impl Engine {
    pub fn new(db: sled::Db, config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = Arc::new(Store::new(db, config.settlement.clone())?);

        Ok(Self {
            catalog: Catalog::new(store.clone(), clock.clone()),
            offers: OfferEngine::new(store.clone(), clock.clone(), config.offers.clone()),
            settlement: SettlementCoordinator::new(store.clone(), clock.clone()),
            trades: TradeLifecycle::new(store.clone(), clock.clone()),
            service_runs: ServiceRunLifecycle::new(store.clone(), clock.clone()),
            chats: ChatService::new(store.clone(), clock.clone()),
            ratings: RatingGate::new(store.clone(), clock),
            history: History::new(store.clone()),
            store,
            config,
        })
    }

    /// Open the database at `config.store.path` with the system clock.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let db = sled::open(&config.store.path)?;
        info!(path = %config.store.path.display(), "store opened");
        Self::new(db, config, Arc::new(SystemClock))
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Dispatcher delivering this engine's post-commit effects to `notifier`.
    pub fn dispatcher(&self, notifier: Arc<dyn Notifier>) -> OutboxDispatcher {
        OutboxDispatcher::new(self.store.clone(), notifier, self.config.outbox.clone())
    }
}
