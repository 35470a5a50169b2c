#![allow(dead_code)]

use anyhow::anyhow;
use std::sync::{Arc, Mutex};
use tempfile::{TempDir, tempdir};
use trade_settlement::{
    Engine,
    config::EngineConfig,
    model::{Listing, OfferTarget, OfferedItem, Service},
    outbox::{Notification, NotificationKind, Notifier},
    time::{ManualClock, TimeStamp},
};

pub struct Harness {
    // keeps the database directory alive for the test's duration
    pub _dir: TempDir,
    pub engine: Engine,
    pub clock: Arc<ManualClock>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn harness() -> anyhow::Result<Harness> {
    harness_with(EngineConfig::default())
}

pub fn harness_with(config: EngineConfig) -> anyhow::Result<Harness> {
    init_tracing();
    // Sled holds a file lock on its directory, so every test gets its own
    // database under a temp dir that is cleaned up on drop.
    let dir = tempdir()?;
    let db = sled::open(dir.path().join("settlement.db"))?;
    let start = TimeStamp::new_with(2025, 6, 1, 12, 0, 0).expect("valid start time");
    let clock = Arc::new(ManualClock::new(start));
    let engine = Engine::new(db, config, clock.clone())?;
    Ok(Harness {
        _dir: dir,
        engine,
        clock,
    })
}

impl Harness {
    pub fn listing(&self, owner: &str) -> anyhow::Result<Listing> {
        Ok(self
            .engine
            .catalog
            .create_listing(owner, "Obsidian Greatsword", 45_000, "meet at the bank")?)
    }

    pub fn service(&self, provider: &str) -> anyhow::Result<Service> {
        Ok(self.engine.catalog.create_service(
            provider,
            "Raid carry",
            "full clear, loot to client",
            20_000,
        )?)
    }

    pub fn item_offer(&self, buyer: &str, listing: &Listing) -> anyhow::Result<String> {
        let offer = self.engine.offers.create(
            buyer,
            OfferTarget::Listing(listing.id.clone()),
            vec![OfferedItem::new("Gold Bar", 10)],
            "ten bars for the sword",
        )?;
        Ok(offer.id)
    }

    pub fn service_offer(&self, client: &str, service: &Service) -> anyhow::Result<String> {
        let offer = self.engine.offers.create(
            client,
            OfferTarget::Service(service.id.clone()),
            vec![],
            "this weekend?",
        )?;
        Ok(offer.id)
    }
}

/// Notifier that keeps everything it is handed.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn kinds_for(&self, user_id: &str) -> Vec<NotificationKind> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.user_id == user_id)
            .map(|n| n.kind)
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn enqueue(&self, notification: &Notification) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Notifier whose transport is down.
#[derive(Default)]
pub struct FailingNotifier;

impl Notifier for FailingNotifier {
    fn enqueue(&self, _: &Notification) -> anyhow::Result<()> {
        Err(anyhow!("transport unavailable"))
    }
}
