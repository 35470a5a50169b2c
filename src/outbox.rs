//! Post-commit effects.
//!
//! Settlement transactions never talk to the notifier directly. They append an
//! [`OutboxEntry`] inside the same transaction, and the [`OutboxDispatcher`]
//! delivers committed entries afterwards. Delivery is at-least-once and best
//! effort: a failed delivery stays queued and is retried on later polls until
//! `max_attempts`, then it is moved to the dead letter keyspace. Nothing here
//! can roll back a settlement.
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid7::uuid7;

use crate::config::OutboxConfig;
use crate::error::Result;
use crate::store::Store;
use crate::time::TimeStamp;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    #[n(0)]
    OfferReceived,
    #[n(1)]
    OfferAccepted,
    #[n(2)]
    OfferRejected,
    #[n(3)]
    OfferCancelled,
    #[n(4)]
    TradeCompleted,
    #[n(5)]
    TradeCancelled,
    #[n(6)]
    ServiceRunCompleted,
    #[n(7)]
    ServiceRunCancelled,
    #[n(8)]
    RatingReceived,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::OfferReceived => "offer_received",
            NotificationKind::OfferAccepted => "offer_accepted",
            NotificationKind::OfferRejected => "offer_rejected",
            NotificationKind::OfferCancelled => "offer_cancelled",
            NotificationKind::TradeCompleted => "trade_completed",
            NotificationKind::TradeCancelled => "trade_cancelled",
            NotificationKind::ServiceRunCompleted => "service_run_completed",
            NotificationKind::ServiceRunCancelled => "service_run_cancelled",
            NotificationKind::RatingReceived => "rating_received",
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    #[n(0)]
    pub user_id: String,
    #[n(1)]
    pub kind: NotificationKind,
    #[n(2)]
    pub subject_id: String, // the offer, trade, run or rating the notice is about
    #[n(3)]
    pub detail: Option<String>,
}

impl Notification {
    pub fn new(user_id: &str, kind: NotificationKind, subject_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            kind,
            subject_id: subject_id.to_string(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Option<String>) -> Self {
        self.detail = detail;
        self
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    #[n(0)]
    Notify(#[n(0)] Notification),
    #[n(1)]
    TouchActivity {
        #[n(0)]
        user_id: String,
        #[n(1)]
        at: TimeStamp<Utc>,
    },
}

impl Effect {
    pub fn notify(user_id: &str, kind: NotificationKind, subject_id: &str) -> Self {
        Effect::Notify(Notification::new(user_id, kind, subject_id))
    }

    pub fn touch(user_id: &str, at: &TimeStamp<Utc>) -> Self {
        Effect::TouchActivity {
            user_id: user_id.to_string(),
            at: at.clone(),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    #[n(0)]
    pub id: String, // uuid7, so keys sort in enqueue order
    #[n(1)]
    pub effect: Effect,
    #[n(2)]
    pub attempts: u32,
    #[n(3)]
    pub enqueued_at: TimeStamp<Utc>,
    #[n(4)]
    pub last_error: Option<String>,
}

impl OutboxEntry {
    pub fn new(effect: Effect, enqueued_at: TimeStamp<Utc>) -> Self {
        Self {
            id: uuid7().to_string(),
            effect,
            attempts: 0,
            enqueued_at,
            last_error: None,
        }
    }
}

/// Delivery transport for user-facing notifications.
pub trait Notifier: Send + Sync {
    fn enqueue(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Notifier that only writes the notification to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn enqueue(&self, notification: &Notification) -> anyhow::Result<()> {
        info!(
            user_id = %notification.user_id,
            kind = notification.kind.as_str(),
            subject_id = %notification.subject_id,
            "notification"
        );
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub retrying: usize,
    pub dead_lettered: usize,
}

pub struct OutboxDispatcher {
    store: Arc<Store>,
    notifier: Arc<dyn Notifier>,
    config: OutboxConfig,
}

impl OutboxDispatcher {
    pub fn new(store: Arc<Store>, notifier: Arc<dyn Notifier>, config: OutboxConfig) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    fn apply(&self, effect: &Effect) -> anyhow::Result<()> {
        match effect {
            Effect::Notify(notification) => self.notifier.enqueue(notification),
            Effect::TouchActivity { user_id, at } => {
                self.store.touch_activity(user_id, at)?;
                Ok(())
            }
        }
    }

    /// Deliver one batch of committed effects.
    pub fn drain_once(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        for (key, seen, mut entry) in self.store.outbox_batch(self.config.batch_size)? {
            match self.apply(&entry.effect) {
                Ok(()) => {
                    if self.store.outbox_ack(&key, &seen)? {
                        report.delivered += 1;
                    }
                }
                Err(err) => {
                    entry.attempts += 1;
                    entry.last_error = Some(err.to_string());

                    if entry.attempts >= self.config.max_attempts {
                        error!(
                            entry_id = %entry.id,
                            attempts = entry.attempts,
                            error = %err,
                            "effect delivery exhausted, dead lettering"
                        );
                        self.store.outbox_dead_letter(&key, &entry)?;
                        report.dead_lettered += 1;
                    } else {
                        warn!(
                            entry_id = %entry.id,
                            attempts = entry.attempts,
                            error = %err,
                            "effect delivery failed, will retry"
                        );
                        self.store.outbox_retry_later(&key, &seen, &entry)?;
                        report.retrying += 1;
                    }
                }
            }
        }

        if report != DrainReport::default() {
            debug!(?report, "outbox drained");
        }
        Ok(report)
    }

    /// Run the dispatcher on a background thread until the handle is shut down.
    pub fn spawn(self) -> DispatcherHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let interval = self.config.poll_interval();

        let thread = thread::spawn(move || {
            info!("outbox dispatcher started");
            while !flag.load(Ordering::Acquire) {
                match self.drain_once() {
                    // keep going while there is a backlog
                    Ok(report) if report.delivered > 0 => continue,
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "outbox poll failed"),
                }
                thread::sleep(interval);
            }
            // deliver whatever committed before shutdown
            if let Err(err) = self.drain_once() {
                warn!(error = %err, "final outbox drain failed");
            }
            info!("outbox dispatcher stopped");
        });

        DispatcherHandle {
            stop,
            thread: Some(thread),
        }
    }
}

pub struct DispatcherHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("outbox dispatcher panicked");
            }
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
