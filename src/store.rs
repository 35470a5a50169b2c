//! Entity store over sled.
//!
//! All rows live in one `entities` tree under `<kind>/<id>` keys, so a single
//! sled transaction can read and write any combination of them. sled 0.34
//! runs transactions one at a time under a store-wide write lock, so a
//! transaction always reads the state every earlier one committed. That is
//! what makes the in-transaction re-checks of the settlement operations race
//! safe.
use sled::IVec;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use std::thread;
use std::time::Instant;
use chrono::Utc;
use tracing::{debug, warn};

use crate::config::SettlementConfig;
use crate::error::{Result, SettlementError};
use crate::model::{
    Chat, Listing, Message, Offer, Rating, RatingSummary, Service, ServiceRun, Trade, Transaction,
};
use crate::outbox::{Effect, OutboxEntry};
use crate::time::TimeStamp;

pub type TxResult<T> = ConflictableTransactionResult<T, SettlementError>;

const OUTBOX: &str = "outbox/";
const DEAD_LETTER: &str = "dead_letter/";
const ACTIVITY: &str = "activity/";

/// A CBOR encoded row addressed by `<KIND>/<id>`.
pub trait Record: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()> {
    const KIND: &'static str;

    fn id(&self) -> &str;

    fn key_for(id: &str) -> String {
        format!("{}/{}", Self::KIND, id)
    }

    fn key(&self) -> String {
        Self::key_for(self.id())
    }
}

macro_rules! record {
    ($ty:ty, $kind:literal, $id:ident) => {
        impl Record for $ty {
            const KIND: &'static str = $kind;
            fn id(&self) -> &str {
                &self.$id
            }
        }
    };
}

record!(Listing, "listing", id);
record!(Service, "service", id);
record!(Offer, "offer", id);
record!(Trade, "trade", id);
record!(ServiceRun, "service_run", id);
record!(Chat, "chat", id);
record!(Transaction, "transaction", id);
record!(Rating, "rating", id);
record!(RatingSummary, "rating_summary", user_id);

// messages are grouped under their chat so a chat's history is one prefix scan
impl Record for Message {
    const KIND: &'static str = "message";
    fn id(&self) -> &str {
        &self.id
    }
    fn key(&self) -> String {
        format!("{}/{}/{}", Self::KIND, self.chat_id, self.id)
    }
}

/// Index row marking the single active trade of a listing.
pub fn active_trade_key(listing_id: &str) -> String {
    format!("active_trade/{listing_id}")
}

/// Index row enforcing one rating per (transaction, rater).
pub fn rating_key(transaction_id: &str, rater_id: &str) -> String {
    format!("rating_by/{transaction_id}/{rater_id}")
}

/// Index row enforcing one live service per (provider, service type).
pub fn service_type_key(provider_id: &str, service_type: &str) -> String {
    format!(
        "service_type/{provider_id}/{}",
        service_type.trim().to_lowercase()
    )
}

fn decode<R: Record>(bytes: &[u8]) -> Result<R> {
    Ok(minicbor::decode(bytes)?)
}

fn encode<R: Record>(record: &R) -> Result<Vec<u8>> {
    Ok(minicbor::to_vec(record)?)
}

pub struct Store {
    db: sled::Db,
    entities: sled::Tree,
    settings: SettlementConfig,
}

impl Store {
    pub fn new(db: sled::Db, settings: SettlementConfig) -> Result<Self> {
        let entities = db.open_tree("entities")?;
        Ok(Self {
            db,
            entities,
            settings,
        })
    }

    pub fn settings(&self) -> &SettlementConfig {
        &self.settings
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn get<R: Record>(&self, id: &str) -> Result<Option<R>> {
        self.entities
            .get(R::key_for(id))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn load<R: Record>(&self, id: &str) -> Result<R> {
        self.get(id)?
            .ok_or_else(|| SettlementError::not_found(R::KIND, id))
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.entities.contains_key(key)?)
    }

    /// Every row of a kind. Lock free; sees the latest committed state.
    pub fn scan<R: Record>(&self) -> Result<Vec<R>> {
        self.scan_prefix(&format!("{}/", R::KIND))
    }

    pub fn scan_prefix<R: Record>(&self, prefix: &str) -> Result<Vec<R>> {
        self.entities
            .scan_prefix(prefix)
            .values()
            .map(|value| -> Result<R> { decode(&value?) })
            .collect()
    }

    /// Run `f` as one serialized transaction.
    ///
    /// `f` may run more than once, since storage failures are retried here.
    /// Every run first checks the deadline and aborts with `Timeout` once it
    /// has passed. The check happens after sled hands over its write lock, so
    /// time spent queued behind other transactions counts against the
    /// deadline but cannot be interrupted. Domain errors returned by `f`
    /// abort without a retry.
    pub fn with_transaction<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: Fn(&Tx<'_>) -> TxResult<T>,
    {
        let deadline = Instant::now() + self.settings.transaction_timeout();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let outcome = self.entities.transaction(|tree| {
                if Instant::now() >= deadline {
                    return Err(ConflictableTransactionError::Abort(
                        SettlementError::Timeout { op },
                    ));
                }
                f(&Tx { tree })
            });

            match outcome {
                Ok(value) => return Ok(value),
                Err(TransactionError::Abort(err)) => {
                    if err.is_retryable() {
                        warn!(op, attempt, error = %err, "transaction abandoned");
                    } else {
                        debug!(op, error = %err, "transaction rejected");
                    }
                    return Err(err);
                }
                Err(TransactionError::Storage(err)) => {
                    if attempt > self.settings.max_storage_retries || Instant::now() >= deadline {
                        warn!(op, attempt, error = %err, "storage failure, giving up");
                        return Err(SettlementError::Storage(err));
                    }
                    warn!(op, attempt, error = %err, "storage failure, retrying");
                    thread::sleep(self.settings.retry_backoff() * attempt);
                }
            }
        }
    }

    /// Oldest-first batch of undelivered effects.
    pub(crate) fn outbox_batch(&self, limit: usize) -> Result<Vec<(IVec, IVec, OutboxEntry)>> {
        self.entities
            .scan_prefix(OUTBOX)
            .take(limit)
            .map(|item| -> Result<(IVec, IVec, OutboxEntry)> {
                let (key, value) = item?;
                let entry: OutboxEntry = minicbor::decode(&value)?;
                Ok((key, value, entry))
            })
            .collect()
    }

    /// Remove a delivered entry, unless it changed since it was read.
    pub(crate) fn outbox_ack(&self, key: &IVec, seen: &IVec) -> Result<bool> {
        let swapped = self
            .entities
            .compare_and_swap(key, Some(seen), None as Option<&[u8]>)?;
        Ok(swapped.is_ok())
    }

    pub(crate) fn outbox_retry_later(&self, key: &IVec, seen: &IVec, entry: &OutboxEntry) -> Result<bool> {
        let bytes = minicbor::to_vec(entry)?;
        let swapped = self
            .entities
            .compare_and_swap(key, Some(seen), Some(bytes))?;
        Ok(swapped.is_ok())
    }

    pub(crate) fn outbox_dead_letter(&self, key: &IVec, entry: &OutboxEntry) -> Result<()> {
        let bytes = minicbor::to_vec(entry)?;
        let dead_key = format!("{DEAD_LETTER}{}", entry.id);
        self.entities
            .transaction(|tree| {
                tree.remove(key.clone())?;
                tree.insert(dead_key.as_bytes(), bytes.as_slice())?;
                Ok::<_, ConflictableTransactionError<SettlementError>>(())
            })
            .map_err(|err| match err {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(err) => SettlementError::Storage(err),
            })
    }

    pub fn outbox_len(&self) -> usize {
        self.entities.scan_prefix(OUTBOX).count()
    }

    pub fn dead_letters(&self) -> Result<Vec<OutboxEntry>> {
        self.entities
            .scan_prefix(DEAD_LETTER)
            .values()
            .map(|value| -> Result<OutboxEntry> { Ok(minicbor::decode(&value?)?) })
            .collect()
    }

    /// Record that `user_id` was active at `at`. Never moves backwards.
    pub(crate) fn touch_activity(&self, user_id: &str, at: &TimeStamp<Utc>) -> Result<()> {
        let key = format!("{ACTIVITY}{user_id}");
        let at = at.clone();
        self.entities.fetch_and_update(key, |current| {
            let previous: Option<TimeStamp<Utc>> =
                current.and_then(|bytes| minicbor::decode(bytes).ok());
            let newer = match previous {
                Some(previous) if previous >= at => previous,
                _ => at.clone(),
            };
            minicbor::to_vec(&newer).ok()
        })?;
        Ok(())
    }

    pub fn last_activity(&self, user_id: &str) -> Result<Option<TimeStamp<Utc>>> {
        self.entities
            .get(format!("{ACTIVITY}{user_id}"))?
            .map(|bytes| minicbor::decode(&bytes).map_err(SettlementError::from))
            .transpose()
    }
}

/// Typed view over a running transaction.
pub struct Tx<'a> {
    tree: &'a TransactionalTree,
}

impl Tx<'_> {
    pub fn get<R: Record>(&self, id: &str) -> TxResult<Option<R>> {
        match self.tree.get(R::key_for(id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn load<R: Record>(&self, id: &str) -> TxResult<R> {
        match self.get(id)? {
            Some(record) => Ok(record),
            None => Err(SettlementError::not_found(R::KIND, id).into()),
        }
    }

    pub fn put<R: Record>(&self, record: &R) -> TxResult<()> {
        self.tree.insert(record.key().as_bytes(), encode(record)?)?;
        Ok(())
    }

    pub fn index_get(&self, key: &str) -> TxResult<Option<String>> {
        Ok(self
            .tree
            .get(key)?
            .map(|value| String::from_utf8_lossy(&value).into_owned()))
    }

    pub fn index_put(&self, key: &str, value: &str) -> TxResult<()> {
        self.tree.insert(key.as_bytes(), value.as_bytes())?;
        Ok(())
    }

    pub fn index_remove(&self, key: &str) -> TxResult<()> {
        self.tree.remove(key.as_bytes())?;
        Ok(())
    }

    /// Queue a post-commit effect. It becomes visible to the dispatcher only
    /// if this transaction commits.
    pub fn emit(&self, effect: Effect, now: &TimeStamp<Utc>) -> TxResult<()> {
        let entry = OutboxEntry::new(effect, now.clone());
        let key = format!("{OUTBOX}{}", entry.id);
        let bytes = minicbor::to_vec(&entry).map_err(SettlementError::from)?;
        self.tree.insert(key.as_bytes(), bytes)?;
        Ok(())
    }
}
