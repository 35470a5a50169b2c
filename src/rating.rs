//! Rating gate.
//!
//! A transaction can be rated once by each of its two parties. The
//! `rating_by/<transaction>/<rater>` index row is checked and written in the
//! same transaction as the rating and the rated user's summary, so two
//! simultaneous submissions by the same rater produce one rating and one
//! `AlreadyExists`, and the summary counts exactly one new data point.
use std::sync::Arc;
use tracing::info;

use crate::error::{Result, SettlementError};
use crate::model::{Rating, RatingSummary, Transaction};
use crate::outbox::{Effect, NotificationKind};
use crate::store::{Store, rating_key};
use crate::time::Clock;
use crate::utils;

pub const MIN_STARS: u8 = 1;
pub const MAX_STARS: u8 = 5;

pub struct RatingGate {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
}

impl RatingGate {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Whether `user_id` may still rate the other party of `transaction_id`.
    pub fn can_rate(&self, transaction_id: &str, user_id: &str) -> Result<bool> {
        let transaction: Transaction = self.store.load(transaction_id)?;
        if !transaction.is_party(user_id) {
            return Ok(false);
        }
        Ok(!self.store.contains(&rating_key(transaction_id, user_id))?)
    }

    pub fn create(
        &self,
        transaction_id: &str,
        rater_id: &str,
        stars: u8,
        comment: Option<String>,
    ) -> Result<Rating> {
        if !(MIN_STARS..=MAX_STARS).contains(&stars) {
            return Err(SettlementError::Validation(format!(
                "stars must be between {MIN_STARS} and {MAX_STARS}, got {stars}"
            )));
        }
        let now = self.clock.now();

        let rating = self.store.with_transaction("rating.create", |tx| {
            let transaction: Transaction = tx.load(transaction_id)?;
            let Some(rated_id) = transaction.counterpart_of(rater_id) else {
                return Err(SettlementError::Forbidden(format!(
                    "{rater_id} is not a party to transaction {transaction_id}"
                ))
                .into());
            };

            let index = rating_key(transaction_id, rater_id);
            if tx.index_get(&index)?.is_some() {
                return Err(SettlementError::AlreadyExists(format!(
                    "{rater_id} already rated transaction {transaction_id}"
                ))
                .into());
            }

            let rating = Rating {
                id: utils::new_uuid_to_bech32(utils::RATING)?,
                transaction_id: transaction_id.to_string(),
                rater_id: rater_id.to_string(),
                rated_id: rated_id.to_string(),
                stars,
                comment: comment.clone(),
                created_at: now.clone(),
            };
            tx.put(&rating)?;
            tx.index_put(&index, &rating.id)?;

            let mut summary = tx
                .get::<RatingSummary>(rated_id)?
                .unwrap_or_else(|| RatingSummary::empty(rated_id));
            summary.record(stars);
            tx.put(&summary)?;

            tx.emit(
                Effect::notify(rated_id, NotificationKind::RatingReceived, &rating.id),
                &now,
            )?;
            Ok(rating)
        })?;

        info!(
            rating_id = %rating.id,
            transaction_id,
            rater_id,
            rated_id = %rating.rated_id,
            stars,
            "rating recorded"
        );
        Ok(rating)
    }

    /// Aggregate of the ratings `user_id` has received.
    pub fn summary(&self, user_id: &str) -> Result<RatingSummary> {
        Ok(self
            .store
            .get::<RatingSummary>(user_id)?
            .unwrap_or_else(|| RatingSummary::empty(user_id)))
    }

    pub fn ratings_for_user(&self, user_id: &str) -> Result<Vec<Rating>> {
        let mut ratings: Vec<Rating> = self
            .store
            .scan::<Rating>()?
            .into_iter()
            .filter(|rating| rating.rated_id == user_id)
            .collect();
        ratings.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(ratings)
    }
}
