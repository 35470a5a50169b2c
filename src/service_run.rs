//! Service run lifecycle: `Active -> Completed | Cancelled`.
//!
//! Unlike trades both sides may complete or cancel, and neither transition
//! touches the service itself; it stays bookable and may have any number of
//! runs active at once.
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use crate::error::{Result, SettlementError};
use crate::model::{
    Offer, Service, ServiceRun, Settlement, SettlementRef, SettlementStatus, Transaction,
};
use crate::outbox::{Effect, Notification, NotificationKind};
use crate::settlement::open_chat;
use crate::store::{Store, Tx, TxResult};
use crate::time::{Clock, TimeStamp};
use crate::trade::ensure_active;
use crate::utils;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRunCompletion {
    pub run: ServiceRun,
    pub transaction: Transaction,
}

pub struct ServiceRunLifecycle {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
}

impl ServiceRunLifecycle {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub(crate) fn open(
        tx: &Tx<'_>,
        offer: &Offer,
        service: &Service,
        now: &TimeStamp<Utc>,
    ) -> TxResult<ServiceRun> {
        let run_id = utils::new_uuid_to_bech32(utils::SERVICE_RUN)?;
        let chat = open_chat(
            tx,
            SettlementRef::ServiceRun(run_id.clone()),
            [service.provider_id.as_str(), offer.requester_id.as_str()],
            now,
        )?;

        let run = ServiceRun {
            id: run_id,
            offer_id: offer.id.clone(),
            service_id: service.id.clone(),
            provider_id: service.provider_id.clone(),
            client_id: offer.requester_id.clone(),
            status: SettlementStatus::Active,
            chat_id: chat.id,
            transaction_id: None,
            cancel_reason: None,
            cancelled_by: None,
            created_at: now.clone(),
            completed_at: None,
            cancelled_at: None,
        };
        tx.put(&run)?;
        Ok(run)
    }

    fn load_for_party(tx: &Tx<'_>, run_id: &str, caller_id: &str) -> TxResult<(ServiceRun, String)> {
        let run: ServiceRun = tx.load(run_id)?;
        match run.other_party(caller_id).map(str::to_string) {
            Some(other) => Ok((run, other)),
            None => Err(SettlementError::Forbidden(format!(
                "{caller_id} is not a party to service run {run_id}"
            ))
            .into()),
        }
    }

    /// Either party may signal the run is done.
    pub fn complete(&self, run_id: &str, caller_id: &str) -> Result<ServiceRunCompletion> {
        let now = self.clock.now();

        let completion = self.store.with_transaction("service_run.complete", |tx| {
            let (mut run, other) = Self::load_for_party(tx, run_id, caller_id)?;
            ensure_active(&run, run_id)?;

            let service: Service = tx.load(&run.service_id)?;
            let offer: Offer = tx.load(&run.offer_id)?;

            let transaction = Transaction::seal(
                utils::new_uuid_to_bech32(utils::TRANSACTION)?,
                SettlementRef::ServiceRun(run.id.clone()),
                &run.provider_id,
                &run.client_id,
                &service.service_type,
                &offer.offered_items,
                service.price,
                now.clone(),
            )?;
            tx.put(&transaction)?;

            run.status = SettlementStatus::Completed;
            run.completed_at = Some(now.clone());
            run.transaction_id = Some(transaction.id.clone());
            tx.put(&run)?;

            tx.emit(
                Effect::notify(&other, NotificationKind::ServiceRunCompleted, &run.id),
                &now,
            )?;
            tx.emit(Effect::touch(caller_id, &now), &now)?;

            Ok(ServiceRunCompletion { run, transaction })
        })?;

        info!(
            run_id,
            completed_by = caller_id,
            transaction_id = %completion.transaction.id,
            "service run completed"
        );
        Ok(completion)
    }

    pub fn cancel(&self, run_id: &str, caller_id: &str, reason: Option<String>) -> Result<ServiceRun> {
        let now = self.clock.now();

        let run = self.store.with_transaction("service_run.cancel", |tx| {
            let (mut run, other) = Self::load_for_party(tx, run_id, caller_id)?;
            ensure_active(&run, run_id)?;

            run.status = SettlementStatus::Cancelled;
            run.cancelled_at = Some(now.clone());
            run.cancelled_by = Some(caller_id.to_string());
            run.cancel_reason = reason.clone();
            tx.put(&run)?;

            tx.emit(
                Effect::Notify(
                    Notification::new(&other, NotificationKind::ServiceRunCancelled, &run.id)
                        .with_detail(reason.clone()),
                ),
                &now,
            )?;
            tx.emit(Effect::touch(caller_id, &now), &now)?;
            Ok(run)
        })?;

        info!(run_id, cancelled_by = caller_id, "service run cancelled");
        Ok(run)
    }

    pub fn get(&self, run_id: &str) -> Result<ServiceRun> {
        self.store.load(run_id)
    }

    pub fn active_for_service(&self, service_id: &str) -> Result<Vec<ServiceRun>> {
        Ok(self
            .store
            .scan::<ServiceRun>()?
            .into_iter()
            .filter(|run| run.service_id == service_id && run.status == SettlementStatus::Active)
            .collect())
    }
}
