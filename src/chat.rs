use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, SettlementError};
use crate::model::{
    Chat, Message, ServiceRun, Settlement, SettlementRef, SettlementStatus, Trade,
};
use crate::store::{Record, Store, Tx, TxResult};
use crate::time::Clock;
use crate::utils;

const MAX_BODY_LEN: usize = 2_000;

fn ensure_owner_active(tx: &Tx<'_>, owner: &SettlementRef) -> TxResult<()> {
    let status = match owner {
        SettlementRef::Trade(id) => tx.load::<Trade>(id)?.status(),
        SettlementRef::ServiceRun(id) => tx.load::<ServiceRun>(id)?.status(),
    };
    if status != SettlementStatus::Active {
        return Err(SettlementError::InvalidState(format!(
            "{} is {status:?}, chat is closed",
            owner.id()
        ))
        .into());
    }
    Ok(())
}

pub struct ChatService {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
}

impl ChatService {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Post to a settlement chat. Only open while the trade or run is active.
    pub fn send_message(&self, chat_id: &str, sender_id: &str, body: &str) -> Result<Message> {
        let body = body.trim();
        if body.is_empty() || body.chars().count() > MAX_BODY_LEN {
            return Err(SettlementError::Validation(format!(
                "message body must be 1..={MAX_BODY_LEN} characters"
            )));
        }
        let now = self.clock.now();

        let message = self.store.with_transaction("chat.send", |tx| {
            let chat: Chat = tx.load(chat_id)?;
            if !chat.participants.iter().any(|p| p == sender_id) {
                return Err(SettlementError::Forbidden(format!(
                    "{sender_id} is not in chat {chat_id}"
                ))
                .into());
            }
            ensure_owner_active(tx, &chat.owner)?;

            let message = Message {
                id: utils::new_uuid_to_bech32(utils::MESSAGE)?,
                chat_id: chat.id.clone(),
                sender_id: sender_id.to_string(),
                body: body.to_string(),
                sent_at: now.clone(),
            };
            tx.put(&message)?;
            Ok(message)
        })?;

        debug!(chat_id, message_id = %message.id, "message sent");
        Ok(message)
    }

    pub fn get(&self, chat_id: &str) -> Result<Chat> {
        self.store.load(chat_id)
    }

    /// Chat history, oldest first.
    pub fn messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        let chat: Chat = self.store.load(chat_id)?;
        let mut messages: Vec<Message> = self
            .store
            .scan_prefix(&format!("{}/{}/", Message::KIND, chat.id))?;
        messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));
        Ok(messages)
    }
}
