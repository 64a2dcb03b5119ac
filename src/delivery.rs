//! Delivery hand-off: the sink a session calls once a message is fully
//! received to persist it into a recipient's mailbox.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::policy::Recipient;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("storage backend unavailable")]
    Unavailable,
}

/// Opaque identifier for a stored message, assigned by the backend.
pub type DeliveryId = u64;

/// Persists an assembled message into per-recipient storage.
///
/// Called once per recipient that wants the message stored
/// ([`Recipient::should_store`]); a failure for one recipient aborts the
/// remaining deliveries for that message without rolling back the ones
/// that already succeeded.
pub trait DeliveryManager: Send + Sync {
    fn deliver(
        &self,
        recipient: &Recipient,
        from: &str,
        recipients: &[Recipient],
        received_prefix: &str,
        body: &[u8],
    ) -> Result<DeliveryId, DeliveryError>;
}

/// A stored message as the in-memory backend keeps it.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: DeliveryId,
    pub from: String,
    pub recipients: Vec<String>,
    pub data: Vec<u8>,
}

/// Default delivery backend: an in-memory, mailbox-addressed store keyed by
/// recipient local part. Enough to make the server runnable standalone;
/// a real deployment swaps in a persistent [`DeliveryManager`].
#[derive(Default)]
pub struct MemoryMailbox {
    inner: Mutex<MemoryMailboxState>,
}

#[derive(Default)]
struct MemoryMailboxState {
    next_id: DeliveryId,
    mailboxes: HashMap<String, Vec<StoredMessage>>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of everything stored for `mailbox` (the recipient
    /// local part), oldest first.
    pub fn messages_for(&self, mailbox: &str) -> Vec<StoredMessage> {
        let state = self.inner.lock().expect("mailbox lock poisoned");
        state.mailboxes.get(mailbox).cloned().unwrap_or_default()
    }
}

impl DeliveryManager for MemoryMailbox {
    fn deliver(
        &self,
        recipient: &Recipient,
        from: &str,
        recipients: &[Recipient],
        received_prefix: &str,
        body: &[u8],
    ) -> Result<DeliveryId, DeliveryError> {
        let mut full = Vec::with_capacity(received_prefix.len() + body.len());
        full.extend_from_slice(received_prefix.as_bytes());
        full.extend_from_slice(body);

        let mut state = self.inner.lock().map_err(|_| DeliveryError::Unavailable)?;
        let id = state.next_id;
        state.next_id += 1;
        let message = StoredMessage {
            id,
            from: from.to_string(),
            recipients: recipients.iter().map(|r| r.address().to_string()).collect(),
            data: full,
        };
        state
            .mailboxes
            .entry(recipient.local_part().to_string())
            .or_default()
            .push(message);
        Ok(id)
    }
}
