//! Keyed single-record mailbox used as the signaling channel.
//!
//! Every participant owns one slot, addressed by username. Peers write into
//! each other's slots and only read their own. Offers *replace* the slot so a
//! new negotiation starts from a clean record; answers and candidates *merge*
//! into it so a trickled candidate never erases the offer it belongs to. Any
//! relay backing this trait has to keep that distinction.

pub mod firebase;
pub mod memory;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RelayError;
use crate::signaling::MailboxRecord;

pub use firebase::FirebaseRelay;
pub use memory::MemoryRelay;

/// One committed change to a subscribed slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotUpdate {
    /// Full current content after a write.
    Record(MailboxRecord),
    /// The slot held a record and was removed.
    Cleared,
}

/// Updates of one slot, in commit order.
pub type Inbox = mpsc::UnboundedReceiver<SlotUpdate>;

#[async_trait]
pub trait Relay: Send + Sync {
    /// Starts delivering updates of `user`'s slot, beginning with its current
    /// record if there is one.
    async fn subscribe(&self, user: &str) -> Result<Inbox, RelayError>;

    /// Removes the slot. Removing an absent slot succeeds.
    async fn clear(&self, user: &str) -> Result<(), RelayError>;

    /// Replaces the whole slot with `record`.
    async fn write_replace(&self, user: &str, record: &MailboxRecord) -> Result<(), RelayError>;

    /// Merges the fields present in `record` into the slot.
    async fn write_merge(&self, user: &str, record: &MailboxRecord) -> Result<(), RelayError>;
}

/// Applies a merge write to a stored slot object.
pub(crate) fn merge_fields(
    slot: &mut serde_json::Map<String, serde_json::Value>,
    patch: serde_json::Map<String, serde_json::Value>,
) {
    for (key, value) in patch {
        if value.is_null() {
            slot.remove(&key);
        } else {
            slot.insert(key, value);
        }
    }
}

pub(crate) fn record_fields(
    record: &MailboxRecord,
) -> Result<serde_json::Map<String, serde_json::Value>, RelayError> {
    match serde_json::to_value(record)? {
        serde_json::Value::Object(fields) => Ok(fields),
        other => Err(RelayError::Stream(format!("record serialized to {other}"))),
    }
}
