use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{merge_fields, record_fields, Inbox, Relay, SlotUpdate};
use crate::error::RelayError;
use crate::signaling::MailboxRecord;

#[derive(Default)]
struct Slot {
    value: Option<Map<String, Value>>,
    subscribers: Vec<mpsc::UnboundedSender<SlotUpdate>>,
}

impl Slot {
    fn current(&self) -> Option<MailboxRecord> {
        let value = self.value.as_ref()?;
        match serde_json::from_value(Value::Object(value.clone())) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("slot holds an unreadable record: {e}");
                None
            }
        }
    }

    fn notify(&mut self, update: SlotUpdate) {
        self.subscribers.retain(|tx| tx.send(update.clone()).is_ok());
    }

    fn notify_current(&mut self) {
        if let Some(record) = self.current() {
            self.notify(SlotUpdate::Record(record));
        }
    }
}

#[derive(Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    faults: HashSet<String>,
}

/// In-process relay with the same replace/merge/notify contract as a hosted
/// realtime database. Shared between clients through an `Arc`.
#[derive(Default)]
pub struct MemoryRelay {
    inner: Mutex<Inner>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record stored for `user`.
    pub fn snapshot(&self, user: &str) -> Option<MailboxRecord> {
        self.inner.lock().slots.get(user).and_then(Slot::current)
    }

    /// Makes every following operation on `user`'s slot fail.
    pub fn inject_fault(&self, user: &str) {
        self.inner.lock().faults.insert(user.to_owned());
    }

    pub fn clear_faults(&self) {
        self.inner.lock().faults.clear();
    }

    fn check(inner: &Inner, user: &str) -> Result<(), RelayError> {
        if user.is_empty() {
            return Err(RelayError::InvalidUser(String::new()));
        }
        if inner.faults.contains(user) {
            return Err(RelayError::Unavailable(user.to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn subscribe(&self, user: &str) -> Result<Inbox, RelayError> {
        let mut inner = self.inner.lock();
        Self::check(&inner, user)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let slot = inner.slots.entry(user.to_owned()).or_default();
        if let Some(record) = slot.current() {
            let _ = tx.send(SlotUpdate::Record(record));
        }
        slot.subscribers.push(tx);
        debug!("subscribed to slot {user}");
        Ok(rx)
    }

    async fn clear(&self, user: &str) -> Result<(), RelayError> {
        let mut inner = self.inner.lock();
        Self::check(&inner, user)?;
        if let Some(slot) = inner.slots.get_mut(user) {
            if slot.value.take().is_some() {
                debug!("cleared slot {user}");
                slot.notify(SlotUpdate::Cleared);
            }
        }
        Ok(())
    }

    async fn write_replace(&self, user: &str, record: &MailboxRecord) -> Result<(), RelayError> {
        let fields = record_fields(record)?;
        let mut inner = self.inner.lock();
        Self::check(&inner, user)?;
        let slot = inner.slots.entry(user.to_owned()).or_default();
        slot.value = Some(fields);
        slot.notify_current();
        Ok(())
    }

    async fn write_merge(&self, user: &str, record: &MailboxRecord) -> Result<(), RelayError> {
        let fields = record_fields(record)?;
        let mut inner = self.inner.lock();
        Self::check(&inner, user)?;
        let slot = inner.slots.entry(user.to_owned()).or_default();
        merge_fields(slot.value.get_or_insert_with(Map::new), fields);
        slot.notify_current();
        Ok(())
    }
}
