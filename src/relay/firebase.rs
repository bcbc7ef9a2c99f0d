use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder};
use reqwest_eventsource::{Event, EventSource};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use super::{merge_fields, Inbox, Relay, SlotUpdate};
use crate::error::RelayError;
use crate::signaling::MailboxRecord;

/// Characters the realtime database refuses in keys; `/` would reach into
/// another path.
const RESERVED_KEY_CHARS: &[char] = &['.', '$', '#', '[', ']', '/'];

/// Realtime-database relay: every slot lives at `{base}/users/{user}.json`.
///
/// `PUT` replaces, `PATCH` merges and `DELETE` clears; subscriptions use the
/// database's `text/event-stream` interface.
#[derive(Debug, Clone)]
pub struct FirebaseRelay {
    client: Client,
    base: Url,
}

impl FirebaseRelay {
    pub fn new(base_url: &str) -> Result<Self, RelayError> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(FirebaseRelay {
            client: Client::new(),
            base,
        })
    }

    pub fn slot_url(&self, user: &str) -> Result<Url, RelayError> {
        // an empty key addresses the whole `users` collection
        if user.is_empty() || user.contains(RESERVED_KEY_CHARS) {
            return Err(RelayError::InvalidUser(user.to_owned()));
        }
        let mut url = self.base.join("users/")?;
        url.path_segments_mut()
            .map_err(|_| RelayError::Stream(format!("{} cannot hold paths", self.base)))?
            .pop_if_empty()
            .push(&format!("{user}.json"));
        Ok(url)
    }

    async fn send(request: RequestBuilder) -> Result<(), RelayError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Status { status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl Relay for FirebaseRelay {
    async fn subscribe(&self, user: &str) -> Result<Inbox, RelayError> {
        let request = self
            .client
            .get(self.slot_url(user)?)
            .header(ACCEPT, "text/event-stream");
        let source =
            EventSource::new(request).map_err(|e| RelayError::Stream(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(follow_slot(user.to_owned(), source, tx));
        Ok(rx)
    }

    async fn clear(&self, user: &str) -> Result<(), RelayError> {
        Self::send(self.client.delete(self.slot_url(user)?)).await
    }

    async fn write_replace(&self, user: &str, record: &MailboxRecord) -> Result<(), RelayError> {
        Self::send(self.client.put(self.slot_url(user)?).json(record)).await
    }

    async fn write_merge(&self, user: &str, record: &MailboxRecord) -> Result<(), RelayError> {
        Self::send(self.client.patch(self.slot_url(user)?).json(record)).await
    }
}

#[derive(Debug, Deserialize)]
struct StreamPayload {
    path: String,
    data: Value,
}

/// Local copy of one slot, rebuilt from `put`/`patch` stream events.
#[derive(Debug, Default)]
pub(crate) struct SlotMirror {
    value: Option<Map<String, Value>>,
}

impl SlotMirror {
    /// Applies one stream event and returns what subscribers should see.
    pub(crate) fn apply(&mut self, event: &str, path: &str, data: Value) -> Option<SlotUpdate> {
        let had_value = self.value.is_some();
        let field = path.trim_start_matches('/');

        match (event, field) {
            ("put", "") => {
                self.value = match data {
                    Value::Object(fields) if !fields.is_empty() => Some(fields),
                    _ => None,
                };
            }
            ("put", field) => {
                let slot = self.value.get_or_insert_with(Map::new);
                if data.is_null() {
                    slot.remove(field);
                } else {
                    slot.insert(field.to_owned(), data);
                }
            }
            ("patch", "") => {
                if let Value::Object(fields) = data {
                    merge_fields(self.value.get_or_insert_with(Map::new), fields);
                }
            }
            _ => {
                debug!("ignoring {event} at {path}");
                return None;
            }
        }

        if self.value.as_ref().is_some_and(Map::is_empty) {
            self.value = None;
        }

        match &self.value {
            None if had_value => Some(SlotUpdate::Cleared),
            None => None,
            Some(fields) => match serde_json::from_value(Value::Object(fields.clone())) {
                Ok(record) => Some(SlotUpdate::Record(record)),
                Err(e) => {
                    debug!("slot not a complete record yet: {e}");
                    None
                }
            },
        }
    }
}

async fn follow_slot(
    user: String,
    mut source: EventSource,
    tx: mpsc::UnboundedSender<SlotUpdate>,
) {
    let mut mirror = SlotMirror::default();

    loop {
        let event = tokio::select! {
            biased;
            _ = tx.closed() => {
                debug!("nobody listens to slot {user} any more");
                break;
            }
            event = source.next() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let message = match event {
            Ok(Event::Open) => {
                info!("listening to slot {user}");
                continue;
            }
            Ok(Event::Message(message)) => message,
            Err(reqwest_eventsource::Error::StreamEnded) => {
                debug!("slot {user} stream ended, reconnecting");
                continue;
            }
            Err(
                e @ (reqwest_eventsource::Error::InvalidStatusCode(..)
                | reqwest_eventsource::Error::InvalidContentType(..)),
            ) => {
                warn!("slot {user} stream refused: {e}");
                break;
            }
            Err(e) => {
                warn!("slot {user} stream error, retrying: {e}");
                continue;
            }
        };

        match message.event.as_str() {
            "put" | "patch" => {
                let payload: StreamPayload = match serde_json::from_str(&message.data) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("unreadable {} event on slot {user}: {e}", message.event);
                        continue;
                    }
                };
                if let Some(update) = mirror.apply(&message.event, &payload.path, payload.data) {
                    if tx.send(update).is_err() {
                        break;
                    }
                }
            }
            "keep-alive" => {}
            "cancel" | "auth_revoked" => {
                warn!("relay closed slot {user}: {}", message.data);
                break;
            }
            other => debug!("unknown event {other} on slot {user}"),
        }
    }

    source.close();
    debug!("stopped following slot {user}");
}
