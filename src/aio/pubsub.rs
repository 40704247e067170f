use std::collections::HashMap;
use std::str::from_utf8;
use std::sync::{Arc, Mutex};

use log::trace;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::types::Value;

/// Callback invoked with every message published to a subscribed channel or
/// pattern.
pub type MessageCallback = Arc<dyn Fn(Msg) + Send + Sync>;

/// Callback invoked when a subscription is confirmed or torn down, with the
/// channel (or pattern) name and the connection's remaining subscription
/// count as reported by the server.
pub type SubscriptionCallback = Arc<dyn Fn(&str, usize) + Send + Sync>;

/// This holds the data that comes from listening to a pubsub connection.
/// It only contains actual message data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Msg {
    payload: Value,
    channel: Value,
    pattern: Option<Value>,
}

impl Msg {
    /// Tries to convert provided [`Value`] into [`Msg`].
    ///
    /// Only `message` and `pmessage` frames qualify; subscription
    /// confirmations are replies to commands and stay on the request path.
    pub fn from_value(value: &Value) -> Option<Self> {
        let items = value.as_sequence()?;
        let mut iter = items.iter().cloned();
        let msg_type = iter.next()?;
        let msg_type = msg_type.as_str()?;
        let mut pattern = None;
        let payload;
        let channel;

        if msg_type == "message" {
            channel = iter.next()?;
            payload = iter.next()?;
        } else if msg_type == "pmessage" {
            pattern = Some(iter.next()?);
            channel = iter.next()?;
            payload = iter.next()?;
        } else {
            return None;
        }

        Some(Msg {
            payload,
            channel,
            pattern,
        })
    }

    /// Convenience method to get a string version of the channel.  Unless
    /// your channel contains non utf-8 bytes you can always use this method.
    /// If the channel is not a valid string (which really should not happen)
    /// then the return value is `"?"`.
    pub fn get_channel_name(&self) -> &str {
        match self.channel {
            Value::BulkString(Some(ref bytes)) => from_utf8(bytes).unwrap_or("?"),
            Value::SimpleString(ref s) => s,
            _ => "?",
        }
    }

    /// Returns the bytes that are the message's payload.
    pub fn get_payload_bytes(&self) -> &[u8] {
        match self.payload {
            Value::BulkString(Some(ref bytes)) => bytes,
            _ => b"",
        }
    }

    /// Returns true if the message was constructed from a pattern
    /// subscription.
    pub fn from_pattern(&self) -> bool {
        self.pattern.is_some()
    }

    /// If the message was constructed from a message pattern this returns
    /// its name.
    pub fn get_pattern_name(&self) -> Option<&str> {
        match self.pattern {
            Some(Value::BulkString(Some(ref bytes))) => from_utf8(bytes).ok(),
            Some(Value::SimpleString(ref s)) => Some(s),
            _ => None,
        }
    }
}

/// Whether a subscription targets a channel or a pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SubscriptionKind {
    Channel,
    Pattern,
}

impl SubscriptionKind {
    pub(crate) fn subscribe_command(self) -> &'static str {
        match self {
            SubscriptionKind::Channel => "SUBSCRIBE",
            SubscriptionKind::Pattern => "PSUBSCRIBE",
        }
    }

    pub(crate) fn unsubscribe_command(self) -> &'static str {
        match self {
            SubscriptionKind::Channel => "UNSUBSCRIBE",
            SubscriptionKind::Pattern => "PUNSUBSCRIBE",
        }
    }
}

/// One registered subscription: where messages go, and what to tell the user
/// when it ends.
pub(crate) struct SubscriptionEntry {
    pub(crate) on_message: MessageCallback,
    pub(crate) on_unsubscribe: Option<SubscriptionCallback>,
}

/// The channel and pattern subscriptions currently active on the pinned
/// pubsub connection.  Shared between the pool task (which mutates it) and
/// the router task (which reads it per message).
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    pub(crate) channels: HashMap<String, SubscriptionEntry>,
    pub(crate) patterns: HashMap<String, SubscriptionEntry>,
}

impl SubscriptionRegistry {
    pub(crate) fn entries(&mut self, kind: SubscriptionKind) -> &mut HashMap<String, SubscriptionEntry> {
        match kind {
            SubscriptionKind::Channel => &mut self.channels,
            SubscriptionKind::Pattern => &mut self.patterns,
        }
    }

    pub(crate) fn names(&self, kind: SubscriptionKind) -> Vec<String> {
        match kind {
            SubscriptionKind::Channel => self.channels.keys().cloned().collect(),
            SubscriptionKind::Pattern => self.patterns.keys().cloned().collect(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty()
    }
}

/// Extracts `(name, remaining_count)` from a subscribe/unsubscribe
/// confirmation frame (`[kind, name, count]`).
pub(crate) fn subscription_count(value: &Value) -> Option<(String, i64)> {
    let items = value.as_sequence()?;
    if items.len() != 3 {
        return None;
    }
    let name = items[1].as_str()?.to_string();
    let count = items[2].as_int()?;
    Some((name, count))
}

/// Dispatches decoded pubsub messages to the callbacks registered for their
/// channel or pattern.  Runs as its own task for the lifetime of the pinned
/// connection.
pub(crate) async fn route_messages(
    mut receiver: UnboundedReceiver<Msg>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
) {
    while let Some(msg) = receiver.recv().await {
        let callback = {
            let registry = registry.lock().unwrap();
            match msg.get_pattern_name() {
                Some(pattern) => registry.patterns.get(pattern).map(|e| e.on_message.clone()),
                None => registry
                    .channels
                    .get(msg.get_channel_name())
                    .map(|e| e.on_message.clone()),
            }
        };
        match callback {
            Some(callback) => callback(msg),
            None => trace!(
                "dropping message for channel {:?} with no subscriber",
                msg.get_channel_name()
            ),
        }
    }
}
