use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Message;

/// How messages from different sources are interleaved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderingPolicy {
    /// Concatenate in the order messages reach the store.
    #[default]
    Arrival,
    /// Keep the transcript stably sorted by `time_sent`.
    TimeSent,
}

impl std::str::FromStr for OrderingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "arrival" => Ok(Self::Arrival),
            "time-sent" | "timesent" | "time_sent" => Ok(Self::TimeSent),
            other => Err(format!("unknown ordering policy: {}", other)),
        }
    }
}

/// The ordered list of messages shown for one session.
///
/// History is seeded once; live pushes and local sends are appended. Nothing is removed.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<Message>,
    ids: HashSet<String>,
    policy: OrderingPolicy,
    seeded: bool,
}

impl Transcript {
    pub fn new(policy: OrderingPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Apply the history snapshot. Returns how many messages were added.
    ///
    /// Only the first call has an effect. When live or local messages already arrived the
    /// history goes in front of them; an id-less message already present absorbs its
    /// persisted copy instead of being shown twice.
    pub fn seed(&mut self, history: Vec<Message>) -> usize {
        if self.seeded {
            debug!("transcript already seeded, ignoring {} history messages", history.len());
            return 0;
        }
        self.seeded = true;

        let mut fresh = Vec::with_capacity(history.len());
        for message in history {
            if let Some(id) = &message.id {
                if self.ids.contains(id) {
                    continue;
                }
                if let Some(existing) = self
                    .messages
                    .iter_mut()
                    .find(|m| m.id.is_none() && m.fingerprint() == message.fingerprint())
                {
                    existing.id = Some(id.clone());
                    self.ids.insert(id.clone());
                    continue;
                }
                self.ids.insert(id.clone());
            }
            fresh.push(message);
        }

        let added = fresh.len();
        match self.policy {
            OrderingPolicy::Arrival => {
                fresh.append(&mut self.messages);
                self.messages = fresh;
            }
            OrderingPolicy::TimeSent => {
                // History is authoritative among itself, so insert it in front of equal timestamps.
                let mut floor = 0;
                for message in fresh {
                    let pos = self.messages[floor..]
                        .partition_point(|m| m.time_sent < message.time_sent)
                        + floor;
                    self.messages.insert(pos, message);
                    floor = pos + 1;
                }
            }
        }
        added
    }

    /// Append a message pushed by the hub. Returns false for a duplicate id.
    pub fn append_live(&mut self, message: Message) -> bool {
        self.append(message)
    }

    /// Append a message the local user just sent.
    pub fn append_local(&mut self, message: Message) -> bool {
        self.append(message)
    }

    fn append(&mut self, message: Message) -> bool {
        if let Some(id) = &message.id {
            if !self.ids.insert(id.clone()) {
                debug!("dropping duplicate message {}", id);
                return false;
            }
        }

        match self.policy {
            OrderingPolicy::Arrival => self.messages.push(message),
            OrderingPolicy::TimeSent => {
                if self
                    .messages
                    .last()
                    .map_or(true, |last| last.time_sent <= message.time_sent)
                {
                    self.messages.push(message);
                } else {
                    let pos = self
                        .messages
                        .partition_point(|m| m.time_sent <= message.time_sent);
                    self.messages.insert(pos, message);
                }
            }
        }
        true
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }
}
