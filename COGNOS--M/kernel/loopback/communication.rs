use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::Switches;
use crate::{
    error::ProviderError,
    services::{CommunicationService, Message},
};

/// Messaging adapter that stores sent messages and serves seeded inbox ones.
#[derive(Debug)]
pub struct RecordingCommunication {
    name: String,
    sent: Mutex<Vec<Message>>,
    inbox: Mutex<Vec<Message>>,
    send_delay: Mutex<Option<Duration>>,
    switches: Switches,
}

impl RecordingCommunication {
    /// Creates an empty adapter.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sent: Mutex::new(Vec::new()),
            inbox: Mutex::new(Vec::new()),
            send_delay: Mutex::new(None),
            switches: Switches::default(),
        }
    }

    /// Seeds a message that `fetch_messages` will return.
    pub fn seed(&self, channel_id: &str, author: &str, content: &str) {
        self.inbox.lock().push(Message {
            id: format!("msg-{}", Uuid::new_v4()),
            channel_id: channel_id.into(),
            author: author.into(),
            content: content.into(),
            timestamp: Utc::now(),
        });
    }

    /// Messages sent through the adapter.
    #[must_use]
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    /// Changes the latency of `send_message`.
    pub fn set_send_delay(&self, delay: Option<Duration>) {
        *self.send_delay.lock() = delay;
    }

    /// Health and failure switches.
    #[must_use]
    pub const fn switches(&self) -> &Switches {
        &self.switches
    }
}

#[async_trait]
impl CommunicationService for RecordingCommunication {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> bool {
        self.switches.healthy()
    }

    async fn send_message(&self, channel_id: &str, content: &str) -> Result<bool, ProviderError> {
        let delay = *self.send_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.switches.failing() {
            return Err(ProviderError::new(format!("{} is failing", self.name)));
        }
        self.sent.lock().push(Message {
            id: format!("msg-{}", Uuid::new_v4()),
            channel_id: channel_id.into(),
            author: self.name.clone(),
            content: content.into(),
            timestamp: Utc::now(),
        });
        Ok(true)
    }

    async fn fetch_messages(
        &self,
        channel_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, ProviderError> {
        if self.switches.failing() {
            return Err(ProviderError::new(format!("{} is failing", self.name)));
        }
        let inbox = self.inbox.lock();
        let mut matching: Vec<Message> = inbox
            .iter()
            .filter(|message| message.channel_id == channel_id)
            .filter(|message| before.map_or(true, |cutoff| message.timestamp < cutoff))
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.split_off(skip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_returns_newest_within_limit() {
        let comm = RecordingCommunication::new("loopback");
        for text in ["one", "two", "three"] {
            comm.seed("general", "user", text);
        }
        comm.seed("other", "user", "elsewhere");
        let fetched = comm.fetch_messages("general", 2, None).await.unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[1].content, "three");

        assert!(comm.send_message("general", "hi").await.unwrap());
        assert_eq!(comm.sent().len(), 1);
    }
}
