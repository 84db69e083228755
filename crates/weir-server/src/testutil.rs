//! Shared helpers for the in-process tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use weir_channels::{ChannelError, ChannelLayer, Message};

/// The reply channel prefix [`ScriptedLayer::new_channel`] produces via
/// [`crate::receiver::ReplyRouter::spawn`].
pub const SCRIPTED_PREFIX: &str = "weir.response.AbCdEfGhIjKl!";

/// A channel layer for tests: receives replay a scripted list of replies,
/// sends are recorded, and channels can be marked full.
pub struct ScriptedLayer {
    replies: Mutex<VecDeque<(String, Message)>>,
    pub sent: Mutex<Vec<(String, Message)>>,
    full_channels: Vec<String>,
}

impl ScriptedLayer {
    pub fn new(replies: Vec<(String, Message)>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().collect()),
            sent: Mutex::new(Vec::new()),
            full_channels: Vec::new(),
        })
    }

    pub fn full(channels: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            full_channels: channels,
        })
    }

    pub fn sent_to(&self, channel: &str) -> Vec<Message> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(sent_channel, _)| sent_channel == channel)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

#[async_trait]
impl ChannelLayer for ScriptedLayer {
    async fn send(&self, channel: &str, message: Message) -> Result<(), ChannelError> {
        if self.full_channels.iter().any(|full| full == channel) {
            return Err(ChannelError::Full {
                channel: channel.to_string(),
            });
        }
        self.sent.lock().unwrap().push((channel.to_string(), message));
        Ok(())
    }

    async fn receive(
        &self,
        _channels: &[String],
        _block: bool,
    ) -> Result<Option<(String, Message)>, ChannelError> {
        // paced so tests can register waiters before replies arrive
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(self.replies.lock().unwrap().pop_front())
    }

    async fn new_channel(&self, prefix: &str) -> Result<String, ChannelError> {
        Ok(format!("{prefix}AbCdEfGhIjKl"))
    }
}
