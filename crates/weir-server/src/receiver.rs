//! The process-wide reply receiver.
//!
//! Worker replies for every connection of this process come back on channels
//! sharing one random prefix, so a single blocking Redis reader is enough for
//! the whole process. This module runs that reader and fans messages out to
//! per-connection waiters by exact channel name. The fan-out is an actor: the
//! task owns the waiter map, handlers talk to it through a command queue, and
//! delivery never blocks the reader for more than a bounded moment.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, error, warn};
use weir_channels::{ChannelError, ChannelLayer, Message};

const REPLY_CHANNEL_BASE: &str = "weir.response.";

/// Bound of each waiter's in-process queue.
const WAITER_BUFFER: usize = 16;

/// How long a delivery may wait on a slow waiter before it is evicted.
const DELIVER_TIMEOUT: Duration = Duration::from_secs(1);

enum Command {
    Register {
        channel: String,
        waiter: mpsc::Sender<Message>,
    },
    Unregister {
        channel: String,
    },
}

/// Handle to the reply receiver. Cheap to clone.
#[derive(Clone)]
pub struct ReplyRouter {
    prefix: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl ReplyRouter {
    /// Creates the process-wide reply channel prefix and starts the receiver
    /// task behind it.
    pub async fn spawn(channels: Arc<dyn ChannelLayer>) -> Result<Self> {
        let base = channels
            .new_channel(REPLY_CHANNEL_BASE)
            .await
            .context("cannot create the reply channel prefix")?;
        let prefix = format!("{base}!");
        let (commands, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(channels, prefix.clone(), command_rx));
        Ok(Self { prefix, commands })
    }

    /// The stable prefix every reply channel of this process starts with.
    /// Per-connection channels are `new_channel(prefix)`.
    pub fn channel_prefix(&self) -> &str {
        &self.prefix
    }

    /// Registers a waiter for one reply channel. Dropping the returned waiter
    /// unregisters it.
    pub fn register(&self, channel: String) -> ReplyWaiter {
        let (waiter, messages) = mpsc::channel(WAITER_BUFFER);
        let _ = self.commands.send(Command::Register {
            channel: channel.clone(),
            waiter,
        });
        ReplyWaiter {
            channel,
            messages,
            commands: self.commands.clone(),
        }
    }
}

/// The receiving end of one registered reply channel.
pub struct ReplyWaiter {
    channel: String,
    messages: mpsc::Receiver<Message>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ReplyWaiter {
    /// The next reply, or `None` once the receiver has evicted this waiter.
    pub async fn next(&mut self) -> Option<Message> {
        self.messages.recv().await
    }

    /// Like [`next`](Self::next), but gives up after `timeout`.
    pub async fn recv(&mut self, timeout: Duration) -> Result<Message, ChannelError> {
        match tokio::time::timeout(timeout, self.messages.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(ChannelError::Protocol(
                "reply waiter was evicted".to_string(),
            )),
            Err(_) => Err(ChannelError::Timeout),
        }
    }
}

impl Drop for ReplyWaiter {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Unregister {
            channel: std::mem::take(&mut self.channel),
        });
    }
}

async fn run(
    channels: Arc<dyn ChannelLayer>,
    prefix: String,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let (message_tx, mut messages) = mpsc::channel::<(String, Message)>(WAITER_BUFFER);
    let reader = tokio::spawn({
        let channels = channels.clone();
        let listen = vec![prefix.clone()];
        async move {
            loop {
                match channels.receive(&listen, true).await {
                    Ok(Some(received)) => {
                        if message_tx.send(received).await.is_err() {
                            return;
                        }
                    }
                    // a blocking receive timing out just means no traffic
                    Ok(None) => {}
                    Err(err) => {
                        error!(%err, "cannot receive from the reply channel");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        }
    });

    let mut waiters: HashMap<String, mpsc::Sender<Message>> = HashMap::new();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Register { channel, waiter }) => {
                    waiters.insert(channel, waiter);
                }
                Some(Command::Unregister { channel }) => {
                    waiters.remove(&channel);
                }
                None => break,
            },
            received = messages.recv() => match received {
                Some((channel, message)) => deliver(&mut waiters, channel, message).await,
                None => break,
            },
        }
    }
    reader.abort();
}

async fn deliver(
    waiters: &mut HashMap<String, mpsc::Sender<Message>>,
    channel: String,
    message: Message,
) {
    let Some(waiter) = waiters.get(&channel) else {
        warn!(%channel, "got a reply without a registered waiter, dropping it");
        return;
    };
    match waiter.send_timeout(message, DELIVER_TIMEOUT).await {
        Ok(()) => {}
        Err(SendTimeoutError::Timeout(_)) => {
            warn!(%channel, "waiter did not take its reply in time, evicting it");
            waiters.remove(&channel);
        }
        Err(SendTimeoutError::Closed(_)) => {
            debug!(%channel, "waiter is gone, evicting it");
            waiters.remove(&channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::{SCRIPTED_PREFIX, ScriptedLayer};

    use super::*;

    fn tagged(tag: &str) -> Message {
        let mut message = Message::new();
        message.insert("tag", tag);
        message
    }

    #[tokio::test]
    async fn delivers_to_the_exact_waiter() {
        let layer = ScriptedLayer::new(vec![
            (format!("{SCRIPTED_PREFIX}one"), tagged("first")),
            (format!("{SCRIPTED_PREFIX}two"), tagged("second")),
        ]);
        let router = ReplyRouter::spawn(layer).await.unwrap();
        assert_eq!(router.channel_prefix(), SCRIPTED_PREFIX);

        let mut one = router.register(format!("{SCRIPTED_PREFIX}one"));
        let mut two = router.register(format!("{SCRIPTED_PREFIX}two"));
        let got_one = one.recv(Duration::from_secs(1)).await.unwrap();
        let got_two = two.recv(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got_one.str_of("tag"), Some("first"));
        assert_eq!(got_two.str_of("tag"), Some("second"));
    }

    #[tokio::test]
    async fn drops_replies_without_a_waiter() {
        let layer = ScriptedLayer::new(vec![
            (format!("{SCRIPTED_PREFIX}nobody"), tagged("lost")),
            (format!("{SCRIPTED_PREFIX}mine"), tagged("kept")),
        ]);
        let router = ReplyRouter::spawn(layer).await.unwrap();

        let mut mine = router.register(format!("{SCRIPTED_PREFIX}mine"));
        let got = mine.recv(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.str_of("tag"), Some("kept"));
    }

    #[tokio::test]
    async fn dropping_a_waiter_unregisters_it() {
        let layer = ScriptedLayer::new(vec![
            (format!("{SCRIPTED_PREFIX}gone"), tagged("discarded")),
            (format!("{SCRIPTED_PREFIX}alive"), tagged("delivered")),
        ]);
        let router = ReplyRouter::spawn(layer).await.unwrap();

        let gone = router.register(format!("{SCRIPTED_PREFIX}gone"));
        let mut alive = router.register(format!("{SCRIPTED_PREFIX}alive"));
        drop(gone);
        // the reply for the dropped waiter is discarded and the receiver keeps going
        let got = alive.recv(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.str_of("tag"), Some("delivered"));
    }
}
