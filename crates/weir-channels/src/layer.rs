//! The Redis-backed channel layer.
//!
//! Every channel is a pair of Redis keys: a list of message keys per channel
//! and one expiring payload key per message. Sends go through a Lua script so
//! a full queue rejects the message without touching Redis; receives pop the
//! head of the list and fetch its payload. The two-key design means a consumed
//! message's payload disappears on its own TTL, no transaction needed.

use std::sync::Mutex;

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use redis::{AsyncCommands, Script};
use tracing::debug;
use uuid::Uuid;

use crate::error::ChannelError;
use crate::message::{self, Message};

/// Server-side timeout for a blocking receive, in seconds.
const BLPOP_TIMEOUT_SECS: f64 = 3.0;

const SUFFIX_LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const SUFFIX_LEN: usize = 12;

/// Atomic capacity-checked enqueue.
/// `KEYS = [payload key, list key]`, `ARGV = [payload, expiry, capacity]`.
const SEND_SCRIPT: &str = r#"
if redis.call('llen', KEYS[2]) >= tonumber(ARGV[3]) then
    return redis.error_reply("full")
end
redis.call('set', KEYS[1], ARGV[1])
redis.call('expire', KEYS[1], ARGV[2])
redis.call('rpush', KEYS[2], KEYS[1])
redis.call('expire', KEYS[2], ARGV[2] + 1)
"#;

/// The operations the gateway needs from a channel layer.
#[async_trait]
pub trait ChannelLayer: Send + Sync {
    /// Enqueues a message. Fails with [`ChannelError::Full`] when the channel
    /// is at capacity.
    async fn send(&self, channel: &str, message: Message) -> Result<(), ChannelError>;

    /// Takes the next message from the first of `channels` that has one.
    /// With `block`, waits server-side for a few seconds before giving up.
    /// Returns `None` when there was nothing to receive; otherwise the channel
    /// name the message was addressed to and the message itself.
    async fn receive(
        &self,
        channels: &[String],
        block: bool,
    ) -> Result<Option<(String, Message)>, ChannelError>;

    /// Returns `prefix` plus a random suffix that does not name an existing
    /// channel.
    async fn new_channel(&self, prefix: &str) -> Result<String, ChannelError>;
}

#[derive(Debug, Clone)]
pub struct ChannelLayerConfig {
    pub url: String,
    /// Prepended to every Redis key.
    pub prefix: String,
    /// Per-message expiry in seconds. Channel lists live one second longer.
    pub expiry: u64,
    /// Maximum number of queued messages per channel.
    pub capacity: usize,
}

impl Default for ChannelLayerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            prefix: "asgi:".to_string(),
            expiry: 60,
            capacity: 100,
        }
    }
}

pub struct RedisChannelLayer {
    pool: Pool,
    prefix: String,
    expiry: u64,
    capacity: usize,
    send_script: Script,
    rng: Mutex<StdRng>,
}

impl RedisChannelLayer {
    pub fn new(config: ChannelLayerConfig) -> Result<Self, ChannelError> {
        let pool = PoolConfig::from_url(&config.url)
            .builder()
            .map_err(|err| ChannelError::Config(err.to_string()))?
            .max_size(pool_size())
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|err| ChannelError::Config(err.to_string()))?;
        Ok(Self {
            pool,
            prefix: config.prefix,
            expiry: config.expiry,
            capacity: config.capacity,
            send_script: Script::new(SEND_SCRIPT),
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    /// Round-trips a PING, mostly useful at startup to fail fast on a bad
    /// Redis address.
    pub async fn ping(&self) -> Result<(), ChannelError> {
        let mut conn = self.pool.get().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    fn random_suffix(&self) -> String {
        let mut rng = self.rng.lock().expect("rng lock poisoned");
        (0..SUFFIX_LEN)
            .map(|_| SUFFIX_LETTERS[rng.gen_range(0..SUFFIX_LETTERS.len())] as char)
            .collect()
    }
}

#[async_trait]
impl ChannelLayer for RedisChannelLayer {
    async fn send(&self, channel: &str, message: Message) -> Result<(), ChannelError> {
        let payload = message::encode(message)?;
        let message_key = format!("{}{}", self.prefix, Uuid::new_v4());
        let channel_key = format!("{}{}", self.prefix, channel);
        let mut conn = self.pool.get().await?;
        let sent = self
            .send_script
            .key(&message_key)
            .key(&channel_key)
            .arg(payload)
            .arg(self.expiry)
            .arg(self.capacity)
            .invoke_async::<()>(&mut conn)
            .await;
        match sent {
            Ok(()) => Ok(()),
            Err(err) if err.code() == Some("full") => Err(ChannelError::Full {
                channel: channel.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn receive(
        &self,
        channels: &[String],
        block: bool,
    ) -> Result<Option<(String, Message)>, ChannelError> {
        let mut conn = self.pool.get().await?;

        let popped = if block {
            let keys: Vec<String> = channels
                .iter()
                .map(|channel| format!("{}{}", self.prefix, channel))
                .collect();
            let reply: Option<(String, String)> =
                conn.blpop(&keys, BLPOP_TIMEOUT_SECS).await?;
            reply.map(|(key, message_key)| {
                let channel = key
                    .strip_prefix(&self.prefix)
                    .unwrap_or(&key)
                    .to_string();
                (channel, message_key)
            })
        } else {
            let mut hit = None;
            for channel in channels {
                let key = format!("{}{}", self.prefix, channel);
                let message_key: Option<String> = conn.lpop(&key, None).await?;
                if let Some(message_key) = message_key {
                    hit = Some((channel.clone(), message_key));
                    break;
                }
            }
            hit
        };
        let Some((channel, message_key)) = popped else {
            return Ok(None);
        };

        // The list holds full payload keys, prefix included.
        let payload: Option<Vec<u8>> = conn.get(&message_key).await?;
        let Some(payload) = payload else {
            return Err(ChannelError::Codec(format!(
                "payload for {message_key} is missing or expired"
            )));
        };
        let (message, reply_channel) = message::decode(&payload)?;
        Ok(Some((reply_channel.unwrap_or(channel), message)))
    }

    async fn new_channel(&self, prefix: &str) -> Result<String, ChannelError> {
        let mut conn = self.pool.get().await?;
        loop {
            let channel = format!("{}{}", prefix, self.random_suffix());
            let exists: bool = conn.exists(format!("{}{}", self.prefix, channel)).await?;
            if !exists {
                return Ok(channel);
            }
            debug!(%channel, "channel name is taken, drawing another suffix");
        }
    }
}

/// One third of the open-file limit where the platform exposes it, so client
/// sockets keep the other two thirds. The pool waits on exhaustion instead of
/// failing.
fn pool_size() -> usize {
    #[cfg(unix)]
    {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
        if rc == 0 && limit.rlim_cur != libc::RLIM_INFINITY {
            return (limit.rlim_cur / 3).max(1) as usize;
        }
    }
    500
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn test_layer(prefix: &str, capacity: usize) -> RedisChannelLayer {
        RedisChannelLayer::new(ChannelLayerConfig {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            prefix: format!("weir-test:{prefix}:{}:", Uuid::new_v4()),
            expiry: 10,
            capacity,
        })
        .unwrap()
    }

    fn text_message(text: &str) -> Message {
        let mut message = Message::new();
        message.insert("text", text);
        message
    }

    #[test]
    fn suffixes_use_the_letter_alphabet() {
        let layer = test_layer("alphabet", 100);
        for _ in 0..100 {
            let suffix = layer.random_suffix();
            assert_eq!(suffix.len(), SUFFIX_LEN);
            assert!(suffix.bytes().all(|b| SUFFIX_LETTERS.contains(&b)));
        }
    }

    #[test]
    fn suffixes_do_not_collide() {
        let layer = test_layer("collide", 100);
        let mut seen = HashSet::new();
        for _ in 0..100_000 {
            assert!(seen.insert(layer.random_suffix()));
        }
    }

    #[test]
    fn pool_size_is_positive() {
        assert!(pool_size() >= 1);
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn send_receive_round_trip() {
        let layer = test_layer("roundtrip", 100);
        layer.send("a.channel", text_message("hello")).await.unwrap();
        let (channel, message) = layer
            .receive(&["a.channel".to_string()], false)
            .await
            .unwrap()
            .expect("a message has to be queued");
        assert_eq!(channel, "a.channel");
        assert_eq!(message.str_of("text"), Some("hello"));
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn send_fails_when_the_channel_is_full() {
        let layer = test_layer("capacity", 2);
        layer.send("full", text_message("one")).await.unwrap();
        layer.send("full", text_message("two")).await.unwrap();
        let err = layer.send("full", text_message("three")).await.unwrap_err();
        assert!(err.is_full());
        // the failed send has not grown the queue
        assert!(layer.receive(&["full".to_string()], false).await.unwrap().is_some());
        assert!(layer.receive(&["full".to_string()], false).await.unwrap().is_some());
        assert!(layer.receive(&["full".to_string()], false).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn messages_are_delivered_at_most_once() {
        let layer = test_layer("once", 100);
        layer.send("once", text_message("only")).await.unwrap();
        assert!(layer.receive(&["once".to_string()], false).await.unwrap().is_some());
        assert!(layer.receive(&["once".to_string()], false).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn new_channel_appends_a_fresh_suffix() {
        let layer = test_layer("fresh", 100);
        let channel = layer.new_channel("http.request.body?").await.unwrap();
        assert!(channel.starts_with("http.request.body?"));
        assert_eq!(channel.len(), "http.request.body?".len() + SUFFIX_LEN);
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn embedded_reply_channel_overrides_the_list_name() {
        let layer = test_layer("demux", 100);
        let shared = "weir.response.AbCdEfGhIjKl!";
        let mut message = text_message("routed");
        message.insert(
            crate::message::ASGI_CHANNEL_KEY,
            format!("{shared}suffixsuffix"),
        );
        layer.send(shared, message).await.unwrap();
        let (channel, message) = layer
            .receive(&[shared.to_string()], true)
            .await
            .unwrap()
            .expect("a message has to be queued");
        assert_eq!(channel, format!("{shared}suffixsuffix"));
        assert_eq!(message.str_of("text"), Some("routed"));
        assert_eq!(message.value(crate::message::ASGI_CHANNEL_KEY), None);
    }
}
