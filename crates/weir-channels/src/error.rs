use thiserror::Error;

/// Errors produced by the channel layer and the message codec.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The target queue is at capacity. Backpressure, not a transient fault.
    #[error("channel is full: {channel}")]
    Full { channel: String },

    #[error("redis transport error: {0}")]
    Transport(#[from] redis::RedisError),

    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("invalid channel layer configuration: {0}")]
    Config(String),

    /// The payload could not be encoded or decoded.
    #[error("malformed message: {0}")]
    Codec(String),

    #[error("timed out waiting for a message")]
    Timeout,

    /// A well-formed message that violates the channel protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl ChannelError {
    pub fn is_full(&self) -> bool {
        matches!(self, ChannelError::Full { .. })
    }
}

/// Returns true if `err` is a [`ChannelError::Full`], no matter how many
/// layers of context it has been wrapped in since.
pub fn is_channel_full(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<ChannelError>()
            .is_some_and(ChannelError::is_full)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    fn full() -> Result<(), ChannelError> {
        Err(ChannelError::Full {
            channel: "http.request".to_string(),
        })
    }

    #[test]
    fn recognizes_full_through_context_chain() {
        let err = full()
            .context("cannot send the message to the channel layer")
            .context("could not forward the request")
            .unwrap_err();
        assert!(is_channel_full(&err));
    }

    #[test]
    fn ignores_other_errors() {
        let err = anyhow::Error::from(ChannelError::Timeout).context("no reply");
        assert!(!is_channel_full(&err));
    }

    #[test]
    fn direct_check() {
        assert!(
            ChannelError::Full {
                channel: String::new()
            }
            .is_full()
        );
        assert!(!ChannelError::Timeout.is_full());
    }
}
