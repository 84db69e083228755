//! The wire form of channel layer messages.
//!
//! Messages are string-keyed maps of dynamically typed values, encoded as
//! self-describing MessagePack. The codec keeps the distinction between byte
//! strings and UTF-8 strings intact, because workers rely on it (header values
//! are bytes, channel names are text).

use std::collections::BTreeMap;

pub use rmpv::Value;

use crate::error::ChannelError;

/// Key a worker-side channel layer embeds into a message when it routes a
/// reply channel through a shared list key. Stripped on decode.
pub const ASGI_CHANNEL_KEY: &str = "__asgi_channel__";

/// A channel layer message: a map from short string keys to dynamic values.
///
/// Equality ignores the order keys were inserted in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message(BTreeMap<String, Value>);

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn str_of(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(Value::String(s)) => s.as_str(),
            _ => None,
        }
    }

    pub fn bytes_of(&self, key: &str) -> Option<&[u8]> {
        match self.0.get(key) {
            Some(Value::Binary(b)) => Some(b),
            _ => None,
        }
    }

    pub fn int_of(&self, key: &str) -> Option<i64> {
        match self.0.get(key) {
            Some(Value::Integer(i)) => i.as_i64(),
            _ => None,
        }
    }

    pub fn bool_of(&self, key: &str) -> Option<bool> {
        match self.0.get(key) {
            Some(Value::Boolean(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn into_value(self) -> Value {
        Value::Map(
            self.0
                .into_iter()
                .map(|(key, value)| (Value::from(key), value))
                .collect(),
        )
    }

    /// Builds a message from a decoded MessagePack value. The top level has to
    /// be a map with string keys.
    pub fn from_value(value: Value) -> Result<Self, ChannelError> {
        let Value::Map(entries) = value else {
            return Err(ChannelError::Codec(format!(
                "message has to be a map, not {value}"
            )));
        };
        let mut map = BTreeMap::new();
        for (key, value) in entries {
            let Value::String(key) = key else {
                return Err(ChannelError::Codec(format!(
                    "message keys have to be strings, not {key}"
                )));
            };
            let Some(key) = key.into_str() else {
                return Err(ChannelError::Codec(
                    "message key is not valid utf-8".to_string(),
                ));
            };
            map.insert(key, value);
        }
        Ok(Self(map))
    }
}

/// Encodes a message to its MessagePack wire form.
pub fn encode(message: Message) -> Result<Vec<u8>, ChannelError> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &message.into_value())
        .map_err(|err| ChannelError::Codec(format!("cannot encode message: {err}")))?;
    Ok(buf)
}

/// Decodes a MessagePack blob into a message. If the message carries an
/// embedded reply channel name under [`ASGI_CHANNEL_KEY`], it is stripped from
/// the map and returned separately.
pub fn decode(bytes: &[u8]) -> Result<(Message, Option<String>), ChannelError> {
    let value = rmpv::decode::read_value(&mut &*bytes)
        .map_err(|err| ChannelError::Codec(format!("cannot decode message: {err}")))?;
    let mut message = Message::from_value(value)?;
    let channel = match message.remove(ASGI_CHANNEL_KEY) {
        None => None,
        Some(Value::String(s)) => match s.into_str() {
            Some(s) => Some(s),
            None => {
                return Err(ChannelError::Codec(format!(
                    "{ASGI_CHANNEL_KEY} is not valid utf-8"
                )));
            }
        },
        Some(other) => {
            return Err(ChannelError::Codec(format!(
                "{ASGI_CHANNEL_KEY} has to be a string, not {other}"
            )));
        }
    };
    Ok((message, channel))
}
