//! Typed views of the messages exchanged with application workers.
//!
//! The dynamic [`Message`] maps cross the wire; these structs are the edges
//! where the gateway converts to and from them. Field names and value types
//! follow the worker-facing contract exactly: header names are lowercased
//! byte strings, `client`/`server` are `[host, port]` pairs, and WebSocket
//! payloads set exactly one of `bytes`/`text`.

use rmpv::Value;

use crate::error::ChannelError;
use crate::message::Message;

/// Header list as it goes over the wire: `[[name, value], …]` byte pairs.
pub type HeaderPairs = Vec<(Vec<u8>, Vec<u8>)>;

/// A `[host, port]` pair.
pub type HostPort = (String, u16);

/// Splits `"host:port"` into a [`HostPort`], falling back to `default_port`
/// when no port is given (or it does not parse).
pub fn split_host(host: &str, default_port: u16) -> HostPort {
    if let Some((name, port)) = host.rsplit_once(':')
        && let Ok(port) = port.parse()
    {
        return (name.to_string(), port);
    }
    (host.to_string(), default_port)
}

fn headers_value(headers: HeaderPairs) -> Value {
    Value::Array(
        headers
            .into_iter()
            .map(|(name, value)| {
                Value::Array(vec![
                    Value::from(name.to_ascii_lowercase()),
                    Value::from(value),
                ])
            })
            .collect(),
    )
}

fn host_value(host: HostPort) -> Value {
    Value::Array(vec![Value::from(host.0), Value::from(u64::from(host.1))])
}

/// Accepts both `bin` and `str` encodings for a byte field; workers differ in
/// which one their MessagePack library produces.
fn bytes_like(value: Value) -> Option<Vec<u8>> {
    match value {
        Value::Binary(bytes) => Some(bytes),
        Value::String(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

fn take_bytes(message: &mut Message, key: &str) -> Result<Vec<u8>, ChannelError> {
    match message.remove(key) {
        None | Some(Value::Nil) => Ok(Vec::new()),
        Some(value) => bytes_like(value).ok_or_else(|| {
            ChannelError::Codec(format!("\"{key}\" has to be a byte string or nil"))
        }),
    }
}

fn take_bool(message: &mut Message, key: &str) -> Result<bool, ChannelError> {
    match message.remove(key) {
        Some(Value::Boolean(b)) => Ok(b),
        other => Err(ChannelError::Codec(format!(
            "\"{key}\" has to be a bool, not {other:?}"
        ))),
    }
}

fn take_headers(message: &mut Message, key: &str) -> Result<HeaderPairs, ChannelError> {
    let Some(Value::Array(entries)) = message.remove(key) else {
        return Err(ChannelError::Codec(format!(
            "\"{key}\" has to be a list of header pairs"
        )));
    };
    entries
        .into_iter()
        .map(|entry| {
            let Value::Array(pair) = entry else {
                return Err(ChannelError::Codec(format!(
                    "\"{key}\" entries have to be [name, value] pairs"
                )));
            };
            let mut pair = pair.into_iter();
            match (pair.next().and_then(bytes_like), pair.next().and_then(bytes_like)) {
                (Some(name), Some(value)) => Ok((name, value)),
                _ => Err(ChannelError::Codec(format!(
                    "\"{key}\" entries have to be [name, value] byte pairs"
                ))),
            }
        })
        .collect()
}

/// One HTTP request, forwarded to workers on the `http.request` channel.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub reply_channel: String,
    pub http_version: String,
    pub method: String,
    pub scheme: String,
    pub path: String,
    pub query_string: Vec<u8>,
    pub root_path: String,
    pub headers: HeaderPairs,
    pub body: Vec<u8>,
    pub body_channel: String,
    pub client: HostPort,
    pub server: HostPort,
}

impl HttpRequest {
    pub fn into_message(self) -> Message {
        let mut m = Message::new();
        m.insert("reply_channel", self.reply_channel);
        m.insert("http_version", self.http_version);
        m.insert("method", self.method);
        m.insert("scheme", self.scheme);
        m.insert("path", self.path);
        m.insert("query_string", self.query_string);
        m.insert("root_path", self.root_path);
        m.insert("headers", headers_value(self.headers));
        m.insert("body", self.body);
        m.insert("body_channel", self.body_channel);
        m.insert("client", host_value(self.client));
        m.insert("server", host_value(self.server));
        m
    }
}

/// A follow-up chunk of a request body, sent on the request's body channel.
#[derive(Debug, Clone)]
pub struct HttpBodyChunk {
    pub content: Vec<u8>,
    pub closed: bool,
    pub more_content: bool,
}

impl HttpBodyChunk {
    pub fn into_message(self) -> Message {
        let mut m = Message::new();
        m.insert("content", self.content);
        m.insert("closed", self.closed);
        m.insert("more_content", self.more_content);
        m
    }
}

/// The first worker reply on an HTTP reply channel.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderPairs,
    pub content: Vec<u8>,
    pub more_content: bool,
}

impl HttpResponse {
    pub fn from_message(mut message: Message) -> Result<Self, ChannelError> {
        let status = match message.remove("status") {
            Some(Value::Integer(i)) => i
                .as_u64()
                .and_then(|status| u16::try_from(status).ok())
                .ok_or_else(|| {
                    ChannelError::Codec("\"status\" is out of range".to_string())
                })?,
            other => {
                return Err(ChannelError::Codec(format!(
                    "\"status\" has to be an unsigned integer, not {other:?}"
                )));
            }
        };
        Ok(Self {
            status,
            headers: take_headers(&mut message, "headers")?,
            content: take_bytes(&mut message, "content")?,
            more_content: take_bool(&mut message, "more_content")?,
        })
    }
}

/// A follow-up response fragment, after an `HttpResponse` with `more_content`.
#[derive(Debug, Clone)]
pub struct HttpResponseChunk {
    pub content: Vec<u8>,
    pub more_content: bool,
}

impl HttpResponseChunk {
    pub fn from_message(mut message: Message) -> Result<Self, ChannelError> {
        Ok(Self {
            content: take_bytes(&mut message, "content")?,
            more_content: take_bool(&mut message, "more_content")?,
        })
    }
}

/// The WebSocket handshake, forwarded on `websocket.connect`.
#[derive(Debug, Clone)]
pub struct WsConnect {
    pub reply_channel: String,
    pub scheme: String,
    pub path: String,
    pub query_string: Vec<u8>,
    pub root_path: String,
    pub headers: HeaderPairs,
    pub client: HostPort,
    pub server: HostPort,
}

impl WsConnect {
    pub fn into_message(self) -> Message {
        let mut m = Message::new();
        m.insert("reply_channel", self.reply_channel);
        m.insert("scheme", self.scheme);
        m.insert("path", self.path);
        m.insert("query_string", self.query_string);
        m.insert("root_path", self.root_path);
        m.insert("headers", headers_value(self.headers));
        m.insert("client", host_value(self.client));
        m.insert("server", host_value(self.server));
        m.insert("order", 0);
        m
    }
}

/// One data frame, either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// A frame received from the client, forwarded on `websocket.receive`.
/// Exactly one of `bytes`/`text` is set on the wire, the other is nil.
#[derive(Debug, Clone)]
pub struct WsReceive {
    pub reply_channel: String,
    pub path: String,
    pub frame: Frame,
    pub order: i64,
}

impl WsReceive {
    pub fn into_message(self) -> Message {
        let mut m = Message::new();
        m.insert("reply_channel", self.reply_channel);
        m.insert("path", self.path);
        match self.frame {
            Frame::Text(text) => {
                m.insert("bytes", Value::Nil);
                m.insert("text", text);
            }
            Frame::Binary(bytes) => {
                m.insert("bytes", bytes);
                m.insert("text", Value::Nil);
            }
        }
        m.insert("order", self.order);
        m
    }
}

/// The goodbye on `websocket.disconnect` after a socket goes away.
#[derive(Debug, Clone)]
pub struct WsDisconnect {
    pub reply_channel: String,
    pub code: u16,
    pub path: String,
    pub order: i64,
}

impl WsDisconnect {
    pub fn into_message(self) -> Message {
        let mut m = Message::new();
        m.insert("reply_channel", self.reply_channel);
        m.insert("code", u64::from(self.code));
        m.insert("path", self.path);
        m.insert("order", self.order);
        m
    }
}

/// A worker's reply on a WebSocket reply channel: data to send, an order to
/// close, an accept after the handshake, or a combination.
///
/// `close` is normalized: `false` and nil mean "do not close" (0), `true`
/// means close with the default code 1000, an integer is used as-is.
#[derive(Debug, Clone, Default)]
pub struct SendCloseAccept {
    pub bytes: Option<Vec<u8>>,
    pub text: Option<String>,
    pub close: u16,
    pub accept: bool,
}

impl SendCloseAccept {
    /// The reply an accepted-but-silent handshake behaves like.
    pub fn accepted() -> Self {
        Self {
            accept: true,
            ..Self::default()
        }
    }

    pub fn from_message(mut message: Message) -> Result<Self, ChannelError> {
        let bytes = match message.remove("bytes") {
            None | Some(Value::Nil) => None,
            Some(Value::Binary(bytes)) => Some(bytes),
            Some(other) => {
                return Err(ChannelError::Codec(format!(
                    "\"bytes\" has to be a byte string or nil, not {other}"
                )));
            }
        };
        let text = match message.remove("text") {
            None | Some(Value::Nil) => None,
            Some(Value::String(s)) => match s.into_str() {
                Some(text) if text.is_empty() => None,
                Some(text) => Some(text),
                None => {
                    return Err(ChannelError::Codec(
                        "\"text\" is not valid utf-8".to_string(),
                    ));
                }
            },
            Some(other) => {
                return Err(ChannelError::Codec(format!(
                    "\"text\" has to be a string or nil, not {other}"
                )));
            }
        };
        if bytes.is_some() && text.is_some() {
            return Err(ChannelError::Protocol(
                "only one of the fields text and bytes can be set at once".to_string(),
            ));
        }
        let close = match message.remove("close") {
            None | Some(Value::Nil) | Some(Value::Boolean(false)) => 0,
            Some(Value::Boolean(true)) => 1000,
            Some(Value::Integer(i)) => i
                .as_u64()
                .and_then(|code| u16::try_from(code).ok())
                .ok_or_else(|| {
                    ChannelError::Codec("\"close\" is out of range".to_string())
                })?,
            Some(other) => {
                return Err(ChannelError::Codec(format!(
                    "\"close\" has to be a bool, an integer or nil, not {other}"
                )));
            }
        };
        let accept = match message.remove("accept") {
            None | Some(Value::Nil) => false,
            Some(Value::Boolean(accept)) => accept,
            Some(other) => {
                return Err(ChannelError::Codec(format!(
                    "\"accept\" has to be a bool or nil, not {other}"
                )));
            }
        };
        Ok(Self {
            bytes,
            text,
            close,
            accept,
        })
    }

    /// True when every field is unset. A reply like this is meaningless and
    /// treated as a protocol violation by the caller.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_none() && self.text.is_none() && self.close == 0 && !self.accept
    }

    /// The data frame to send, if any.
    pub fn frame(&self) -> Option<Frame> {
        if let Some(text) = &self.text {
            Some(Frame::Text(text.clone()))
        } else {
            self.bytes.clone().map(Frame::Binary)
        }
    }
}
