//! Forwards one HTTP request to the channel layer and assembles the response.
//!
//! The request becomes an `http.request` message with up to 500 KiB of body
//! inline; longer bodies continue as `http.request.body` chunks on their own
//! channel. The worker's reply comes back on a per-request reply channel and
//! may arrive in several fragments, each under its own 30 second deadline.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::body::Body;
use axum::extract::Request;
use axum::http::request::Parts;
use axum::http::{HeaderName, HeaderValue, StatusCode, Version};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tracing::{debug, warn};
use weir_channels::ChannelError;
use weir_channels::schema::{
    HostPort, HttpBodyChunk, HttpRequest, HttpResponse, HttpResponseChunk, split_host,
};

use crate::receiver::ReplyWaiter;
use crate::state::AppState;

/// How much request body goes out per message.
const BODY_CHUNK_SIZE: usize = 500 * 1024;

/// How long to wait for each response fragment.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn handle(state: &AppState, client: SocketAddr, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();

    let reply_channel = state
        .channels
        .new_channel(state.replies.channel_prefix())
        .await
        .context("cannot create a reply channel")?;
    let waiter = state.replies.register(reply_channel.clone());

    let mut body = BodyReader::new(body.into_data_stream());
    let (first_chunk, eof) = body.next_chunk().await?;
    let body_channel = if eof {
        String::new()
    } else {
        state
            .channels
            .new_channel("http.request.body?")
            .await
            .context("cannot create a body channel")?
    };

    let message = request_message(&parts, client, reply_channel, first_chunk, body_channel.clone());
    state
        .channels
        .send("http.request", message.into_message())
        .await
        .context("cannot send the request to the channel layer")?;

    if !body_channel.is_empty() {
        forward_body(state, &body_channel, &mut body).await?;
    }

    respond(waiter).await
}

fn request_message(
    parts: &Parts,
    client: SocketAddr,
    reply_channel: String,
    body: Bytes,
    body_channel: String,
) -> HttpRequest {
    let scheme = parts.uri.scheme_str().unwrap_or("http");
    HttpRequest {
        reply_channel,
        http_version: version_str(parts.version).to_string(),
        method: parts.method.as_str().to_string(),
        scheme: scheme.to_string(),
        path: parts.uri.path().to_string(),
        query_string: parts.uri.query().unwrap_or("").as_bytes().to_vec(),
        root_path: String::new(),
        headers: header_pairs(parts),
        body: body.to_vec(),
        body_channel,
        client: (client.ip().to_string(), client.port()),
        server: server_host(parts, scheme),
    }
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => "1.1",
    }
}

pub(super) fn header_pairs(parts: &Parts) -> Vec<(Vec<u8>, Vec<u8>)> {
    parts
        .headers
        .iter()
        .map(|(name, value)| (name.as_str().as_bytes().to_vec(), value.as_bytes().to_vec()))
        .collect()
}

/// The `[host, port]` pair workers see as `server`. Ports come from the Host
/// header; without an explicit one, TLS requests count as 443, the rest as 80.
pub(super) fn server_host(parts: &Parts, scheme: &str) -> HostPort {
    let host = parts
        .headers
        .get(axum::http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let default_port = if scheme == "https" || scheme == "wss" {
        443
    } else {
        80
    };
    split_host(host, default_port)
}

async fn forward_body<S>(state: &AppState, channel: &str, body: &mut BodyReader<S>) -> Result<()>
where
    S: Stream<Item = Result<Bytes, axum::Error>> + Unpin,
{
    loop {
        let (content, eof) = body.next_chunk().await?;
        let chunk = HttpBodyChunk {
            content: content.to_vec(),
            closed: false,
            more_content: !eof,
        };
        super::send_retrying(state.channels.as_ref(), channel, chunk.into_message())
            .await
            .context("cannot send a body chunk to the channel layer")?;
        if eof {
            return Ok(());
        }
    }
}

async fn respond(mut waiter: ReplyWaiter) -> Result<Response> {
    let first = match waiter.recv(RESPONSE_TIMEOUT).await {
        Ok(message) => message,
        Err(ChannelError::Timeout) => bail!("did not get a response in time"),
        Err(err) => return Err(err).context("cannot receive the response"),
    };
    let response = HttpResponse::from_message(first).context("malformed http.response message")?;

    let mut builder =
        Response::builder().status(StatusCode::from_u16(response.status).context("invalid response status")?);
    for (name, value) in &response.headers {
        builder = builder.header(
            HeaderName::from_bytes(name).context("invalid response header name")?,
            HeaderValue::from_bytes(value).context("invalid response header value")?,
        );
    }

    if !response.more_content {
        return builder
            .body(Body::from(response.content))
            .context("cannot build the response");
    }

    let stream = futures::stream::unfold(
        ChunkState {
            waiter,
            pending: Some(response.content),
            done: false,
        },
        next_fragment,
    );
    builder
        .body(Body::from_stream(stream))
        .context("cannot build the response")
}

struct ChunkState {
    waiter: ReplyWaiter,
    pending: Option<Vec<u8>>,
    done: bool,
}

/// Yields the buffered first fragment, then one `http.response.chunk` per
/// call. A fragment timing out mid-stream aborts the connection without an
/// error page; the client already has the status line.
async fn next_fragment(mut state: ChunkState) -> Option<(Result<Bytes, io::Error>, ChunkState)> {
    if let Some(pending) = state.pending.take()
        && !pending.is_empty()
    {
        return Some((Ok(Bytes::from(pending)), state));
    }
    loop {
        if state.done {
            return None;
        }
        match state.waiter.recv(RESPONSE_TIMEOUT).await {
            Ok(message) => match HttpResponseChunk::from_message(message) {
                Ok(chunk) => {
                    state.done = !chunk.more_content;
                    if chunk.content.is_empty() {
                        continue;
                    }
                    return Some((Ok(Bytes::from(chunk.content)), state));
                }
                Err(err) => {
                    warn!(%err, "malformed http.response.chunk, aborting the response");
                    state.done = true;
                    return Some((Err(io::Error::other(err)), state));
                }
            },
            Err(ChannelError::Timeout) => {
                debug!("response fragment timed out, closing the connection");
                state.done = true;
                return Some((
                    Err(io::Error::new(io::ErrorKind::TimedOut, "response fragment timed out")),
                    state,
                ));
            }
            Err(err) => {
                state.done = true;
                return Some((Err(io::Error::other(err)), state));
            }
        }
    }
}

/// Pulls a body stream in chunks of at most [`BODY_CHUNK_SIZE`] bytes.
struct BodyReader<S> {
    stream: S,
    buffer: BytesMut,
    exhausted: bool,
}

impl<S> BodyReader<S>
where
    S: Stream<Item = Result<Bytes, axum::Error>> + Unpin,
{
    fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
            exhausted: false,
        }
    }

    /// The next chunk, plus whether the body ends with it.
    async fn next_chunk(&mut self) -> Result<(Bytes, bool)> {
        while !self.exhausted && self.buffer.len() < BODY_CHUNK_SIZE {
            match self.stream.next().await {
                Some(frame) => self
                    .buffer
                    .extend_from_slice(&frame.context("cannot read the request body")?),
                None => self.exhausted = true,
            }
        }
        if self.buffer.len() > BODY_CHUNK_SIZE
            || (!self.exhausted && self.buffer.len() == BODY_CHUNK_SIZE)
        {
            Ok((self.buffer.split_to(BODY_CHUNK_SIZE).freeze(), false))
        } else {
            Ok((std::mem::take(&mut self.buffer).freeze(), true))
        }
    }
}
