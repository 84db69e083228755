//! Bridges one WebSocket to the channel layer.
//!
//! The handshake goes out as `websocket.connect`; the worker's
//! send/close/accept reply decides whether the connection is upgraded,
//! refused with 403, or failed. After the upgrade the bridge pumps frames in
//! both directions: client frames become `websocket.receive` messages stamped
//! with a strictly increasing order, worker replies become frames on the
//! socket. When either side goes away the worker gets a
//! `websocket.disconnect` with the close code.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::extract::ws::{CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error, warn};
use weir_channels::ChannelError;
use weir_channels::schema::{Frame, SendCloseAccept, WsConnect, WsDisconnect, WsReceive};

use crate::receiver::ReplyWaiter;
use crate::state::AppState;

/// How long the worker gets to answer a `websocket.connect`.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Close code reported when the client vanished without a close frame.
const CODE_ABNORMAL: u16 = 1006;

/// Close code sent when the channel layer pushes back.
const CODE_TRY_AGAIN_LATER: u16 = 1013;

pub async fn handle(
    state: &AppState,
    client: SocketAddr,
    upgrade: WebSocketUpgrade,
    parts: Parts,
) -> Result<Response> {
    let channel = state
        .channels
        .new_channel(state.replies.channel_prefix())
        .await
        .context("cannot create a reply channel for the websocket connection")?;
    let mut waiter = state.replies.register(channel.clone());

    let connect = connect_message(&parts, client, channel.clone());
    state
        .channels
        .send("websocket.connect", connect.into_message())
        .await
        .context("cannot send websocket.connect to the channel layer")?;

    let reply = match waiter.recv(ACCEPT_TIMEOUT).await {
        Ok(message) => SendCloseAccept::from_message(message)
            .context("malformed send/close/accept reply")?,
        // a silent worker still gets the socket opened: clients reconnect
        // without waiting for the application
        Err(ChannelError::Timeout) => SendCloseAccept::accepted(),
        Err(err) => return Err(err).context("cannot receive the websocket accept reply"),
    };

    match decide(&reply) {
        Decision::Open => {
            let path = parts.uri.path().to_string();
            let state = state.clone();
            Ok(upgrade
                .on_upgrade(move |socket| bridge(state, socket, channel, waiter, path, reply)))
        }
        Decision::Refuse => Ok(StatusCode::FORBIDDEN.into_response()),
        Decision::Invalid => bail!("got a send/close/accept message with all fields set to nil"),
    }
}

#[derive(Debug, PartialEq)]
enum Decision {
    /// Upgrade; any payload in the reply becomes the first frame.
    Open,
    /// The worker refused the connection: answer 403, never upgrade.
    Refuse,
    /// A reply with nothing in it is a protocol violation.
    Invalid,
}

fn decide(reply: &SendCloseAccept) -> Decision {
    if reply.accept || reply.frame().is_some() {
        Decision::Open
    } else if reply.close != 0 {
        Decision::Refuse
    } else {
        Decision::Invalid
    }
}

fn connect_message(parts: &Parts, client: SocketAddr, reply_channel: String) -> WsConnect {
    WsConnect {
        reply_channel,
        scheme: "ws".to_string(),
        path: parts.uri.path().to_string(),
        query_string: parts.uri.query().unwrap_or("").as_bytes().to_vec(),
        root_path: String::new(),
        headers: super::http::header_pairs(parts),
        client: (client.ip().to_string(), client.port()),
        server: super::http::server_host(parts, "ws"),
    }
}

async fn bridge(
    state: AppState,
    mut socket: WebSocket,
    channel: String,
    mut waiter: ReplyWaiter,
    path: String,
    accept: SendCloseAccept,
) {
    let mut order: i64 = 0;
    let close_code = pump(
        &state,
        &mut socket,
        &channel,
        &path,
        &mut order,
        accept,
        &mut waiter,
    )
    .await;

    order += 1;
    let disconnect = WsDisconnect {
        reply_channel: channel.clone(),
        code: close_code,
        path,
        order,
    };
    if let Err(err) = state
        .channels
        .send("websocket.disconnect", disconnect.into_message())
        .await
    {
        warn!(%err, %channel, "cannot send websocket.disconnect");
    }
}

/// Runs the two-way pump until the connection ends, returning the close code
/// to report to the worker.
async fn pump(
    state: &AppState,
    socket: &mut WebSocket,
    channel: &str,
    path: &str,
    order: &mut i64,
    accept: SendCloseAccept,
    waiter: &mut ReplyWaiter,
) -> u16 {
    if let Some(frame) = accept.frame()
        && send_frame(socket, frame).await.is_err()
    {
        return CODE_ABNORMAL;
    }
    if accept.close != 0 {
        // close right after the handshake, but keep reading so the client
        // can acknowledge with its own close frame
        let _ = socket
            .send(WsMessage::Close(Some(CloseFrame {
                code: accept.close,
                reason: Utf8Bytes::default(),
            })))
            .await;
    }

    loop {
        tokio::select! {
            frame = socket.recv() => match frame {
                Some(Ok(frame)) => match classify(frame) {
                    Incoming::Data(data) => {
                        *order += 1;
                        let receive = WsReceive {
                            reply_channel: channel.to_string(),
                            path: path.to_string(),
                            frame: data,
                            order: *order,
                        };
                        let sent = super::send_retrying(
                            state.channels.as_ref(),
                            "websocket.receive",
                            receive.into_message(),
                        )
                        .await;
                        match sent {
                            Ok(()) => {}
                            Err(err) if err.is_full() => {
                                warn!(channel, "channel layer is full, closing the websocket");
                                let _ = socket
                                    .send(WsMessage::Close(Some(CloseFrame {
                                        code: CODE_TRY_AGAIN_LATER,
                                        reason: "try again later".into(),
                                    })))
                                    .await;
                                return CODE_ABNORMAL;
                            }
                            Err(err) => {
                                error!(%err, "cannot forward a websocket frame");
                                return CODE_ABNORMAL;
                            }
                        }
                    }
                    Incoming::Close(code) => return code,
                    Incoming::Control => {}
                },
                Some(Err(err)) => {
                    debug!(%err, "websocket read failed");
                    return CODE_ABNORMAL;
                }
                None => return CODE_ABNORMAL,
            },
            reply = waiter.next() => match reply {
                Some(message) => match SendCloseAccept::from_message(message) {
                    Ok(reply) => {
                        if let Some(frame) = reply.frame()
                            && send_frame(socket, frame).await.is_err()
                        {
                            return CODE_ABNORMAL;
                        }
                        if reply.close != 0 {
                            let _ = socket
                                .send(WsMessage::Close(Some(CloseFrame {
                                    code: reply.close,
                                    reason: Utf8Bytes::default(),
                                })))
                                .await;
                            return reply.close;
                        }
                        // a reply with neither payload nor close is skipped
                    }
                    Err(err) => warn!(%err, "dropping a malformed message from the channel layer"),
                },
                None => return CODE_ABNORMAL,
            },
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: Frame) -> Result<(), axum::Error> {
    match frame {
        Frame::Text(text) => socket.send(WsMessage::Text(text.into())).await,
        Frame::Binary(bytes) => socket.send(WsMessage::Binary(bytes.into())).await,
    }
}

#[derive(Debug, PartialEq)]
enum Incoming {
    Data(Frame),
    Close(u16),
    Control,
}

fn classify(message: WsMessage) -> Incoming {
    match message {
        WsMessage::Text(text) => Incoming::Data(Frame::Text(text.as_str().to_string())),
        WsMessage::Binary(bytes) => Incoming::Data(Frame::Binary(bytes.to_vec())),
        WsMessage::Close(frame) => Incoming::Close(frame.map_or(CODE_ABNORMAL, |f| f.code)),
        WsMessage::Ping(_) | WsMessage::Pong(_) => Incoming::Control,
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Request as HttpRequestBuilder;

    use super::*;

    fn reply(
        bytes: Option<Vec<u8>>,
        text: Option<String>,
        close: u16,
        accept: bool,
    ) -> SendCloseAccept {
        SendCloseAccept {
            bytes,
            text,
            close,
            accept,
        }
    }

    #[test]
    fn accept_or_payload_opens_the_connection() {
        assert_eq!(decide(&reply(None, None, 0, true)), Decision::Open);
        assert_eq!(
            decide(&reply(None, Some("hi".to_string()), 0, false)),
            Decision::Open
        );
        assert_eq!(decide(&reply(Some(vec![1]), None, 0, false)), Decision::Open);
        // payload plus close: open, send, then close
        assert_eq!(
            decide(&reply(None, Some("bye".to_string()), 1000, false)),
            Decision::Open
        );
    }

    #[test]
    fn close_alone_refuses_the_connection() {
        assert_eq!(decide(&reply(None, None, 1000, false)), Decision::Refuse);
        assert_eq!(decide(&reply(None, None, 4403, false)), Decision::Refuse);
    }

    #[test]
    fn an_empty_reply_is_invalid() {
        assert_eq!(decide(&reply(None, None, 0, false)), Decision::Invalid);
    }

    #[test]
    fn classifies_client_frames() {
        assert_eq!(
            classify(WsMessage::Text("hi".into())),
            Incoming::Data(Frame::Text("hi".to_string()))
        );
        assert_eq!(
            classify(WsMessage::Binary(vec![1, 2].into())),
            Incoming::Data(Frame::Binary(vec![1, 2]))
        );
        assert_eq!(
            classify(WsMessage::Close(Some(CloseFrame {
                code: 1000,
                reason: Utf8Bytes::default(),
            }))),
            Incoming::Close(1000)
        );
        assert_eq!(classify(WsMessage::Close(None)), Incoming::Close(1006));
        assert_eq!(classify(WsMessage::Ping(vec![].into())), Incoming::Control);
    }

    #[test]
    fn connect_message_carries_order_zero() {
        let parts = HttpRequestBuilder::builder()
            .uri("/chat?room=1")
            .header("Host", "localhost:8000")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        let client: SocketAddr = "127.0.0.1:51000".parse().unwrap();
        let message =
            connect_message(&parts, client, "weir.response.abc!def".to_string()).into_message();
        assert_eq!(message.int_of("order"), Some(0));
        assert_eq!(message.str_of("scheme"), Some("ws"));
        assert_eq!(message.str_of("path"), Some("/chat"));
        assert_eq!(message.bytes_of("query_string"), Some(&b"room=1"[..]));
    }
}
