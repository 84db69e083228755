//! Per-connection entry point.
//!
//! Every request not claimed by a static mount lands here. Requests that
//! negotiate a WebSocket upgrade go to the bridge, everything else to the
//! HTTP forwarder. Errors escaping either path are logged and answered with
//! a sanitized 500 unless the server runs with `--debug`.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::error;
use weir_channels::{ChannelError, ChannelLayer, Message, is_channel_full};

use crate::state::AppState;

pub mod http;
pub mod websocket;

pub async fn dispatch(
    State(state): State<AppState>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let result = if wants_websocket(&request) {
        let (mut parts, _body) = request.into_parts();
        match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(upgrade) => websocket::handle(&state, client, upgrade, parts).await,
            Err(rejection) => return rejection.into_response(),
        }
    } else {
        http::handle(&state, client, request).await
    };
    result.unwrap_or_else(|err| error_response(&state, err))
}

fn wants_websocket(request: &Request) -> bool {
    request
        .headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

fn error_response(state: &AppState, err: anyhow::Error) -> Response {
    if is_channel_full(&err) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "channel layer is at capacity\n",
        )
            .into_response();
    }
    error!(err = format!("{err:#}"), "request failed");
    let body = if state.debug {
        format!("{err:#}\n")
    } else {
        "internal server error\n".to_string()
    };
    (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
}

/// How often a subordinate send is retried when its channel is full.
const SEND_RETRIES: usize = 1000;
const SEND_BACKOFF: Duration = Duration::from_millis(100);

/// Sends with a bounded retry on backpressure. Primary worker-facing sends
/// must not use this: a full `http.request` or `websocket.connect` queue is
/// answered with 503 right away.
pub(crate) async fn send_retrying(
    channels: &dyn ChannelLayer,
    channel: &str,
    message: Message,
) -> Result<(), ChannelError> {
    let mut attempt = 0;
    loop {
        match channels.send(channel, message.clone()).await {
            Err(err) if err.is_full() && attempt < SEND_RETRIES => {
                attempt += 1;
                tokio::time::sleep(SEND_BACKOFF).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;

    use crate::receiver::ReplyRouter;
    use crate::testutil::ScriptedLayer;

    use super::*;

    #[tokio::test]
    async fn a_full_request_channel_becomes_503() {
        let layer = ScriptedLayer::full(vec!["http.request".to_string()]);
        let router = ReplyRouter::spawn(layer.clone()).await.unwrap();
        let state = AppState {
            channels: layer,
            replies: router,
            debug: false,
        };
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let client: SocketAddr = "10.0.0.9:40000".parse().unwrap();

        let response = dispatch(State(state), ConnectInfo(client), request).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn error_bodies_are_sanitized_unless_debug() {
        let layer = ScriptedLayer::new(vec![]);
        let router = ReplyRouter::spawn(layer.clone()).await.unwrap();
        let mut state = AppState {
            channels: layer,
            replies: router,
            debug: false,
        };

        let response = error_response(&state, anyhow::anyhow!("secret detail"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"internal server error\n");

        state.debug = true;
        let response = error_response(&state, anyhow::anyhow!("secret detail"));
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&body).contains("secret detail"));
    }
}
