use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::auth::jwt;
use crate::state::AppState;

/// Query parameters for WebSocket connection. Auth is via `?token=JWT`.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: String,
}

/// 4001 = token expired, 4002 = token invalid
const CLOSE_TOKEN_EXPIRED: u16 = 4001;
const CLOSE_TOKEN_INVALID: u16 = 4002;

/// GET /ws?token=JWT
///
/// Rate-limited by client IP, then by user. On auth failure, upgrades then
/// immediately closes with the matching close code. On success the socket is
/// handed to the hub.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let ip_key = format!("ip:{}", client_ip(&headers, peer));
    // Every admitted attempt counts against the IP, authenticated or not.
    let ip_decision = state.ip_limiter.try_acquire(&ip_key);
    if !ip_decision.allowed {
        tracing::warn!(key = %ip_key, retry_after = ip_decision.retry_after_secs, "Connection attempt rate limited");
        return too_many_requests(ip_decision.retry_after_secs);
    }

    let claims = match jwt::validate_access_token(&state.jwt_secret, &params.token) {
        Ok(claims) => claims,
        Err(err) => {
            let (close_code, reason) = match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    (CLOSE_TOKEN_EXPIRED, "Token expired")
                }
                _ => (CLOSE_TOKEN_INVALID, "Token invalid"),
            };
            tracing::warn!(close_code, reason, "WebSocket auth failed");

            return ws.on_upgrade(move |mut socket| async move {
                let close_frame = CloseFrame {
                    code: close_code,
                    reason: reason.into(),
                };
                let _ = socket.send(Message::Close(Some(close_frame))).await;
            });
        }
    };

    let user_id = claims.sub;
    let user_key = format!("user:{user_id}");
    let user_decision = state.user_limiter.try_acquire(&user_key);
    if !user_decision.allowed {
        tracing::warn!(user_id = %user_id, retry_after = user_decision.retry_after_secs, "Connection attempt rate limited");
        return too_many_requests(user_decision.retry_after_secs);
    }

    tracing::info!(user_id = %user_id, "WebSocket connection authenticated");
    ws.max_message_size(state.max_frame_bytes)
        .on_upgrade(move |socket| async move {
            match state.hub.register_connection(socket, user_id).await {
                Ok(connection_id) => {
                    tracing::debug!(user_id = %user_id, connection_id = %connection_id, "Connection registered");
                }
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Connection rejected, hub is shutting down");
                }
            }
        })
}

fn too_many_requests(retry_after_secs: u64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after_secs.to_string())],
        "Too many connection attempts",
    )
        .into_response()
}

/// First X-Forwarded-For entry, then X-Real-IP, then the peer address.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    forwarded
        .or_else(real_ip)
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_client_ip_precedence() {
        let peer: SocketAddr = "10.0.0.9:5555".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, peer), "10.0.0.9");

        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.7"));
        assert_eq!(client_ip(&headers, peer), "203.0.113.7");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 198.51.100.1 , 10.1.1.1"),
        );
        assert_eq!(client_ip(&headers, peer), "198.51.100.1");
    }
}
