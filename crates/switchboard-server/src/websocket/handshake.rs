//! Connection approval before the upgrade.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::http::HeaderMap;
use switchboard_core::AcceptError;

use crate::session::HandshakeInfo;

/// Header carrying a caller-asserted user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Decides whether an upgrade request may become a session.
///
/// Rejection means the session is never registered and the client gets a
/// 401 response instead of an upgrade.
#[async_trait]
pub trait HandshakeAuthorizer: Send + Sync {
    /// Approve or reject a connection on `path`.
    async fn authorize(
        &self,
        path: &str,
        headers: &HeaderMap,
        remote_addr: Option<SocketAddr>,
    ) -> Result<HandshakeInfo, AcceptError>;
}

/// Accepts everyone. Passes an `x-user-id` header through as the user id.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnonymousAuthorizer;

#[async_trait]
impl HandshakeAuthorizer for AnonymousAuthorizer {
    async fn authorize(
        &self,
        _path: &str,
        headers: &HeaderMap,
        remote_addr: Option<SocketAddr>,
    ) -> Result<HandshakeInfo, AcceptError> {
        Ok(HandshakeInfo {
            remote_addr,
            user_id: user_id_from(headers),
        })
    }
}

/// Requires a non-empty `x-user-id` header.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequireUserAuthorizer;

#[async_trait]
impl HandshakeAuthorizer for RequireUserAuthorizer {
    async fn authorize(
        &self,
        _path: &str,
        headers: &HeaderMap,
        remote_addr: Option<SocketAddr>,
    ) -> Result<HandshakeInfo, AcceptError> {
        let user_id = user_id_from(headers)
            .ok_or_else(|| AcceptError::Rejected(format!("missing {USER_ID_HEADER} header")))?;
        Ok(HandshakeInfo {
            remote_addr,
            user_id: Some(user_id),
        })
    }
}

fn user_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}
