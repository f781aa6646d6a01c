//! Bearer-token authentication. Resolves the caller's token, enforces its
//! status/expiry/balance, and deposits the request-context hints the
//! pipeline consumes. The hints beyond the token itself are trusted inputs:
//! only administrators can steer a call to a specific channel or override
//! URLs.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::RelayError;
use crate::model::{ChannelId, Token, TokenStatus};
use crate::AppState;

/// Context deposited by authentication for the relay pipeline.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub token: Token,
    pub group: String,
    /// Raw bearer string; the `ignore` forwarding rule keys off it.
    pub bearer: String,
    /// Admin-specified channel for this call, bypassing selection.
    pub specified_channel: Option<ChannelId>,
    pub base_url: Option<String>,
    pub full_url: Option<String>,
    pub library_id: Option<String>,
    pub async_num: Option<u32>,
}

/// `sk-key:42` pins the call to channel 42 (admins only).
fn split_channel_suffix(bearer: &str) -> (&str, Option<ChannelId>) {
    match bearer.rsplit_once(':') {
        Some((key, id)) => match id.parse() {
            Ok(id) => (key, Some(id)),
            Err(_) => (bearer, None),
        },
        None => (bearer, None),
    }
}

fn admin_header(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

pub async fn bearer_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let bearer = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start_matches("Bearer ").trim().to_string())
        .unwrap_or_default();
    if bearer.is_empty() {
        return RelayError::Unauthorized("no token provided".to_string()).into_response();
    }

    let (key, specified_channel) = split_channel_suffix(&bearer);
    let token = match state.store.token_by_key(key).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            return RelayError::Unauthorized("token is unknown".to_string()).into_response()
        }
        Err(e) => return e.into_response(),
    };

    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    if let Err(status) = token.is_usable(now) {
        let reason = match status {
            TokenStatus::Disabled => "token is disabled",
            TokenStatus::Expired => "token has expired",
            TokenStatus::Exhausted => "token quota is exhausted",
            TokenStatus::Enabled => unreachable!("enabled tokens are usable"),
        };
        return RelayError::Unauthorized(reason.to_string()).into_response();
    }

    let user = match state.store.user(token.user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return RelayError::Unauthorized("token owner is gone".to_string()).into_response()
        }
        Err(e) => return e.into_response(),
    };

    let mut ctx = AuthContext {
        group: user.group.clone(),
        bearer: bearer.clone(),
        specified_channel: None,
        base_url: None,
        full_url: None,
        library_id: None,
        async_num: None,
        token,
    };
    if user.is_admin {
        ctx.specified_channel = specified_channel;
        ctx.base_url = admin_header(&req, "x-relay-base-url");
        ctx.full_url = admin_header(&req, "x-relay-full-url");
        ctx.library_id = admin_header(&req, "x-relay-library-id");
        ctx.async_num = admin_header(&req, "x-relay-async-num").and_then(|v| v.parse().ok());
    }

    req.extensions_mut().insert(ctx);
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_suffix_parsing() {
        assert_eq!(split_channel_suffix("sk-abc"), ("sk-abc", None));
        assert_eq!(split_channel_suffix("sk-abc:42"), ("sk-abc", Some(42)));
        // a non-numeric suffix is part of the key
        assert_eq!(split_channel_suffix("sk-abc:def"), ("sk-abc:def", None));
    }
}
