//! Request extractors

use crate::AppState;
use archive_gate::RequestContext;
use archive_gate::token::extract_bearer;
use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
};
use std::convert::Infallible;
use std::net::SocketAddr;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Caller origin and bearer token
///
/// The origin is the peer address, or the first `X-Forwarded-For` hop when
/// the server is configured to trust the proxy in front of it.
#[derive(Debug, Clone)]
pub struct Caller(pub RequestContext);

impl FromRequestParts<AppState> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let forwarded = state
            .trust_forwarded_for
            .then(|| {
                parts
                    .headers
                    .get(FORWARDED_FOR)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.split(',').next())
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            })
            .flatten();

        let origin = forwarded
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());

        let bearer = extract_bearer(
            parts
                .headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok()),
        )
        .map(str::to_string);

        Ok(Caller(RequestContext::new(origin, bearer)))
    }
}
