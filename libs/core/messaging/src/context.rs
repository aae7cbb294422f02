//! Request context propagation through message headers.
//!
//! On publish the active [`RequestContext`] is serialized to JSON, base64
//! encoded and stored under [`keys::REQUEST_CONTEXT`]; its correlation id is
//! mirrored under [`keys::CORRELATION_ID`]. On receipt the header is decoded
//! back. A missing or unreadable header never blocks delivery: the consumer
//! gets a fresh context instead.

use crate::envelope::{keys, Header};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Identity attached to a request. Opaque to the queue layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: Vec<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Request-scoped context carried across process boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub cid: String,
    #[serde(default)]
    pub ip: String,
    /// Unix milliseconds at which the originating request started.
    #[serde(default)]
    pub request_timestamp: i64,
    #[serde(default)]
    pub user_info: Option<UserInfo>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl RequestContext {
    /// Build a context, generating a UUIDv7 correlation id when `cid` is empty.
    pub fn new(cid: Option<String>) -> Self {
        let cid = cid
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());

        Self {
            cid,
            ip: String::new(),
            request_timestamp: chrono::Utc::now().timestamp_millis(),
            user_info: Some(UserInfo::default()),
            access_token: None,
            refresh_token: None,
        }
    }

    pub fn with_user(mut self, user: UserInfo) -> Self {
        self.user_info = Some(user);
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }

    /// Milliseconds elapsed since `request_timestamp`.
    pub fn elapsed_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() - self.request_timestamp
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Write `ctx` into `headers`, overwriting previous context headers.
pub fn encode_context(ctx: &RequestContext, headers: &mut Header) {
    match serde_json::to_vec(ctx) {
        Ok(json) => headers.set(keys::REQUEST_CONTEXT, STANDARD.encode(json)),
        Err(e) => debug!(error = %e, "Failed to serialize request context"),
    }
    headers.set(keys::CORRELATION_ID, ctx.cid.clone());
}

/// Read the request context from `headers`.
///
/// Falls back to a fresh context, reusing the mirrored correlation id when one
/// is present.
pub fn decode_context(headers: &Header) -> RequestContext {
    if let Some(ctx) = try_decode_context(headers) {
        return ctx;
    }

    let cid = headers.get(keys::CORRELATION_ID);
    RequestContext::new(Some(cid))
}

fn try_decode_context(headers: &Header) -> Option<RequestContext> {
    let encoded = headers.get(keys::REQUEST_CONTEXT);
    if encoded.is_empty() {
        return None;
    }

    let json = match STANDARD.decode(encoded.as_bytes()) {
        Ok(json) => json,
        Err(e) => {
            debug!(error = %e, "Request context header is not valid base64");
            return None;
        }
    };

    match serde_json::from_slice::<RequestContext>(&json) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            debug!(error = %e, "Request context header is not valid JSON");
            None
        }
    }
}
