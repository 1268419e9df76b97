//! Session authorization.
//!
//! A session asks its authorizer for permission before touching devices or
//! opening the transport. [`OpenAccess`] grants unconditionally for local
//! use; [`HttpAuthorizer`] defers to a backend endpoint that can apply rate
//! limits or entitlement checks.

use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use url::Url;

/// Decides whether a voice session may start.
#[async_trait]
pub trait SessionAuthorizer: Send + Sync {
    /// Ok to proceed, or [`VoiceError::AuthorizationRejected`] with a
    /// user-displayable reason.
    async fn authorize(&self) -> Result<()>;
}

/// Authorizer that always grants.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAccess;

#[async_trait]
impl SessionAuthorizer for OpenAccess {
    async fn authorize(&self) -> Result<()> {
        Ok(())
    }
}

/// Authorizer backed by an HTTP endpoint.
///
/// POSTs to the endpoint; any non-success status rejects the session. The
/// rejection reason is taken from an `error` field in the JSON body when
/// present.
pub struct HttpAuthorizer {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpAuthorizer {
    pub fn new(endpoint: Url) -> Self {
        Self { client: reqwest::Client::new(), endpoint }
    }
}

#[async_trait]
impl SessionAuthorizer for HttpAuthorizer {
    async fn authorize(&self) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .send()
            .await
            .map_err(|e| VoiceError::transport(format!("authorization request failed: {e}")))?;

        if response.status().is_success() {
            return Ok(());
        }

        let status = response.status();
        let reason = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or_else(|| format!("session rejected with status {status}"));

        tracing::warn!(%status, reason, "session authorization rejected");
        Err(VoiceError::rejected(reason))
    }
}
