//! Bearer tokens for the management API
//!
//! Either a fixed token handed in by the operator, or a client-credentials
//! grant against the identity authority. Granted tokens are cached and
//! fetched again shortly before they expire.

use crate::http;
use chrono::{DateTime, Duration as TimeDelta, Utc};
use medic_core::PortError;
use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Directory (tenant) of the service principal
pub const TENANT_ID_ENV: &str = "ADF_TENANT_ID";
/// Application id of the service principal
pub const CLIENT_ID_ENV: &str = "ADF_CLIENT_ID";
/// Secret of the service principal
pub const CLIENT_SECRET_ENV: &str = "ADF_CLIENT_SECRET";

/// Lifetime assumed when the authority does not state one
const DEFAULT_LIFETIME_SECS: i64 = 3600;

/// A token is renewed once it has less than this left
const REFRESH_MARGIN_SECS: i64 = 300;

/// How the adapter authenticates
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Pre-issued token, used as is for the life of the process
    Static(String),
    /// Service principal exchanged for short-lived tokens
    ClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(_) => f.debug_tuple("Static").field(&"***").finish(),
            Self::ClientSecret {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ClientSecret")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .field("client_secret", &"***")
                .finish(),
        }
    }
}

impl Credentials {
    /// Reject blank values up front
    pub fn check(&self) -> Result<(), PortError> {
        match self {
            Self::Static(token) => http::require_secret(token, crate::FACTORY_TOKEN_ENV),
            Self::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => {
                http::require_secret(tenant_id, TENANT_ID_ENV)?;
                http::require_secret(client_id, CLIENT_ID_ENV)?;
                http::require_secret(client_secret, CLIENT_SECRET_ENV)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Seconds; the v1 endpoint sends it as a string
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

impl TokenResponse {
    fn lifetime_secs(&self) -> i64 {
        match &self.expires_in {
            Some(serde_json::Value::Number(n)) => n.as_i64(),
            Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_LIFETIME_SECS)
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + TimeDelta::seconds(REFRESH_MARGIN_SECS) < self.expires_at
    }
}

/// Hands out a valid bearer token for each request
#[derive(Debug)]
pub struct TokenProvider {
    http: reqwest::Client,
    credentials: Credentials,
    authority_url: String,
    resource: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    /// `resource` is the audience the token is requested for
    pub fn new(
        credentials: Credentials,
        authority_url: impl Into<String>,
        resource: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, PortError> {
        credentials.check()?;
        Ok(Self {
            http: http::client(timeout)?,
            credentials,
            authority_url: authority_url.into(),
            resource: resource.into(),
            cached: Mutex::new(None),
        })
    }

    /// Current token, granting a new one when the cached one is about to lapse
    pub async fn token(&self) -> Result<String, PortError> {
        let (tenant_id, client_id, client_secret) = match &self.credentials {
            Credentials::Static(token) => return Ok(token.clone()),
            Credentials::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => (tenant_id, client_id, client_secret),
        };

        let now = Utc::now();
        if let Some(token) = self.cached_at(now) {
            return Ok(token);
        }

        let url = format!(
            "{}/{}/oauth2/token",
            self.authority_url.trim_end_matches('/'),
            tenant_id
        );
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("resource", self.resource.as_str()),
        ];
        let response: TokenResponse =
            http::send_json(self.http.post(url).form(&form)).await?;
        if response.access_token.trim().is_empty() {
            return Err(PortError::Malformed("token response carried no access_token".into()));
        }

        let lifetime = response.lifetime_secs();
        tracing::debug!(lifetime_secs = lifetime, "management token granted");
        let token = CachedToken {
            value: response.access_token,
            expires_at: now + TimeDelta::seconds(lifetime),
        };
        let value = token.value.clone();
        *self.cached.lock() = Some(token);
        Ok(value)
    }

    fn cached_at(&self, now: DateTime<Utc>) -> Option<String> {
        self.cached
            .lock()
            .as_ref()
            .filter(|t| t.is_fresh(now))
            .map(|t| t.value.clone())
    }
}
