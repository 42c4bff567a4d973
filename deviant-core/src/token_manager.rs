use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::oauth::{OAuthClient, OAuthError};
use crate::token_store::{PersistenceError, TokenStore};

const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token refresh failed: {0}")]
    Auth(#[from] OAuthError),
    #[error("token endpoint response is missing access_token")]
    MissingAccessToken,
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Owns the access token lifecycle for one client.
///
/// `refresh_lock` guards the in-memory refresh token and is held across the
/// whole reconcile/exchange/persist sequence, so at most one exchange is in
/// flight per manager. Callers that queue behind a running refresh reuse its
/// result instead of exchanging again.
pub struct TokenManager {
    oauth: OAuthClient,
    store: Arc<dyn TokenStore>,
    refresh_lock: Mutex<String>,
    cached: RwLock<Option<AccessToken>>,
    margin: Duration,
}

impl TokenManager {
    pub fn new(
        oauth: OAuthClient,
        refresh_token: impl Into<String>,
        store: Arc<dyn TokenStore>,
    ) -> Self {
        Self {
            oauth,
            store,
            refresh_lock: Mutex::new(refresh_token.into().trim().to_string()),
            cached: RwLock::new(None),
            margin: EXPIRY_MARGIN,
        }
    }

    pub fn from_credentials(
        credentials: Credentials,
        store: Arc<dyn TokenStore>,
    ) -> Result<Self, OAuthError> {
        let oauth = OAuthClient::new(credentials.client_id, credentials.client_secret)?;
        Ok(Self::new(oauth, credentials.refresh_token, store))
    }

    pub async fn access_token(&self) -> Result<String, TokenError> {
        if let Some(token) = self.fresh_token().await {
            return Ok(token);
        }
        let mut refresh_token = self.refresh_lock.lock().await;
        if let Some(token) = self.fresh_token().await {
            tracing::debug!("reusing access token refreshed by a concurrent caller");
            return Ok(token);
        }
        self.refresh_locked(&mut refresh_token).await
    }

    pub async fn force_refresh(&self) -> Result<String, TokenError> {
        let mut refresh_token = self.refresh_lock.lock().await;
        self.refresh_locked(&mut refresh_token).await
    }

    pub async fn refresh_token(&self) -> String {
        self.refresh_lock.lock().await.clone()
    }

    async fn fresh_token(&self) -> Option<String> {
        self.cached
            .read()
            .await
            .as_ref()
            .filter(|token| token.is_fresh())
            .map(|token| token.value.clone())
    }

    async fn refresh_locked(&self, refresh_token: &mut String) -> Result<String, TokenError> {
        // Another process may have rotated the token since we last looked.
        *refresh_token = self.store.load(refresh_token)?;

        tracing::debug!("exchanging refresh token for a new access token");
        let token = self.oauth.refresh_token(refresh_token).await?;
        let access_token = token
            .access_token
            .filter(|value| !value.trim().is_empty())
            .ok_or(TokenError::MissingAccessToken)?;

        match token
            .refresh_token
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
        {
            Some(rotated) if rotated != *refresh_token => {
                self.store.save(&rotated)?;
                *refresh_token = rotated;
                tracing::info!("provider rotated the refresh token; stored the new value");
            }
            _ => self.store.save(refresh_token)?,
        }

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS))
            .saturating_sub(self.margin);
        *self.cached.write().await = Some(AccessToken {
            value: access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        tracing::debug!(expires_in_secs = lifetime.as_secs(), "access token refreshed");
        Ok(access_token)
    }
}
