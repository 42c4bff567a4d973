use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use url::Url;

use crate::backoff::Backoff;
use crate::token_manager::{TokenError, TokenManager};

const DEFAULT_BASE_URL: &str = "https://www.deviantart.com/api/v1/oauth2";
pub(crate) const USER_AGENT: &str = concat!("featured-sync/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("failed to decode api response: {0}")]
    Decode(#[source] reqwest::Error),
    #[error("could not locate a \"{0}\" folder in the gallery")]
    FolderNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

impl ApiError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            ApiError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Api { status, .. } => Some(*status),
            ApiError::Request(err) => err.status(),
            _ => None,
        }
    }

    /// Rate limiting, gateway/server hiccups and transport failures are worth
    /// another attempt; everything else is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Request(err) => !err.is_builder(),
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if matches!(
        status,
        StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    ) {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per call, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Waited before every attempt to stay under the provider's rate limit.
    pub min_delay: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(350),
            max_delay: Duration::from_secs(60),
            min_delay: Duration::from_millis(350),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> Backoff {
        Backoff::new(self.base_delay, self.max_delay)
    }
}

pub trait Pause: Send + Sync {
    fn pause(&self, delay: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioPause;

impl Pause for TokioPause {
    fn pause(&self, delay: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(delay))
    }
}

/// Authenticated client for the gallery API.
///
/// Clones share the HTTP connection pool and the token manager, so a single
/// client can be handed to concurrent tasks.
#[derive(Clone)]
pub struct DeviantClient {
    http: Client,
    base_url: Url,
    tokens: Arc<TokenManager>,
    policy: RetryPolicy,
    pause: Arc<dyn Pause>,
}

impl DeviantClient {
    pub fn new(tokens: Arc<TokenManager>) -> Result<Self, ApiError> {
        Self::with_base_url(DEFAULT_BASE_URL, tokens)
    }

    pub fn with_base_url(base_url: &str, tokens: Arc<TokenManager>) -> Result<Self, ApiError> {
        let policy = RetryPolicy::default();
        Ok(Self {
            http: build_http(&policy)?,
            base_url: Url::parse(base_url)?,
            tokens,
            policy,
            pause: Arc::new(TokioPause),
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Result<Self, ApiError> {
        self.http = build_http(&policy)?;
        self.policy = policy;
        Ok(self)
    }

    pub fn with_pause(mut self, pause: Arc<dyn Pause>) -> Self {
        self.pause = pause;
        self
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub async fn list_folders_page(
        &self,
        offset: u32,
        limit: u32,
    ) -> Result<Page<Folder>, ApiError> {
        let query = [
            ("calculate_size", "1".to_string()),
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
        ];
        self.request(Method::GET, "/gallery/folders", &query, None)
            .await
    }

    pub async fn folder_contents_page(
        &self,
        folderid: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Page<Deviation>, ApiError> {
        let query = [
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
            ("mature_content", "1".to_string()),
        ];
        self.request(Method::GET, &format!("/gallery/{folderid}"), &query, None)
            .await
    }

    pub async fn remove_deviations(
        &self,
        folderid: &str,
        deviationids: &[String],
    ) -> Result<MutationResult, ApiError> {
        let form = mutation_form("folderid", folderid, deviationids);
        self.request(
            Method::POST,
            "/gallery/folders/remove_deviations",
            &[],
            Some(form.as_slice()),
        )
        .await
    }

    pub async fn copy_deviations(
        &self,
        target_folderid: &str,
        deviationids: &[String],
    ) -> Result<MutationResult, ApiError> {
        let form = mutation_form("target_folderid", target_folderid, deviationids);
        self.request(
            Method::POST,
            "/gallery/folders/copy_deviations",
            &[],
            Some(form.as_slice()),
        )
        .await
    }

    /// Issues one logical API call.
    ///
    /// A 401 triggers a forced token refresh and a single replay, outside the
    /// attempt budget. Rate limits, 5xx gateway errors and transport failures
    /// back off exponentially until `max_attempts` is spent.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        form: Option<&[(&str, String)]>,
    ) -> Result<T, ApiError> {
        let url = self.endpoint(path)?;
        let backoff = self.policy.backoff();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut token = self.tokens.access_token().await?;
        let mut reauthenticated = false;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let mut outcome = self.send(&method, &url, query, form, &token).await;
            if !reauthenticated
                && matches!(&outcome, Ok(response) if response.status() == StatusCode::UNAUTHORIZED)
            {
                reauthenticated = true;
                tracing::info!(path, "access token rejected; refreshing and replaying once");
                token = self.tokens.force_refresh().await?;
                outcome = self.send(&method, &url, query, form, &token).await;
            }

            let (error, retry_after) = match outcome {
                Ok(response) if response.status().is_success() => {
                    return response.json::<T>().await.map_err(ApiError::Decode);
                }
                Ok(response) => {
                    let status = response.status();
                    let retry_after = retry_after(&response);
                    let body = response.text().await.unwrap_or_default();
                    (ApiError::Api { status, body }, retry_after)
                }
                Err(err) => (ApiError::Request(err), None),
            };

            if !error.is_retryable() || attempt >= max_attempts {
                return Err(error);
            }
            let delay = backoff
                .delay(attempt - 1)
                .max(retry_after.unwrap_or_default())
                .min(self.policy.max_delay);
            tracing::warn!(
                path,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient api failure; backing off"
            );
            self.pause.pause(delay).await;
        }
    }

    async fn send(
        &self,
        method: &Method,
        url: &Url,
        query: &[(&str, String)],
        form: Option<&[(&str, String)]>,
        token: &str,
    ) -> Result<Response, reqwest::Error> {
        if !self.policy.min_delay.is_zero() {
            self.pause.pause(self.policy.min_delay).await;
        }
        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .query(query)
            .query(&[("access_token", token)]);
        if let Some(form) = form {
            request = request.form(form);
        }
        request.send().await
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{base}{path}"))?)
    }
}

fn build_http(policy: &RetryPolicy) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(policy.timeout)
        .user_agent(USER_AGENT)
        .build()
}

fn mutation_form<'a>(
    folder_key: &'a str,
    folderid: &str,
    deviationids: &[String],
) -> Vec<(&'a str, String)> {
    let mut form = Vec::with_capacity(deviationids.len() + 1);
    form.push((folder_key, folderid.to_string()));
    form.extend(
        deviationids
            .iter()
            .map(|id| ("deviationids[]", id.clone())),
    );
    form
}

fn retry_after(response: &Response) -> Option<Duration> {
    let value = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    at.duration_since(SystemTime::now()).ok()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Page<T> {
    #[serde(default)]
    pub results: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_offset: Option<u32>,
}

impl<T> Page<T> {
    /// Offset of the following page. A page claiming `has_more` without a
    /// `next_offset` ends the traversal.
    pub fn next_page_offset(&self) -> Option<u32> {
        if self.has_more { self.next_offset } else { None }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Folder {
    /// Empty when the listing entry carried no id; such folders are skipped.
    #[serde(default)]
    pub folderid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Deviation {
    #[serde(default)]
    pub deviationid: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Unix seconds; the API sends them as a string.
    #[serde(default, deserialize_with = "epoch_seconds")]
    pub published_time: Option<i64>,
    #[serde(default)]
    pub stats: Option<DeviationStats>,
}

impl Deviation {
    pub fn favourites(&self) -> u64 {
        self.stats
            .as_ref()
            .and_then(|stats| stats.favourites)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeviationStats {
    #[serde(default)]
    pub favourites: Option<u64>,
    #[serde(default)]
    pub comments: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MutationResult {
    #[serde(default)]
    pub success: bool,
}

fn epoch_seconds<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(number) => number.as_i64(),
        serde_json::Value::String(text) => text.trim().parse().ok(),
        _ => None,
    })
}
