use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use deviant_core::{Credentials, RetryPolicy, TokenStore};

use crate::sync::{DEFAULT_TOP_N, SyncOptions};

const DEFAULT_TARGET_FOLDER: &str = "Featured";
const DEFAULT_REDIRECT_PORT: u16 = 8123;
const DEFAULT_SCOPES: &str = "browse gallery";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenBackend {
    Dotenv,
    Keyring,
    Memory,
}

impl FromStr for TokenBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "dotenv" | "env" => Ok(Self::Dotenv),
            "keyring" => Ok(Self::Keyring),
            "memory" | "none" => Ok(Self::Memory),
            other => anyhow::bail!("unknown token backend: {other}"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Seed value; the token store may hold a newer one.
    pub refresh_token: String,
    pub target_folder: String,
    pub top_n: usize,
    pub per_folder_cap: Option<usize>,
    pub dry_run: bool,
    pub token_backend: TokenBackend,
    pub env_file: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub redirect_port: u16,
    pub scopes: String,
}

impl SyncConfig {
    /// Reads the process environment. `loaded_env_file` is the `.env` picked up
    /// by `dotenvy`, used when `DA_ENV_FILE` is not set.
    pub fn from_env(loaded_env_file: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut config = Self::from_lookup(|name| std::env::var(name).ok())?;
        if config.env_file.is_none() {
            config.env_file = loaded_env_file;
        }
        Ok(config)
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let client_id = read("DA_CLIENT_ID");
        let client_secret = read("DA_CLIENT_SECRET");
        let (client_id, client_secret) = match (client_id, client_secret) {
            (Some(id), Some(secret)) => (id, secret),
            (id, secret) => {
                let missing: Vec<&str> = [
                    id.is_none().then_some("DA_CLIENT_ID"),
                    secret.is_none().then_some("DA_CLIENT_SECRET"),
                ]
                .into_iter()
                .flatten()
                .collect();
                anyhow::bail!("missing credentials: set {}", missing.join(", "));
            }
        };

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_var(&read, "DA_MAX_RETRIES")?
                .filter(|value: &u32| *value > 0)
                .unwrap_or(defaults.max_attempts),
            min_delay: parse_var(&read, "DA_MIN_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.min_delay),
            timeout: parse_var(&read, "DA_REQUEST_TIMEOUT_SECS")?
                .filter(|value: &u64| *value > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            ..defaults
        };

        Ok(Self {
            client_id,
            client_secret,
            refresh_token: read("DA_REFRESH_TOKEN").unwrap_or_default(),
            target_folder: read("DA_TARGET_FOLDER")
                .unwrap_or_else(|| DEFAULT_TARGET_FOLDER.to_string()),
            top_n: parse_var(&read, "DA_TOP_N")?.unwrap_or(DEFAULT_TOP_N),
            per_folder_cap: parse_var(&read, "DA_PER_FOLDER_CAP")?.filter(|cap: &usize| *cap > 0),
            dry_run: read_bool(&read, "DA_DRY_RUN", false),
            token_backend: read("DA_TOKEN_BACKEND")
                .map(|value| value.parse())
                .transpose()?
                .unwrap_or(TokenBackend::Dotenv),
            env_file: read("DA_ENV_FILE").map(PathBuf::from),
            retry,
            redirect_port: match parse_var(&read, "DA_REDIRECT_PORT")? {
                Some(port) => port,
                None => parse_var(&read, "DA_PORT")?.unwrap_or(DEFAULT_REDIRECT_PORT),
            },
            scopes: read("DA_SCOPES").unwrap_or_else(|| DEFAULT_SCOPES.to_string()),
        })
    }

    /// Resolves the refresh token to start from: the stored one when present,
    /// otherwise the configured seed.
    pub fn credentials(&self, store: &dyn TokenStore) -> anyhow::Result<Credentials> {
        let refresh_token = store
            .load(&self.refresh_token)
            .context("failed to read stored refresh token")?;
        if refresh_token.is_empty() {
            anyhow::bail!(
                "missing credentials: set DA_REFRESH_TOKEN or run `featured-sync authorize`"
            );
        }
        Ok(Credentials {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            refresh_token,
        })
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            target_folder: self.target_folder.clone(),
            top_n: self.top_n,
            per_folder_cap: self.per_folder_cap,
            dry_run: self.dry_run,
        }
    }
}

fn parse_var<T, F>(read: &F, name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    read(name)
        .map(|value| {
            value
                .parse::<T>()
                .with_context(|| format!("{name} has an invalid value: {value}"))
        })
        .transpose()
}

fn read_bool<F>(read: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    read(name)
        .map(|value| {
            matches!(
                value.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
