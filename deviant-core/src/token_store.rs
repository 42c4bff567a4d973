use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to persist refresh token: {message}")]
pub struct PersistenceError {
    message: String,
}

impl PersistenceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Durable home of the long-lived refresh token.
///
/// `load` never fails because nothing is stored yet: it answers with the
/// caller's fallback instead. `save` may be called repeatedly with the same
/// value.
pub trait TokenStore: Send + Sync {
    fn load(&self, fallback: &str) -> Result<String, PersistenceError>;
    fn save(&self, token: &str) -> Result<(), PersistenceError>;
}

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(token.into().trim().to_string())),
        }
    }

    pub fn stored(&self) -> Option<String> {
        self.token.lock().ok().and_then(|token| token.clone())
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self, fallback: &str) -> Result<String, PersistenceError> {
        let token = self
            .token
            .lock()
            .map_err(|_| PersistenceError::new("memory store lock poisoned"))?;
        Ok(token
            .as_deref()
            .filter(|value| !value.is_empty())
            .unwrap_or(fallback)
            .trim()
            .to_string())
    }

    fn save(&self, token: &str) -> Result<(), PersistenceError> {
        let mut slot = self
            .token
            .lock()
            .map_err(|_| PersistenceError::new("memory store lock poisoned"))?;
        *slot = Some(token.trim().to_string());
        Ok(())
    }
}
