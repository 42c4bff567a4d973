use deviant_core::{PersistenceError, TokenStore};
use keyring::Entry;

const SERVICE_NAME: &str = "featured-sync";
const TOKEN_KEY: &str = "deviantart_refresh_token";

/// Refresh token kept in the OS secret service.
pub struct KeyringTokenStore {
    entry: Entry,
}

impl KeyringTokenStore {
    pub fn new() -> Result<Self, keyring::Error> {
        Ok(Self {
            entry: Entry::new(SERVICE_NAME, TOKEN_KEY)?,
        })
    }
}

impl TokenStore for KeyringTokenStore {
    fn load(&self, fallback: &str) -> Result<String, PersistenceError> {
        match self.entry.get_password() {
            Ok(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
            Ok(_) | Err(keyring::Error::NoEntry) => Ok(fallback.trim().to_string()),
            Err(err) => Err(PersistenceError::new(format!("keyring error: {err}"))),
        }
    }

    fn save(&self, token: &str) -> Result<(), PersistenceError> {
        self.entry
            .set_password(token.trim())
            .map_err(|err| PersistenceError::new(format!("keyring error: {err}")))
    }
}
