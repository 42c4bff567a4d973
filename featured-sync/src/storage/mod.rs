mod dotenv_store;
mod keyring_store;

use std::sync::Arc;

use deviant_core::{MemoryTokenStore, TokenStore};

pub use dotenv_store::DotenvTokenStore;
pub use keyring_store::KeyringTokenStore;

use crate::config::{SyncConfig, TokenBackend};

pub const REFRESH_TOKEN_VAR: &str = "DA_REFRESH_TOKEN";

pub fn open_store(config: &SyncConfig) -> anyhow::Result<Arc<dyn TokenStore>> {
    let store: Arc<dyn TokenStore> = match config.token_backend {
        TokenBackend::Dotenv => {
            if config.env_file.is_none() {
                tracing::warn!(
                    "no .env file found; rotated refresh tokens cannot be persisted"
                );
            }
            Arc::new(DotenvTokenStore::new(config.env_file.clone()))
        }
        TokenBackend::Keyring => Arc::new(KeyringTokenStore::new()?),
        TokenBackend::Memory => Arc::new(MemoryTokenStore::new()),
    };
    Ok(store)
}
