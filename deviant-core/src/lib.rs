mod backoff;
mod client;
mod gallery;
mod oauth;
mod token_manager;
mod token_store;

pub use backoff::Backoff;
pub use client::{
    ApiError, ApiErrorClass, DeviantClient, Deviation, DeviationStats, Folder, MutationResult,
    Page, Pause, RetryPolicy, TokioPause,
};
pub use gallery::{
    CONTENTS_PAGE_SIZE, FOLDER_PAGE_SIZE, Favourites, Gallery, find_folder, pages, recency_cutoff,
};
pub use oauth::{OAuthClient, OAuthError, OAuthToken};
pub use token_manager::{Credentials, TokenError, TokenManager};
pub use token_store::{MemoryTokenStore, PersistenceError, TokenStore};
