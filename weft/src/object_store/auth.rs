//! Bearer-token access for the object store.
//!
//! Token acquisition is an external concern (instance metadata, service
//! accounts, ...); the reader only needs something that yields a bearer
//! token and can be asked to refresh it after an authorization failure.

use std::future::Future;
use std::pin::Pin;

use crate::error::Status;

/// Source of bearer tokens for object-store requests.
pub trait AccessTokenProvider: Send + Sync {
    /// Returns a bearer token. `force_refresh` is set after the server
    /// rejected the previous token, so cached values must be discarded.
    fn access_token<'a>(
        &'a self,
        force_refresh: bool,
    ) -> Pin<Box<dyn Future<Output = Result<String, Status>> + Send + 'a>>;
}

/// Fixed-token provider for tests and emulators.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Creates a provider that always yields `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl AccessTokenProvider for StaticTokenProvider {
    fn access_token<'a>(
        &'a self,
        _force_refresh: bool,
    ) -> Pin<Box<dyn Future<Output = Result<String, Status>> + Send + 'a>> {
        Box::pin(async move { Ok(self.token.clone()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider_yields_token() {
        let provider = StaticTokenProvider::new("secret");
        assert_eq!(provider.access_token(false).await.unwrap(), "secret");
        assert_eq!(provider.access_token(true).await.unwrap(), "secret");
    }
}
