//! # Authentication Contract
//!
//! The connection does not know how tokens are minted. It asks an injected
//! [`AuthProvider`] for a valid token before connecting and, at most once per
//! failure cycle, for a renewed one after a token error.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::config::ClientOptions;
use crate::errors::RealtimeResult;

/// A token granted by the auth provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDetails {
    pub token: String,
    /// Millis since Unix epoch, when known
    pub expires: Option<i64>,
    /// Identity the token is bound to, when known
    pub client_id: Option<String>,
}

impl TokenDetails {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires: None,
            client_id: None,
        }
    }
}

/// Source of connection credentials
pub trait AuthProvider: Send + Sync {
    /// Return a valid token. With `force_renew` the provider must not hand
    /// back a cached token.
    ///
    /// [`RealtimeError::AuthError`](crate::RealtimeError::AuthError) fails the
    /// connection; any other error is retried like a lost transport.
    fn current_valid_token(&self, force_renew: bool) -> BoxFuture<'static, RealtimeResult<TokenDetails>>;

    /// Whether calling again with `force_renew` can produce a different token
    fn can_renew(&self) -> bool {
        true
    }
}

/// Credentials resolved for one connection attempt
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Key(String),
    Token(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log secrets
        match self {
            Credentials::Key(_) => write!(f, "Credentials::Key(..)"),
            Credentials::Token(_) => write!(f, "Credentials::Token(..)"),
        }
    }
}

/// How the connection obtains credentials
#[derive(Clone)]
pub(crate) enum AuthSource {
    Static(Credentials),
    Provider(Arc<dyn AuthProvider>),
}

impl AuthSource {
    pub(crate) fn from_options(
        options: &ClientOptions,
        provider: Option<Arc<dyn AuthProvider>>,
    ) -> Option<Self> {
        if let Some(provider) = provider {
            return Some(AuthSource::Provider(provider));
        }
        if let Some(key) = &options.key {
            return Some(AuthSource::Static(Credentials::Key(key.clone())));
        }
        options
            .token
            .as_ref()
            .map(|token| AuthSource::Static(Credentials::Token(token.clone())))
    }

    /// A token error can only be fixed when a provider can mint a new token
    pub(crate) fn can_renew(&self) -> bool {
        match self {
            AuthSource::Static(_) => false,
            AuthSource::Provider(provider) => provider.can_renew(),
        }
    }
}
