//! OAuth engine: interactive PKCE logins, token refresh, and the cached
//! token lookups the adapters call on every request.

mod config;
mod engine;
mod error;
mod identity;
mod listener;
mod pkce;

pub use config::{
    BodyEncoding, IdentityHook, OauthProviderConfig, anthropic, codex, config_for, google,
    provider_configs,
};
pub use engine::{EXPIRY_BUFFER_MS, OauthEngine};
pub use error::OauthError;
pub use identity::FALLBACK_PROJECT_ID;
