/// Login futures are shared between concurrent callers, so this error is
/// `Clone`; transport errors are captured as strings.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OauthError {
    #[error("state mismatch in callback; possible CSRF")]
    StateMismatch,
    #[error("timed out waiting for the oauth callback")]
    CallbackTimeout,
    #[error("no refresh token in response. Revoke app access and try again")]
    MissingRefreshToken,
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),
    #[error("invalid callback request: {0}")]
    Callback(String),
    #[error("token endpoint failure: {0}")]
    TokenEndpoint(String),
    #[error("refresh failed for {provider} account {account}: {message}")]
    RefreshFailed {
        provider: &'static str,
        account: u32,
        message: String,
    },
    #[error("http error: {0}")]
    Http(String),
    #[error("storage error: {0}")]
    Store(String),
}

impl From<aproxy_storage::StoreError> for OauthError {
    fn from(err: aproxy_storage::StoreError) -> Self {
        OauthError::Store(err.to_string())
    }
}
