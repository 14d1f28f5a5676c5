/// How a provider wants its token-exchange body encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    Json,
    Form,
}

/// Which identity-extraction routine runs after a token exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityHook {
    Anthropic,
    Codex,
    Google,
}

/// Compile-time OAuth parameters for one provider.
#[derive(Debug, Clone, Copy)]
pub struct OauthProviderConfig {
    /// Credential-store key; also the name accepted by `login <provider>`.
    pub provider: &'static str,
    pub client_id: &'static str,
    pub client_secret: Option<&'static str>,
    pub authorize_url: &'static str,
    pub token_url: &'static str,
    pub redirect_host: &'static str,
    pub callback_port: u16,
    pub callback_path: &'static str,
    pub scope: &'static str,
    pub body_encoding: BodyEncoding,
    /// Whether `state` rides along in the token exchange body.
    pub state_in_token: bool,
    pub extra_authorize_params: &'static [(&'static str, &'static str)],
    /// Whether to shorten the stored expiry by the refresh buffer.
    pub expiry_buffer: bool,
    pub identity: IdentityHook,
}

impl OauthProviderConfig {
    pub fn redirect_uri(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.redirect_host, self.callback_port, self.callback_path
        )
    }
}

static ANTHROPIC: OauthProviderConfig = OauthProviderConfig {
    provider: "anthropic",
    client_id: "9d1c250a-e61b-44d9-88ed-5944d1962f5e",
    client_secret: None,
    authorize_url: "https://claude.ai/oauth/authorize",
    token_url: "https://console.anthropic.com/v1/oauth/token",
    redirect_host: "localhost",
    callback_port: 54545,
    callback_path: "/callback",
    scope: "org:create_api_key user:profile user:inference",
    body_encoding: BodyEncoding::Json,
    state_in_token: true,
    extra_authorize_params: &[("code", "true")],
    expiry_buffer: true,
    identity: IdentityHook::Anthropic,
};

static CODEX: OauthProviderConfig = OauthProviderConfig {
    provider: "codex",
    client_id: "app_EMoamEEZ73f0CkXaXp7hrann",
    client_secret: None,
    authorize_url: "https://auth.openai.com/oauth/authorize",
    token_url: "https://auth.openai.com/oauth/token",
    redirect_host: "localhost",
    callback_port: 1455,
    callback_path: "/auth/callback",
    scope: "openid profile email offline_access",
    body_encoding: BodyEncoding::Form,
    state_in_token: false,
    extra_authorize_params: &[
        ("id_token_add_organizations", "true"),
        ("codex_cli_simplified_flow", "true"),
        ("originator", "codex_cli_rs"),
    ],
    expiry_buffer: true,
    identity: IdentityHook::Codex,
};

static GOOGLE: OauthProviderConfig = OauthProviderConfig {
    provider: "google",
    client_id: "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com",
    client_secret: Some("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"),
    authorize_url: "https://accounts.google.com/o/oauth2/v2/auth",
    token_url: "https://oauth2.googleapis.com/token",
    redirect_host: "localhost",
    callback_port: 51121,
    callback_path: "/oauth2callback",
    scope: "https://www.googleapis.com/auth/cloud-platform \
            https://www.googleapis.com/auth/userinfo.email \
            https://www.googleapis.com/auth/userinfo.profile",
    body_encoding: BodyEncoding::Form,
    state_in_token: false,
    extra_authorize_params: &[("access_type", "offline"), ("prompt", "consent")],
    // Google already reports a shortened expiry for this surface.
    expiry_buffer: false,
    identity: IdentityHook::Google,
};

pub fn anthropic() -> &'static OauthProviderConfig {
    &ANTHROPIC
}

pub fn codex() -> &'static OauthProviderConfig {
    &CODEX
}

pub fn google() -> &'static OauthProviderConfig {
    &GOOGLE
}

pub fn provider_configs() -> [&'static OauthProviderConfig; 3] {
    [&ANTHROPIC, &CODEX, &GOOGLE]
}

pub fn config_for(name: &str) -> Option<&'static OauthProviderConfig> {
    match name {
        "anthropic" => Some(&ANTHROPIC),
        "codex" => Some(&CODEX),
        "google" => Some(&GOOGLE),
        _ => None,
    }
}
