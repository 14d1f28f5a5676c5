use aproxy_common::RouteDecision;

/// Quota bucket identity. Note the asymmetry with stored credentials: both
/// Google-backed pools draw on the same `"google"` provider slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pool {
    Anthropic,
    Codex,
    Gemini,
    Antigravity,
}

impl Pool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pool::Anthropic => "anthropic",
            Pool::Codex => "codex",
            Pool::Gemini => "gemini",
            Pool::Antigravity => "antigravity",
        }
    }

    /// Credential-store provider key backing this pool.
    pub fn store_provider(&self) -> &'static str {
        match self {
            Pool::Anthropic => "anthropic",
            Pool::Codex => "codex",
            Pool::Gemini | Pool::Antigravity => "google",
        }
    }

    pub fn decision(&self) -> RouteDecision {
        match self {
            Pool::Anthropic => RouteDecision::LocalClaude,
            Pool::Codex => RouteDecision::LocalCodex,
            Pool::Gemini => RouteDecision::LocalGemini,
            Pool::Antigravity => RouteDecision::LocalAntigravity,
        }
    }
}

/// Provider namespace as the client names it in the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientProvider {
    Anthropic,
    Openai,
    Google,
}

impl ClientProvider {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "anthropic" => Some(ClientProvider::Anthropic),
            "openai" => Some(ClientProvider::Openai),
            "google" => Some(ClientProvider::Google),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientProvider::Anthropic => "anthropic",
            ClientProvider::Openai => "openai",
            ClientProvider::Google => "google",
        }
    }

    /// Candidate pools in preference order. The order is the tie-breaker
    /// for least-connections selection.
    pub fn pools(&self) -> &'static [Pool] {
        match self {
            ClientProvider::Anthropic => &[Pool::Anthropic],
            ClientProvider::Openai => &[Pool::Codex],
            ClientProvider::Google => &[Pool::Gemini, Pool::Antigravity],
        }
    }
}
