use aproxy_provider_core::ClientProvider;

/// Path prefixes that bounce a browser to the hosted product.
const BROWSER_PREFIXES: [&str; 4] = ["/auth", "/threads", "/docs", "/settings"];
const BROWSER_EXACT: [&str; 2] = ["/threads.rss", "/news.rss"];

/// API families the proxy forwards to the paid gateway untouched.
const PASS_THROUGH_PREFIXES: [&str; 10] = [
    "/api/internal",
    "/api/user",
    "/api/auth",
    "/api/meta",
    "/api/ads",
    "/api/telemetry",
    "/api/threads",
    "/api/otel",
    "/api/tab",
    "/api/durable-thread-workers",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteClass {
    Health,
    BrowserRedirect,
    PassThrough,
    Provider {
        provider: ClientProvider,
        subpath: String,
    },
    Upstream,
}

pub fn classify_path(path: &str) -> RouteClass {
    if path == "/" || path == "/status" {
        return RouteClass::Health;
    }
    if is_browser_redirect(path) {
        return RouteClass::BrowserRedirect;
    }
    if is_pass_through(path) {
        return RouteClass::PassThrough;
    }
    if let Some((provider, subpath)) = provider_route(path) {
        return RouteClass::Provider { provider, subpath };
    }
    RouteClass::Upstream
}

pub fn is_browser_redirect(path: &str) -> bool {
    if BROWSER_EXACT.contains(&path) {
        return true;
    }
    BROWSER_PREFIXES
        .iter()
        .any(|prefix| path == *prefix || path.starts_with(&format!("{prefix}/")))
}

pub fn is_pass_through(path: &str) -> bool {
    PASS_THROUGH_PREFIXES
        .iter()
        .any(|prefix| path == *prefix || path.starts_with(&format!("{prefix}/")))
}

/// `/api/provider/<clientProvider>/<subpath>` → `(provider, "/<subpath>")`.
pub fn provider_route(path: &str) -> Option<(ClientProvider, String)> {
    let rest = path.strip_prefix("/api/provider/")?;
    let (name, subpath) = match rest.split_once('/') {
        Some((name, subpath)) => (name, format!("/{subpath}")),
        None => (rest, String::from("/")),
    };
    let provider = ClientProvider::parse(name)?;
    Some((provider, subpath))
}

/// Model name from a Gemini-style URL: the segment after `models/`, up to
/// `:`/`/`/`?`.
pub fn model_from_url(path: &str) -> Option<String> {
    let (_, rest) = path.split_once("models/")?;
    let model: String = rest
        .chars()
        .take_while(|c| *c != ':' && *c != '/' && *c != '?')
        .collect();
    (!model.is_empty()).then_some(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_through_matches_api_families_only() {
        assert!(is_pass_through("/api/threads/123"));
        assert!(is_pass_through("/api/telemetry"));
        assert!(!is_pass_through("/threads"));
        assert!(!is_pass_through("/api/provider/anthropic/v1/messages"));
    }

    #[test]
    fn browser_paths_redirect() {
        assert!(is_browser_redirect("/auth/callback"));
        assert!(is_browser_redirect("/threads.rss"));
        assert!(is_browser_redirect("/settings"));
        assert!(!is_browser_redirect("/authx"));
    }

    #[test]
    fn provider_routes_parse_name_and_subpath() {
        let (provider, subpath) = provider_route("/api/provider/anthropic/v1/messages").unwrap();
        assert_eq!(provider, ClientProvider::Anthropic);
        assert_eq!(subpath, "/v1/messages");

        let (provider, subpath) =
            provider_route("/api/provider/openai/v1/chat/completions").unwrap();
        assert_eq!(provider, ClientProvider::Openai);
        assert_eq!(subpath, "/v1/chat/completions");

        assert!(provider_route("/api/provider/mistral/v1/chat").is_none());
        assert!(provider_route("/api/providers/anthropic").is_none());
    }

    #[test]
    fn model_from_url_handles_actions() {
        assert_eq!(
            model_from_url("/v1beta/models/gemini-3-flash-preview:streamGenerateContent").as_deref(),
            Some("gemini-3-flash-preview")
        );
        assert_eq!(
            model_from_url("/v1beta/models/gemini-3-pro").as_deref(),
            Some("gemini-3-pro")
        );
        assert_eq!(model_from_url("/v1/messages"), None);
    }

    #[test]
    fn classification_order_is_browser_then_passthrough_then_provider() {
        assert_eq!(classify_path("/"), RouteClass::Health);
        assert_eq!(classify_path("/status"), RouteClass::Health);
        assert_eq!(classify_path("/auth/login"), RouteClass::BrowserRedirect);
        assert_eq!(classify_path("/api/user/me"), RouteClass::PassThrough);
        assert!(matches!(
            classify_path("/api/provider/google/v1beta/models/gemini-3-pro:generateContent"),
            RouteClass::Provider { provider: ClientProvider::Google, .. }
        ));
        assert_eq!(classify_path("/api/other"), RouteClass::Upstream);
    }
}
