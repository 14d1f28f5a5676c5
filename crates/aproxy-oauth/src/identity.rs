use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Value, json};
use tracing::warn;

use aproxy_common::cca;

use crate::error::OauthError;

/// Project id used when every Cloud Code Assist tier refuses discovery.
pub const FALLBACK_PROJECT_ID: &str = "cloudaicompanion-default";

const OPENAI_ME_URL: &str = "https://api.openai.com/v1/me";
const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

#[derive(Debug, Default, Clone)]
pub struct IdentityParts {
    pub email: Option<String>,
    pub account_id: Option<String>,
    pub project_id: Option<String>,
}

/// Anthropic returns the account inline with the token response.
pub fn extract_anthropic(token_response: &Value) -> IdentityParts {
    let account = token_response.get("account");
    IdentityParts {
        email: account
            .and_then(|a| a.get("email_address"))
            .and_then(Value::as_str)
            .map(str::to_string),
        account_id: account
            .and_then(|a| a.get("uuid"))
            .and_then(Value::as_str)
            .map(str::to_string),
        project_id: None,
    }
}

/// Codex identity lives in the access token's JWT claims; the email comes
/// from a separate profile endpoint and is best-effort.
pub async fn extract_codex(client: &wreq::Client, access_token: &str) -> IdentityParts {
    let mut parts = IdentityParts {
        account_id: jwt_claim_account_id(access_token),
        ..Default::default()
    };
    match fetch_json(client, OPENAI_ME_URL, access_token).await {
        Ok(me) => {
            parts.email = me
                .get("email")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        Err(err) => warn!(%err, "codex profile fetch failed; continuing without email"),
    }
    parts
}

/// Decodes the JWT payload (middle segment, base64url) and reads
/// `chatgpt_account_id` out of the OpenAI auth claim.
pub fn jwt_claim_account_id(access_token: &str) -> Option<String> {
    let mut segments = access_token.split('.');
    let payload_b64 = match (segments.next(), segments.next(), segments.next()) {
        (Some(h), Some(p), Some(s)) if !h.is_empty() && !p.is_empty() && !s.is_empty() => p,
        _ => return None,
    };
    let payload_bytes = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
    let payload: Value = serde_json::from_slice(&payload_bytes).ok()?;
    payload
        .get("https://api.openai.com/auth")
        .and_then(|auth| auth.get("chatgpt_account_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Google identity: userinfo for the email, then Cloud Code Assist project
/// discovery across endpoint tiers, falling back to a fixed project id.
pub async fn extract_google(client: &wreq::Client, access_token: &str) -> IdentityParts {
    let mut parts = IdentityParts::default();
    match fetch_json(client, GOOGLE_USERINFO_URL, access_token).await {
        Ok(userinfo) => {
            parts.email = userinfo
                .get("email")
                .and_then(Value::as_str)
                .map(str::to_string);
            parts.account_id = userinfo
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        Err(err) => warn!(%err, "google userinfo fetch failed; continuing without email"),
    }
    parts.project_id = Some(discover_project_id(client, access_token).await);
    parts
}

async fn discover_project_id(client: &wreq::Client, access_token: &str) -> String {
    let body = json!({
        "metadata": {
            "ideType": "IDE_UNSPECIFIED",
            "platform": "PLATFORM_UNSPECIFIED",
            "pluginType": "GEMINI",
        }
    });
    for endpoint in cca::DISCOVERY_ORDER {
        match load_code_assist(client, endpoint, access_token, &body).await {
            Ok(Some(project_id)) => return project_id,
            Ok(None) => {}
            Err(err) => warn!(endpoint, %err, "loadCodeAssist probe failed"),
        }
    }
    warn!(
        fallback = FALLBACK_PROJECT_ID,
        "project discovery failed on all endpoints; using fallback project id"
    );
    FALLBACK_PROJECT_ID.to_string()
}

async fn load_code_assist(
    client: &wreq::Client,
    endpoint: &str,
    access_token: &str,
    body: &Value,
) -> Result<Option<String>, OauthError> {
    let url = cca::action_url(endpoint, "loadCodeAssist", false);
    let payload = serde_json::to_vec(body).map_err(|err| OauthError::Http(err.to_string()))?;
    let response = client
        .post(&url)
        .header("Authorization", format!("Bearer {access_token}"))
        .header("Content-Type", "application/json")
        .body(payload)
        .send()
        .await
        .map_err(|err| OauthError::Http(err.to_string()))?;
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| OauthError::Http(err.to_string()))?;
    if !status.is_success() {
        return Err(OauthError::Http(format!("loadCodeAssist failed: {status}")));
    }
    let payload: Value =
        serde_json::from_slice(&bytes).map_err(|err| OauthError::Http(err.to_string()))?;
    Ok(project_from_payload(&payload))
}

/// `cloudaicompanionProject` arrives either as a bare string or `{id}`.
fn project_from_payload(payload: &Value) -> Option<String> {
    let project = payload.get("cloudaicompanionProject")?;
    project
        .as_str()
        .map(str::to_string)
        .or_else(|| {
            project
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .filter(|id| !id.trim().is_empty())
}

async fn fetch_json(
    client: &wreq::Client,
    url: &str,
    access_token: &str,
) -> Result<Value, OauthError> {
    let response = client
        .get(url)
        .header("Authorization", format!("Bearer {access_token}"))
        .send()
        .await
        .map_err(|err| OauthError::Http(err.to_string()))?;
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| OauthError::Http(err.to_string()))?;
    if !status.is_success() {
        return Err(OauthError::Http(format!("{url} returned {status}")));
    }
    serde_json::from_slice(&bytes).map_err(|err| OauthError::Http(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use serde_json::json;

    #[test]
    fn anthropic_identity_from_token_response() {
        let response = json!({
            "access_token": "at",
            "account": {"email_address": "a@example.com", "uuid": "u-1"},
        });
        let parts = extract_anthropic(&response);
        assert_eq!(parts.email.as_deref(), Some("a@example.com"));
        assert_eq!(parts.account_id.as_deref(), Some("u-1"));
    }

    #[test]
    fn codex_account_id_from_jwt_payload() {
        let payload = json!({
            "https://api.openai.com/auth": {"chatgpt_account_id": "acct-42"},
        });
        let token = format!(
            "h.{}.s",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap())
        );
        assert_eq!(jwt_claim_account_id(&token).as_deref(), Some("acct-42"));
        assert_eq!(jwt_claim_account_id("not-a-jwt"), None);
    }

    #[test]
    fn project_payload_accepts_string_or_object() {
        assert_eq!(
            project_from_payload(&json!({"cloudaicompanionProject": "p-1"})).as_deref(),
            Some("p-1")
        );
        assert_eq!(
            project_from_payload(&json!({"cloudaicompanionProject": {"id": "p-2"}})).as_deref(),
            Some("p-2")
        );
        assert_eq!(project_from_payload(&json!({})), None);
    }
}
