use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::error::OauthError;

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(120);

const SUCCESS_PAGE: &str = "<html><body><h1>Login complete</h1>\
<p>You can close this window and return to the terminal.</p></body></html>";
const FAILURE_PAGE: &str = "<html><body><h1>Login failed</h1>\
<p>Return to the terminal for details.</p></body></html>";

#[derive(Debug)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

/// Binds the provider's redirect address. Must happen before the browser
/// opens, or a fast redirect races the accept loop.
pub async fn bind(host: &str, port: u16) -> Result<TcpListener, OauthError> {
    TcpListener::bind((host, port))
        .await
        .map_err(|err| OauthError::Callback(format!("bind {host}:{port} failed: {err}")))
}

/// Waits for exactly one callback request, with a 120 s hard timeout over
/// the whole exchange.
pub async fn wait_for_callback(
    listener: TcpListener,
    path: &str,
    expected_state: &str,
) -> Result<CallbackParams, OauthError> {
    tokio::time::timeout(CALLBACK_TIMEOUT, accept_one(&listener, path, expected_state))
        .await
        .map_err(|_| OauthError::CallbackTimeout)?
}

async fn accept_one(
    listener: &TcpListener,
    path: &str,
    expected_state: &str,
) -> Result<CallbackParams, OauthError> {
    let (stream, _) = listener
        .accept()
        .await
        .map_err(|err| OauthError::Callback(err.to_string()))?;

    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .await
        .map_err(|err| OauthError::Callback(err.to_string()))?;

    let result = parse_request_line(&request_line, path, expected_state);

    let page = if result.is_ok() {
        SUCCESS_PAGE
    } else {
        FAILURE_PAGE
    };
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{page}",
        page.len()
    );
    let mut stream = reader.into_inner();
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;

    result
}

fn parse_request_line(
    request_line: &str,
    path: &str,
    expected_state: &str,
) -> Result<CallbackParams, OauthError> {
    // GET /callback?code=...&state=... HTTP/1.1
    let mut parts = request_line.split_whitespace();
    let (Some(_method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(OauthError::Callback("malformed request line".to_string()));
    };

    let (request_path, query) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };
    if request_path != path {
        return Err(OauthError::Callback(format!(
            "unexpected callback path {request_path}"
        )));
    }

    if let Some(error) = query_value(query, "error") {
        let detail = query_value(query, "error_description").unwrap_or(error);
        return Err(OauthError::AuthorizationDenied(detail));
    }

    let state = query_value(query, "state")
        .ok_or_else(|| OauthError::Callback("missing state".to_string()))?;
    if state != expected_state {
        return Err(OauthError::StateMismatch);
    }

    let code = query_value(query, "code")
        .ok_or_else(|| OauthError::Callback("missing code".to_string()))?;

    Ok(CallbackParams { code, state })
}

fn query_value(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key != name {
            return None;
        }
        urlencoding::decode(value).ok().map(|v| v.into_owned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_code_and_state() {
        let params = parse_request_line(
            "GET /callback?code=abc%2F1&state=s1 HTTP/1.1\r\n",
            "/callback",
            "s1",
        )
        .unwrap();
        assert_eq!(params.code, "abc/1");
        assert_eq!(params.state, "s1");
    }

    #[test]
    fn state_mismatch_is_fatal() {
        let err = parse_request_line(
            "GET /callback?code=abc&state=attacker HTTP/1.1\r\n",
            "/callback",
            "s1",
        )
        .unwrap_err();
        assert!(matches!(err, OauthError::StateMismatch));
    }

    #[test]
    fn provider_error_is_surfaced() {
        let err = parse_request_line(
            "GET /callback?error=access_denied&error_description=nope HTTP/1.1\r\n",
            "/callback",
            "s1",
        )
        .unwrap_err();
        assert!(matches!(err, OauthError::AuthorizationDenied(ref d) if d == "nope"));
    }

    #[test]
    fn wrong_path_is_rejected() {
        let err =
            parse_request_line("GET /favicon.ico HTTP/1.1\r\n", "/callback", "s1").unwrap_err();
        assert!(matches!(err, OauthError::Callback(_)));
    }
}
