use serde::{Deserialize, Serialize};

/// One stored OAuth identity for a `(provider, account)` slot.
///
/// `expires_at` is absolute epoch milliseconds; the OAuth engine already
/// subtracts the provider's expiry buffer before persisting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

impl CredentialRecord {
    pub fn fresh(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at
    }

    /// A record with no refresh token cannot start new flows. It is kept
    /// around (the slot stays claimed) but never routed to.
    pub fn usable(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    /// Whether `other` names the same identity, matched on non-empty
    /// `email` or `account_id`.
    pub fn same_identity(&self, other: &CredentialRecord) -> bool {
        let email_match = match (&self.email, &other.email) {
            (Some(a), Some(b)) => !a.is_empty() && a == b,
            _ => false,
        };
        let id_match = match (&self.account_id, &other.account_id) {
            (Some(a), Some(b)) => !a.is_empty() && a == b,
            _ => false,
        };
        email_match || id_match
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(email: Option<&str>, account_id: Option<&str>) -> CredentialRecord {
        CredentialRecord {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            expires_at: 0,
            project_id: None,
            email: email.map(str::to_string),
            account_id: account_id.map(str::to_string),
        }
    }

    #[test]
    fn identity_matches_on_email_or_account_id() {
        let a = record(Some("a@example.com"), None);
        let b = record(Some("a@example.com"), Some("acc-1"));
        assert!(a.same_identity(&b));

        let c = record(None, Some("acc-1"));
        assert!(b.same_identity(&c));
        assert!(!a.same_identity(&c));
    }

    #[test]
    fn empty_identity_fields_never_match() {
        let a = record(Some(""), Some(""));
        let b = record(Some(""), Some(""));
        assert!(!a.same_identity(&b));
    }
}
