//! Websocket token handling.
//!
//! Signature verification belongs to the fronting auth layer; the gateway
//! only decodes the JWT payload to learn who is connecting (`sub`) and to
//! refuse obviously expired tokens (`exp`).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;

/// Decode `sub` from an unverified JWT, rejecting expired tokens.
pub fn token_subject(token: &str) -> Option<String> {
    let payload_b64 = token.split('.').nth(1)?;
    let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
    let claims: Value = serde_json::from_slice(&payload).ok()?;

    if let Some(exp) = claims.get("exp").and_then(Value::as_i64) {
        if exp < chrono::Utc::now().timestamp() {
            return None;
        }
    }
    claims
        .get("sub")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_token(claims: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
        format!("{header}.{payload}.unverified-signature")
    }

    #[test]
    fn extracts_subject() {
        let exp = chrono::Utc::now().timestamp() + 3600;
        let token = make_token(&serde_json::json!({"sub": "alice", "exp": exp}));
        assert_eq!(token_subject(&token).as_deref(), Some("alice"));
    }

    #[test]
    fn rejects_expired_token() {
        let exp = chrono::Utc::now().timestamp() - 10;
        let token = make_token(&serde_json::json!({"sub": "alice", "exp": exp}));
        assert!(token_subject(&token).is_none());
    }

    #[test]
    fn rejects_garbage() {
        assert!(token_subject("not-a-jwt").is_none());
        assert!(token_subject("a.b.c").is_none());
        assert!(token_subject("").is_none());
    }

    #[test]
    fn missing_exp_is_accepted() {
        let token = make_token(&serde_json::json!({"sub": "bob"}));
        assert_eq!(token_subject(&token).as_deref(), Some("bob"));
    }
}
