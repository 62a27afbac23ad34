//! Parsing of `WWW-Authenticate: Bearer realm="...",service="...",scope="..."`
//! challenges and the token exchange that follows one (§4.8 step 1-4).

use serde::Deserialize;

use crate::error::{BuildError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub service: String,
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

impl TokenResponse {
    pub fn into_token(self) -> Option<String> {
        self.token.or(self.access_token)
    }
}

/// Split `realm="a",service="b",scope="c,d"` on top-level commas only —
/// a quoted value (the `scope` parameter in particular, e.g.
/// `repository:demo:push,pull`) may itself contain commas, so a comma
/// inside an open `"..."` span never ends the current parameter.
fn split_top_level_commas(params: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in params.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&params[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&params[start..]);
    parts
}

/// Parse a `Bearer realm="...",service="...",scope="..."` header value. A
/// regex-free key=value scan, matching the teacher's auth-header parser.
pub fn parse(header_value: &str) -> Result<Challenge> {
    let params = header_value
        .trim()
        .strip_prefix("Bearer ")
        .ok_or_else(|| BuildError::AuthFailure("unsupported WWW-Authenticate scheme".to_string()))?;

    let mut realm = None;
    let mut service = None;
    let mut scope = None;

    for param in split_top_level_commas(params) {
        let param = param.trim();
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }

    let realm = realm.ok_or_else(|| BuildError::AuthFailure("challenge missing realm".to_string()))?;
    let service = service.ok_or_else(|| BuildError::AuthFailure("challenge missing service".to_string()))?;
    Ok(Challenge { realm, service, scope })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_challenge() {
        let header = r#"Bearer realm="https://auth.example/token",service="example",scope="repository:demo:push,pull""#;
        let challenge = parse(header).unwrap();
        assert_eq!(challenge.realm, "https://auth.example/token");
        assert_eq!(challenge.service, "example");
        assert_eq!(challenge.scope.as_deref(), Some("repository:demo:push,pull"));
    }

    #[test]
    fn rejects_non_bearer_scheme() {
        assert!(parse("Basic realm=\"x\"").is_err());
    }

    #[test]
    fn token_response_prefers_token_field() {
        let resp: TokenResponse = serde_json::from_str(r#"{"token":"t","access_token":"a"}"#).unwrap();
        assert_eq!(resp.into_token(), Some("t".to_string()));
    }
}
