//! Upgrade request authentication
//!
//! Validates the HS256 access token presented on the WebSocket upgrade and
//! resolves the chat the client wants to join. Tokens are issued elsewhere.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::http::{header, HeaderMap};

use crate::error::AuthError;
use crate::types::{ChatId, UserId};

/// Cookie carrying the access token
pub const TOKEN_COOKIE: &str = "UserToken";

/// Access token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "UserId")]
    pub user_id: i64,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
}

/// Verifies access tokens with a shared secret
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Verify a token and return the user it was issued to
    pub fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        Ok(UserId(data.claims.user_id))
    }

    /// Authenticate an upgrade request
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<UserId, AuthError> {
        let token = extract_token(headers).ok_or(AuthError::MissingToken)?;
        self.verify(token)
    }
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier").finish_non_exhaustive()
    }
}

/// Find the access token in the `UserToken` cookie or a bearer header
pub fn extract_token(headers: &HeaderMap) -> Option<&str> {
    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == TOKEN_COOKIE)
        .map(|(_, value)| value);

    from_cookie.or_else(|| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
    })
}

/// Extract the chat id from an upgrade path ending in `/ws/{chat_id}`
pub fn parse_chat_path(path: &str) -> Result<ChatId, AuthError> {
    let mut segments = path.trim_end_matches('/').rsplit('/');
    match (segments.next(), segments.next()) {
        (Some(chat_id), Some("ws")) => chat_id
            .parse()
            .map_err(|_| AuthError::InvalidPath(path.to_string())),
        _ => Err(AuthError::InvalidPath(path.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{encode, EncodingKey, Header};
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    use super::*;

    const SECRET: &str = "test-secret";

    fn token(user_id: i64, secret: &str, exp_offset: i64) -> String {
        let claims = Claims {
            user_id,
            exp: (chrono::Utc::now().timestamp() + exp_offset) as u64,
            sub: Some(user_id.to_string()),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_verify_valid_token() {
        let verifier = TokenVerifier::new(SECRET);
        assert_eq!(verifier.verify(&token(42, SECRET, 900)).unwrap(), UserId(42));
    }

    #[test]
    fn test_verify_rejects_bad_tokens() {
        let verifier = TokenVerifier::new(SECRET);
        assert!(verifier.verify(&token(42, "other-secret", 900)).is_err());
        assert!(verifier.verify(&token(42, SECRET, -3600)).is_err());
        assert!(verifier.verify("garbage").is_err());
    }

    #[test]
    fn test_extract_token_from_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; UserToken=abc.def.ghi"),
        );
        assert_eq!(extract_token(&headers), Some("abc.def.ghi"));
    }

    #[test]
    fn test_extract_token_from_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer xyz"));
        assert_eq!(extract_token(&headers), Some("xyz"));

        assert_eq!(extract_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_authenticate_missing_token() {
        let verifier = TokenVerifier::new(SECRET);
        assert!(matches!(
            verifier.authenticate(&HeaderMap::new()),
            Err(AuthError::MissingToken)
        ));
    }

    #[test]
    fn test_parse_chat_path() {
        let chat = ChatId::new();
        assert_eq!(parse_chat_path(&format!("/ws/{}", chat)).unwrap(), chat);
        assert_eq!(
            parse_chat_path(&format!("/api/v1/chats/ws/{}/", chat)).unwrap(),
            chat
        );
        assert!(parse_chat_path("/ws/not-a-uuid").is_err());
        assert!(parse_chat_path(&format!("/chat/{}", chat)).is_err());
        assert!(parse_chat_path("/").is_err());
    }
}
