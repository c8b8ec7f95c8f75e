//! Bearer-credential check for the control API.
//!
//! The credential is issued by an external identity provider; the API only
//! compares it. With no token configured every request is accepted.

use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use secrecy::{ExposeSecret, SecretString};

use crate::api::routes::ApiState;

/// Extractor that admits a request carrying the configured bearer token.
pub struct Authenticated;

impl FromRequestParts<ApiState> for Authenticated {
    type Rejection = StatusCode;

    fn from_request_parts(
        parts: &mut Parts,
        state: &ApiState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let bearer = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
            .map(str::trim);

        let allowed = token_matches(state.bearer_token.as_ref(), bearer);
        if !allowed {
            tracing::debug!(path = %parts.uri.path(), "Rejected request without valid bearer token");
        }

        async move {
            if allowed {
                Ok(Authenticated)
            } else {
                Err(StatusCode::UNAUTHORIZED)
            }
        }
    }
}

fn token_matches(expected: Option<&SecretString>, presented: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    let Some(presented) = presented else {
        return false;
    };
    let expected = expected.expose_secret().as_bytes();
    let presented = presented.as_bytes();
    // Compare every byte so timing does not reveal the matching prefix.
    expected.len() == presented.len()
        && expected
            .iter()
            .zip(presented)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_rules() {
        let token = SecretString::from("s3cret");
        assert!(token_matches(None, None));
        assert!(token_matches(None, Some("anything")));
        assert!(token_matches(Some(&token), Some("s3cret")));
        assert!(!token_matches(Some(&token), Some("s3cre")));
        assert!(!token_matches(Some(&token), Some("s3creT")));
        assert!(!token_matches(Some(&token), None));
    }
}
