//! Platform tokens: HS256-signed, scoped to one workspace, 12 hour expiry.

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

const TOKEN_TTL_HOURS: i64 = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Service account acting on behalf of the workspace.
    pub account: Uuid,
    pub workspace: String,
    pub iss: String,
    pub aud: Vec<String>,
    pub exp: i64,
}

/// Issues a workspace-scoped token with a fresh service account id.
pub fn new_token(secret: &str, workspace: &str, issuer: &str, audience: &str) -> Result<String> {
    let claims = Claims {
        account: Uuid::new_v4(),
        workspace: workspace.to_string(),
        iss: issuer.to_string(),
        aud: vec![audience.to_string()],
        exp: (Utc::now() + Duration::hours(TOKEN_TTL_HOURS)).timestamp(),
    };

    let token = jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}

/// Verifies signature and expiry and returns the claims. The audience is
/// not pinned here; callers compare it against their own expectations.
pub fn decode(secret: &str, token: &str) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_aud = false;

    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let token = new_token("secret", "ws", "issuer", "aud").unwrap();
        let claims = decode("secret", &token).unwrap();

        assert_eq!(claims.workspace, "ws");
        assert_eq!(claims.iss, "issuer");
        assert_eq!(claims.aud, vec!["aud".to_string()]);
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = new_token("secret", "ws", "issuer", "aud").unwrap();
        assert!(decode("other", &token).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode("secret", "not-a-token").is_err());
    }
}
