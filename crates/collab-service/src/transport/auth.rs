//! Token extraction and authorization for WebSocket upgrades.
//!
//! # Token sources
//!
//! Checked in order; the first non-empty token wins:
//! 1. `Authorization: Bearer <token>`
//! 2. cookie `token`, then cookie `auth_token`
//! 3. `?token=` query parameter
//!
//! If none is present the socket is upgraded anyway and the client must
//! send an `auth` frame first (see [`crate::transport::ws`]).
//!
//! # Authorization
//!
//! The hub does not decide access. Tokens are minted by the API after its
//! own owner/collaborator check and may list the projects they grant; the
//! [`JwtAuthorizer`] only verifies the signature, expiry and that list.

use crate::errors::CollabError;
use crate::hub::Participant;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Cookie names that may carry the access token.
pub const TOKEN_COOKIES: [&str; 2] = ["token", "auth_token"];

/// Display colors assigned to participants.
pub const PARTICIPANT_COLORS: [&str; 12] = [
    "#E57373", "#F06292", "#BA68C8", "#9575CD", "#7986CB", "#64B5F6", "#4FC3F7", "#4DD0E1",
    "#4DB6AC", "#81C784", "#FFB74D", "#A1887F",
];

/// Find the access token in the upgrade request.
#[must_use]
pub fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    let cookie_header = headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok());
    if let Some(cookie_header) = cookie_header {
        for name in TOKEN_COOKIES {
            let found = cookie::Cookie::split_parse(cookie_header)
                .flatten()
                .find(|c| c.name() == name && !c.value().is_empty());
            if let Some(c) = found {
                return Some(c.value().to_string());
            }
        }
    }

    query_token
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
}

/// Deterministic display color for a user.
#[must_use]
pub fn color_for(user_id: Uuid) -> String {
    let len = PARTICIPANT_COLORS.len() as u128;
    let index = usize::try_from(user_id.as_u128() % len).unwrap_or(0);
    PARTICIPANT_COLORS
        .get(index)
        .copied()
        .unwrap_or("#9E9E9E")
        .to_string()
}

/// Turns a token into an authorized participant for one project.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// # Errors
    ///
    /// `CollabError::Unauthorized` for a bad or expired token,
    /// `CollabError::Forbidden` if the token does not grant `project_id`.
    async fn authorize(&self, token: &str, project_id: Uuid) -> Result<Participant, CollabError>;
}

/// Access token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: Uuid,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Expiry (seconds since epoch).
    pub exp: i64,
    /// Projects this token grants; absent means no restriction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projects: Option<Vec<Uuid>>,
}

/// HS256 access token verifier.
pub struct JwtAuthorizer {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthorizer {
    #[must_use]
    pub fn new(secret: &SecretString) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            decoding_key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl Authorizer for JwtAuthorizer {
    async fn authorize(&self, token: &str, project_id: Uuid) -> Result<Participant, CollabError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                debug!(target: "collab.transport.auth", error = %e, "Token rejected");
                CollabError::Unauthorized(format!("token validation failed: {e}"))
            })?
            .claims;

        if let Some(projects) = &claims.projects {
            if !projects.contains(&project_id) {
                return Err(CollabError::Forbidden(
                    "token does not grant this project".to_string(),
                ));
            }
        }

        let display_name = claims
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| {
                let id = claims.sub.simple().to_string();
                format!("User {}", id.get(..8).unwrap_or(&id))
            });

        Ok(Participant {
            user_id: claims.sub,
            display_name,
            color: color_for(claims.sub),
        })
    }
}
