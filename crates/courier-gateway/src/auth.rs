use std::sync::Arc;

use jsonwebtoken::{DecodingKey, Validation, decode};
use thiserror::Error;

use courier_db::Database;
use courier_types::api::Claims;
use courier_types::models::UserOut;

use crate::store::run_blocking;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no bearer token supplied")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("token subject no longer exists")]
    UnknownUser,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Turns a bearer credential into a user identity.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Check signature and expiry only.
    pub fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.key, &Validation::default())?;
        Ok(data.claims)
    }

    /// Full verification: valid token whose subject still exists.
    pub async fn verify(&self, db: &Arc<Database>, token: Option<&str>) -> Result<UserOut, AuthError> {
        let token = token.filter(|t| !t.is_empty()).ok_or(AuthError::MissingToken)?;
        let claims = self.decode(token)?;

        let user_id = claims.sub;
        let user = run_blocking(db, move |db| db.get_user_by_id(user_id)).await?;
        user.map(|row| row.into_out()).ok_or(AuthError::UnknownUser)
    }
}
