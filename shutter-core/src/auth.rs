use std::sync::Arc;

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

use crate::{Database, DatabaseError, PrimaryKey, UserData};

/// The first bytes of an encrypted system token
const NONCE_LENGTH: usize = 12;

/// Verifies the credentials that clients and trusted peers present.
pub struct Auth<Db> {
    db: Arc<Db>,
    token_secret: String,
    system_secret: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// The credential is missing, malformed, expired, or signed with the wrong key
    #[error("Invalid credentials")]
    InvalidCredentials,
    /// Something else went wrong with the database
    #[error(transparent)]
    Db(DatabaseError),
}

/// Claims carried by the bearer tokens the account service issues
#[derive(Debug, Deserialize)]
struct TokenClaims {
    id: PrimaryKey,
}

impl<Db> Auth<Db>
where
    Db: Database,
{
    pub fn new(db: &Arc<Db>, token_secret: String, system_secret: Vec<u8>) -> Self {
        Self {
            db: db.clone(),
            token_secret,
            system_secret,
        }
    }

    /// Verifies a bearer token and resolves the account it belongs to
    pub async fn resolve_credential(&self, credential: &str) -> Result<UserData, AuthError> {
        let token = credential.strip_prefix("Bearer ").unwrap_or(credential);

        let claims = decode::<TokenClaims>(
            token,
            &DecodingKey::from_secret(self.token_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| AuthError::InvalidCredentials)?
        .claims;

        self.db.user_by_id(claims.id).await.map_err(|e| match e {
            DatabaseError::NotFound { .. } => AuthError::InvalidCredentials,
            e => AuthError::Db(e),
        })
    }

    /// Decrypts an encrypted system token, without checking it against the
    /// trusted set. Used when only the token's identity is needed.
    pub fn decrypt_system_token(&self, credential: &str) -> Result<String, AuthError> {
        let raw = BASE64
            .decode(credential)
            .map_err(|_| AuthError::InvalidCredentials)?;

        if raw.len() <= NONCE_LENGTH {
            return Err(AuthError::InvalidCredentials);
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LENGTH);

        let cipher = Aes256Gcm::new_from_slice(&self.system_secret)
            .map_err(|_| AuthError::InvalidCredentials)?;

        let plain = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AuthError::InvalidCredentials)?;

        String::from_utf8(plain).map_err(|_| AuthError::InvalidCredentials)
    }

    /// Decrypts a system token and requires it to be in the trusted set
    pub async fn resolve_system_credential(&self, credential: &str) -> Result<String, AuthError> {
        let token = self.decrypt_system_token(credential)?;

        self.db.system_token(&token).await.map_err(|e| match e {
            DatabaseError::NotFound { .. } => AuthError::InvalidCredentials,
            e => AuthError::Db(e),
        })?;

        Ok(token)
    }
}
