use std::sync::Arc;

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    Auth, ClientHandle, HmacUrlSigner, MemoryDatabase, NoopNotifier, OutboundMessage, PrimaryKey,
    ShutterContext,
};

pub const TOKEN_SECRET: &str = "test-token-secret";
pub const SYSTEM_SECRET: [u8; 32] = [7; 32];

#[derive(Serialize)]
struct Claims {
    id: PrimaryKey,
    exp: i64,
}

/// Mints a bearer token the way the account service would
pub fn bearer(user_id: PrimaryKey) -> String {
    bearer_signed(user_id, TOKEN_SECRET)
}

pub fn bearer_signed(user_id: PrimaryKey, secret: &str) -> String {
    let claims = Claims {
        id: user_id,
        exp: (Utc::now() + Duration::hours(1)).timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("token encodes")
}

/// Encrypts a system token the way a trusted peer would
pub fn encrypt_system_token(token: &str) -> String {
    let cipher = Aes256Gcm::new_from_slice(&SYSTEM_SECRET).expect("key length is valid");

    let nonce_bytes = [9u8; 12];
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut payload = nonce.to_vec();
    let ciphertext = cipher
        .encrypt(nonce, token.as_bytes())
        .expect("token encrypts");
    payload.extend(ciphertext);

    BASE64.encode(payload)
}

/// Builds a fully wired context around an in-memory database
pub fn context(db: MemoryDatabase) -> ShutterContext<MemoryDatabase> {
    let database = Arc::new(db);
    let auth = Arc::new(Auth::new(
        &database,
        TOKEN_SECRET.to_string(),
        SYSTEM_SECRET.to_vec(),
    ));

    ShutterContext {
        database,
        auth,
        notifier: Arc::new(NoopNotifier),
        media: Arc::new(HmacUrlSigner::new("http://localhost:9000/media", "test", 60)),
    }
}

/// A client handle along with the receiving end of its channel
pub fn handle() -> (ClientHandle, mpsc::UnboundedReceiver<OutboundMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();

    (ClientHandle::new(tx), rx)
}
