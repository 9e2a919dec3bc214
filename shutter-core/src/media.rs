use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Turns stored object keys into urls clients can fetch
pub trait UrlSigner: Send + Sync {
    fn signed_url(&self, key: &str) -> String;
}

/// Signs expiring urls the media gateway can verify without a lookup
pub struct HmacUrlSigner {
    base_url: String,
    secret: String,
    ttl: Duration,
}

impl HmacUrlSigner {
    pub fn new(base_url: &str, secret: &str, ttl_seconds: i64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            secret: secret.to_string(),
            ttl: Duration::seconds(ttl_seconds),
        }
    }
}

impl UrlSigner for HmacUrlSigner {
    fn signed_url(&self, key: &str) -> String {
        let expires = (Utc::now() + self.ttl).timestamp();

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");

        mac.update(format!("{key}:{expires}").as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        format!(
            "{}/{key}?expires={expires}&signature={signature}",
            self.base_url
        )
    }
}
