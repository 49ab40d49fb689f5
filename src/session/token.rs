//! Confirmation tokens.
//!
//! A token is 32 random bytes, hex-encoded and handed to the caller once.
//! Only its SHA-256 digest is kept, together with the fingerprint of the
//! command it confirms.

use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

const TOKEN_BYTES: usize = 32;

pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.trim().as_bytes()))
}

#[derive(Debug, Clone)]
pub(crate) struct PendingConfirmation {
    pub digest: String,
    /// Digest of the command the token confirms.
    pub fingerprint: String,
    pub expires_at: Instant,
}

impl PendingConfirmation {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_random_hex() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), TOKEN_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_digest_is_stable_and_not_the_token() {
        let t = generate_token();
        assert_eq!(token_digest(&t), token_digest(&t));
        assert_eq!(token_digest(&t), token_digest(&format!(" {t}\n")));
        assert_ne!(token_digest(&t), t);
        assert_eq!(token_digest(&t).len(), 64);
    }
}
