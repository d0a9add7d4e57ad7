//! Account credentials for private Orderly sessions
//!
//! Orderly authenticates WebSocket sessions with an Ed25519 key pair. The
//! key and secret are distributed as base58 strings, optionally prefixed
//! with `ed25519:`. The login handshake signs the current millisecond
//! timestamp with the secret key and submits the signature base64-encoded.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ring::signature::Ed25519KeyPair;

use crate::error::{Error, Result};

const KEY_PREFIX: &str = "ed25519:";

/// Immutable holder of an account identifier and its Ed25519 signing key
pub struct Credentials {
    account_id: String,
    orderly_key: String,
    key_pair: Ed25519KeyPair,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("account_id", &self.account_id)
            .field("orderly_key", &self.orderly_key)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Create credentials from an account id, an Orderly key (base58 public
    /// key) and an Orderly secret (base58 private key).
    ///
    /// Both key strings may carry the `ed25519:` prefix; it is stripped.
    /// The first 32 bytes of the decoded secret are used as the signing
    /// seed.
    pub fn new(
        account_id: impl Into<String>,
        orderly_key: &str,
        orderly_secret: &str,
    ) -> Result<Self> {
        let orderly_key = orderly_key
            .strip_prefix(KEY_PREFIX)
            .unwrap_or(orderly_key)
            .to_string();
        let secret = orderly_secret.strip_prefix(KEY_PREFIX).unwrap_or(orderly_secret);

        let seed = bs58::decode(secret)
            .into_vec()
            .map_err(|e| Error::Credentials(format!("invalid base58 secret: {e}")))?;
        if seed.len() < 32 {
            return Err(Error::Credentials(format!(
                "secret must decode to at least 32 bytes, got {}",
                seed.len()
            )));
        }

        let key_pair = Ed25519KeyPair::from_seed_unchecked(&seed[..32])
            .map_err(|e| Error::Credentials(format!("invalid signing key: {e}")))?;

        Ok(Self {
            account_id: account_id.into(),
            orderly_key,
            key_pair,
        })
    }

    /// The account identifier this key belongs to
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// The public key in the `ed25519:<base58>` form the server expects
    pub fn orderly_key(&self) -> String {
        format!("{KEY_PREFIX}{}", self.orderly_key)
    }

    /// Sign a millisecond timestamp, returning the base64 signature
    pub fn sign_timestamp(&self, timestamp_ms: u64) -> String {
        let signature = self.key_pair.sign(timestamp_ms.to_string().as_bytes());
        BASE64.encode(signature)
    }
}
