//! Credential sealing.
//!
//! Secrets are stored sealed and only unsealed in memory when a worker is
//! launched. The cipher is a SHA-256 keystream XOR with a random per-value
//! nonce; the key itself comes from the environment or a generated key
//! file. Key management beyond that (rotation, KMS) is an external concern
//! behind this `seal`/`unseal` pair.

use std::fs;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::common::error::{HarvestError, Result};
use crate::domain::{RedditCredentials, SealedCredentials};

const KEY_ENV: &str = "REDHARVEST_SEAL_KEY";
const KEY_FILE_ENV: &str = "REDHARVEST_SEAL_KEY_FILE";
const DEFAULT_KEY_FILE: &str = ".redharvest_key";
const NONCE_LEN: usize = 16;

#[derive(Clone)]
pub struct Sealer {
    key: [u8; 32],
}

impl Sealer {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Resolve the sealing key: `REDHARVEST_SEAL_KEY` (hex) wins, then the
    /// key file, which is generated on first use.
    pub fn from_env() -> Result<Self> {
        if let Ok(hex_key) = std::env::var(KEY_ENV) {
            let bytes = hex::decode(hex_key.trim())
                .map_err(|e| HarvestError::Seal(format!("invalid {KEY_ENV}: {e}")))?;
            let key: [u8; 32] = bytes
                .try_into()
                .map_err(|_| HarvestError::Seal(format!("{KEY_ENV} must be 32 hex-encoded bytes")))?;
            return Ok(Self::new(key));
        }

        let path = std::env::var(KEY_FILE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_KEY_FILE));
        if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let bytes = hex::decode(raw.trim())
                .map_err(|e| HarvestError::Seal(format!("corrupt key file {}: {e}", path.display())))?;
            let key: [u8; 32] = bytes
                .try_into()
                .map_err(|_| HarvestError::Seal(format!("key file {} must hold 32 bytes", path.display())))?;
            Ok(Self::new(key))
        } else {
            let key = generate_key();
            fs::write(&path, hex::encode(key))?;
            tracing::info!(path = %path.display(), "generated new sealing key");
            Ok(Self::new(key))
        }
    }

    /// Seal a secret. Output is hex of `nonce || plaintext XOR keystream`.
    pub fn seal(&self, plaintext: &str) -> String {
        let nonce = Uuid::new_v4();
        let nonce_bytes = nonce.as_bytes();
        let mut out = Vec::with_capacity(NONCE_LEN + plaintext.len());
        out.extend_from_slice(nonce_bytes);
        out.extend(
            plaintext
                .bytes()
                .zip(self.keystream(nonce_bytes))
                .map(|(p, k)| p ^ k),
        );
        hex::encode(out)
    }

    pub fn unseal(&self, sealed: &str) -> Result<String> {
        let raw = hex::decode(sealed)
            .map_err(|e| HarvestError::Seal(format!("sealed value is not hex: {e}")))?;
        if raw.len() < NONCE_LEN {
            return Err(HarvestError::Seal("sealed value too short".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plain: Vec<u8> = ciphertext
            .iter()
            .zip(self.keystream(nonce))
            .map(|(c, k)| c ^ k)
            .collect();
        String::from_utf8(plain)
            .map_err(|_| HarvestError::Seal("unsealed bytes are not valid UTF-8".into()))
    }

    fn keystream<'a>(&'a self, nonce: &'a [u8]) -> impl Iterator<Item = u8> + 'a {
        (0u64..).flat_map(move |block| {
            let mut hasher = Sha256::new();
            hasher.update(self.key);
            hasher.update(nonce);
            hasher.update(block.to_le_bytes());
            hasher.finalize().to_vec()
        })
    }
}

fn generate_key() -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(Uuid::new_v4().as_bytes());
    hasher.update(Uuid::new_v4().as_bytes());
    hasher.finalize().into()
}

/// Username and user agent stay readable so the control plane can display
/// which account a scraper runs under.
pub fn seal_credentials(sealer: &Sealer, creds: &RedditCredentials) -> SealedCredentials {
    SealedCredentials {
        client_id: sealer.seal(&creds.client_id),
        client_secret: sealer.seal(&creds.client_secret),
        username: creds.username.clone(),
        password: sealer.seal(&creds.password),
        user_agent: creds.user_agent.clone(),
    }
}

pub fn unseal_credentials(sealer: &Sealer, sealed: &SealedCredentials) -> Result<RedditCredentials> {
    Ok(RedditCredentials {
        client_id: sealer.unseal(&sealed.client_id)?,
        client_secret: sealer.unseal(&sealed.client_secret)?,
        username: sealed.username.clone(),
        password: sealer.unseal(&sealed.password)?,
        user_agent: sealed.user_agent.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealer() -> Sealer {
        Sealer::new([7u8; 32])
    }

    #[test]
    fn seal_roundtrip() {
        let s = sealer();
        let sealed = s.seal("hunter2");
        assert_ne!(sealed, "hunter2");
        assert_eq!(s.unseal(&sealed).unwrap(), "hunter2");
    }

    #[test]
    fn seal_handles_long_and_empty_values() {
        let s = sealer();
        let long = "x".repeat(500);
        assert_eq!(s.unseal(&s.seal(&long)).unwrap(), long);
        assert_eq!(s.unseal(&s.seal("")).unwrap(), "");
    }

    #[test]
    fn unseal_rejects_garbage() {
        let s = sealer();
        assert!(s.unseal("not-hex!").is_err());
        assert!(s.unseal("abcd").is_err());
    }

    #[test]
    fn wrong_key_does_not_roundtrip() {
        let sealed = sealer().seal("secret");
        let other = Sealer::new([9u8; 32]);
        match other.unseal(&sealed) {
            Ok(plain) => assert_ne!(plain, "secret"),
            Err(_) => {}
        }
    }

    #[test]
    fn credentials_keep_display_fields_plain() {
        let s = sealer();
        let creds = RedditCredentials {
            client_id: "id".into(),
            client_secret: "sec".into(),
            username: "alice".into(),
            password: "pw".into(),
            user_agent: "redharvest/0.3 by alice".into(),
        };
        let sealed = seal_credentials(&s, &creds);
        assert_eq!(sealed.username, "alice");
        assert_eq!(sealed.user_agent, creds.user_agent);
        assert_ne!(sealed.password, "pw");
        let back = unseal_credentials(&s, &sealed).unwrap();
        assert_eq!(back.client_secret, "sec");
        assert_eq!(back.password, "pw");
    }
}
