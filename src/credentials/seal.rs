use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SealError {
    #[error("token key must be {expected} hex characters")]
    KeyLength { expected: usize },

    #[error("token key is not valid hex")]
    KeyEncoding,

    #[error("unsupported token envelope version {0}")]
    Version(u8),

    #[error("token envelope is corrupt: {0}")]
    Corrupt(String),

    #[error("token encryption failed")]
    Crypto,
}

#[derive(Debug, Serialize, Deserialize)]
struct SealedEnvelope {
    v: u8,
    nonce: String,
    ciphertext: String,
}

/// AES-256-GCM sealing for tokens stored in the tenants table.
pub struct TokenSeal {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl std::fmt::Debug for TokenSeal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenSeal(..)")
    }
}

impl TokenSeal {
    pub fn from_hex(raw: &str) -> Result<Self, SealError> {
        let bytes = decode_hex(raw.trim())?;
        let key: [u8; KEY_BYTES] = bytes.try_into().map_err(|_| SealError::KeyLength {
            expected: KEY_BYTES * 2,
        })?;
        Self::from_key(&key)
    }

    pub fn from_key(key: &[u8; KEY_BYTES]) -> Result<Self, SealError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key).map_err(|_| SealError::Crypto)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, SealError> {
        let mut nonce_bytes = [0u8; NONCE_BYTES];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| SealError::Crypto)?;

        let mut buffer = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut buffer,
            )
            .map_err(|_| SealError::Crypto)?;

        let envelope = SealedEnvelope {
            v: ENVELOPE_VERSION,
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(&buffer),
        };
        serde_json::to_string(&envelope).map_err(|e| SealError::Corrupt(e.to_string()))
    }

    /// Values that are not an envelope are legacy plaintext and pass through.
    pub fn open(&self, stored: &str) -> Result<String, SealError> {
        let Some(envelope) = parse_envelope(stored) else {
            return Ok(stored.to_string());
        };
        if envelope.v != ENVELOPE_VERSION {
            return Err(SealError::Version(envelope.v));
        }

        let nonce_bytes: [u8; NONCE_BYTES] = BASE64
            .decode(envelope.nonce.as_bytes())
            .map_err(|e| SealError::Corrupt(format!("nonce: {e}")))?
            .try_into()
            .map_err(|_| SealError::Corrupt("nonce length".to_string()))?;
        let mut buffer = BASE64
            .decode(envelope.ciphertext.as_bytes())
            .map_err(|e| SealError::Corrupt(format!("ciphertext: {e}")))?;

        let plaintext = self
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut buffer,
            )
            .map_err(|_| SealError::Crypto)?;
        String::from_utf8(plaintext.to_vec()).map_err(|e| SealError::Corrupt(e.to_string()))
    }
}

pub fn is_sealed(stored: &str) -> bool {
    parse_envelope(stored).is_some()
}

fn parse_envelope(stored: &str) -> Option<SealedEnvelope> {
    let trimmed = stored.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn decode_hex(raw: &str) -> Result<Vec<u8>, SealError> {
    if raw.len() != KEY_BYTES * 2 {
        return Err(SealError::KeyLength {
            expected: KEY_BYTES * 2,
        });
    }
    raw.as_bytes()
        .chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair).map_err(|_| SealError::KeyEncoding)?;
            u8::from_str_radix(text, 16).map_err(|_| SealError::KeyEncoding)
        })
        .collect()
}
