//! Token encryption module using AES-256-GCM
//!
//! Access and refresh tokens are stored encrypted at rest with AES-256-GCM.
//! The additional authenticated data (AAD) binds each ciphertext to the
//! owning user, provider and external account, so a ciphertext copied onto
//! another row fails to decrypt.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::models::connection::Model as ConnectionModel;

const VERSION_ENCRYPTED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

/// Crypto error types
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("empty ciphertext")]
    EmptyCiphertext,
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct ZeroizingKey(Vec<u8>);

/// Type alias for crypto keys
pub type CryptoKey = ZeroizingKey;

impl CryptoKey {
    /// Create a new crypto key from bytes
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::EncryptionFailed(
                "Invalid key length: expected 32 bytes".to_string(),
            ));
        }
        Ok(ZeroizingKey(bytes))
    }

    /// Get the key as bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// An opaque bearer token that never leaves the process unredacted.
///
/// The inner string is zeroized on drop and excluded from `Debug` output.
/// Callers reach the raw value only through [`SecretToken::expose`], which
/// keeps accidental logging of token material greppable.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretToken(String);

impl SecretToken {
    pub fn new(value: impl Into<String>) -> Self {
        SecretToken(value.into())
    }

    /// Access the raw token value.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretToken(****)")
    }
}

impl From<String> for SecretToken {
    fn from(value: String) -> Self {
        SecretToken(value)
    }
}

/// Encrypt bytes using AES-256-GCM
pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    // Layout: version byte, 12-byte nonce, ciphertext + tag
    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_ENCRYPTED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

/// Decrypt bytes using AES-256-GCM
pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }

    if ciphertext[0] != VERSION_ENCRYPTED || ciphertext.len() < MIN_ENCRYPTED_LEN {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let ct_and_tag = &ciphertext[VERSION_FIELD_LEN + NONCE_LEN..];

    debug_assert!(ct_and_tag.len() >= TAG_LEN);

    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ct_and_tag,
                aad,
            },
        )
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// AAD string binding a ciphertext to its connection row.
fn connection_aad(user_id: &uuid::Uuid, provider_slug: &str, external_id: &str) -> String {
    format!("{}|{}|{}", user_id, provider_slug, external_id)
}

/// Type alias for encrypted token pair result
type EncryptedTokens = Result<(Option<Vec<u8>>, Option<Vec<u8>>), CryptoError>;

/// Encrypt an access/refresh token pair for storage on a connection row.
pub fn seal_connection_tokens(
    key: &CryptoKey,
    user_id: &uuid::Uuid,
    provider_slug: &str,
    external_id: &str,
    access_token: Option<&SecretToken>,
    refresh_token: Option<&SecretToken>,
) -> EncryptedTokens {
    let aad = connection_aad(user_id, provider_slug, external_id);

    let access_ciphertext = access_token
        .map(|token| encrypt_bytes(key, aad.as_bytes(), token.expose().as_bytes()))
        .transpose()?;

    let refresh_ciphertext = refresh_token
        .map(|token| encrypt_bytes(key, aad.as_bytes(), token.expose().as_bytes()))
        .transpose()?;

    Ok((access_ciphertext, refresh_ciphertext))
}

/// Type alias for decrypted token pair result
type OpenedTokens = Result<(Option<SecretToken>, Option<SecretToken>), CryptoError>;

/// Decrypt the token pair stored on a connection row.
pub fn open_connection_tokens(key: &CryptoKey, connection: &ConnectionModel) -> OpenedTokens {
    let aad = connection_aad(
        &connection.user_id,
        &connection.provider_slug,
        &connection.external_id,
    );

    let open = |ciphertext: Option<&Vec<u8>>| -> Result<Option<SecretToken>, CryptoError> {
        match ciphertext {
            Some(bytes) => decrypt_bytes(key, aad.as_bytes(), bytes).and_then(|plain| {
                String::from_utf8(plain)
                    .map(SecretToken::new)
                    .map(Some)
                    .map_err(|e| CryptoError::DecryptionFailed(format!("Invalid UTF-8: {}", e)))
            }),
            None => Ok(None),
        }
    };

    let access = open(connection.access_token_ciphertext.as_ref())?;
    let refresh = open(connection.refresh_token_ciphertext.as_ref())?;

    Ok((access, refresh))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::connection::ConnectionStatus;
    use chrono::Utc;
    use uuid::Uuid;

    fn test_key() -> CryptoKey {
        CryptoKey::new(vec![0u8; 32]).expect("valid test key")
    }

    fn sample_connection(
        access_token_ciphertext: Option<Vec<u8>>,
        refresh_token_ciphertext: Option<Vec<u8>>,
    ) -> ConnectionModel {
        ConnectionModel {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            provider_slug: "test-provider".to_string(),
            external_id: "external-123".to_string(),
            display_name: None,
            status: ConnectionStatus::Connected,
            access_token_ciphertext,
            refresh_token_ciphertext,
            token_expires_at: None,
            scopes: None,
            consecutive_errors: 0,
            retry_count: 0,
            backoff_delay_seconds: 0,
            last_sync_at: None,
            success_rate: 1.0,
            avg_response_ms: 0.0,
            created_at: Utc::now().into(),
            updated_at: Utc::now().into(),
        }
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = test_key();
        let aad = b"test-aad";
        let plaintext = b"secret message";

        let encrypted = encrypt_bytes(&key, aad, plaintext).expect("encryption succeeds");
        let decrypted = decrypt_bytes(&key, aad, &encrypted).expect("decryption succeeds");

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_different_aad_fails() {
        let key = test_key();
        let plaintext = b"secret message";

        let encrypted = encrypt_bytes(&key, b"aad-1", plaintext).expect("encryption succeeds");
        let result = decrypt_bytes(&key, b"aad-2", &encrypted);

        assert!(result.is_err());
    }

    #[test]
    fn test_modified_ciphertext_fails() {
        let key = test_key();
        let aad = b"test-aad";

        let mut encrypted = encrypt_bytes(&key, aad, b"secret message").expect("encryption succeeds");
        encrypted[13] ^= 0x01;

        let result = decrypt_bytes(&key, aad, &encrypted);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_plaintext_works() {
        let key = test_key();
        let aad = b"test-aad";

        let encrypted = encrypt_bytes(&key, aad, b"").expect("encryption succeeds");
        let decrypted = decrypt_bytes(&key, aad, &encrypted).expect("decryption succeeds");

        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_nonce_uniqueness() {
        let key = test_key();
        let aad = b"test-aad";
        let plaintext = b"secret message";

        let encrypted1 = encrypt_bytes(&key, aad, plaintext).expect("encryption succeeds");
        let encrypted2 = encrypt_bytes(&key, aad, plaintext).expect("encryption succeeds");

        // Nonces (bytes 1-13) should be different
        assert_ne!(&encrypted1[1..13], &encrypted2[1..13]);
        let decrypted1 = decrypt_bytes(&key, aad, &encrypted1).expect("decryption succeeds");
        let decrypted2 = decrypt_bytes(&key, aad, &encrypted2).expect("decryption succeeds");
        assert_eq!(decrypted1, plaintext);
        assert_eq!(decrypted2, plaintext);
    }

    #[test]
    fn test_unversioned_payload_rejected() {
        let key = test_key();
        let result = decrypt_bytes(&key, b"test-aad", b"raw-plaintext-token");
        assert!(matches!(result, Err(CryptoError::InvalidFormat)));
    }

    #[test]
    fn test_invalid_key_length_rejected() {
        assert!(CryptoKey::new(vec![0u8; 16]).is_err());
        assert!(CryptoKey::new(vec![0u8; 64]).is_err());
        assert!(CryptoKey::new(vec![0u8; 32]).is_ok());
    }

    #[test]
    fn test_insufficient_ciphertext_length() {
        let key = test_key();
        let short_ciphertext = vec![VERSION_ENCRYPTED, 0x02];

        let result = decrypt_bytes(&key, b"test-aad", &short_ciphertext);
        assert!(matches!(result, Err(CryptoError::InvalidFormat)));
    }

    #[test]
    fn test_secret_token_debug_is_redacted() {
        let token = SecretToken::new("super-secret");
        assert_eq!(format!("{:?}", token), "SecretToken(****)");
        assert_eq!(token.expose(), "super-secret");
    }

    #[test]
    fn test_connection_token_seal_and_open() {
        let key = test_key();
        let connection = sample_connection(None, None);

        let access = SecretToken::new("access-token");
        let refresh = SecretToken::new("refresh-token");
        let (access_ct, refresh_ct) = seal_connection_tokens(
            &key,
            &connection.user_id,
            &connection.provider_slug,
            &connection.external_id,
            Some(&access),
            Some(&refresh),
        )
        .expect("sealing succeeds");

        let mut connection = connection;
        connection.access_token_ciphertext = access_ct;
        connection.refresh_token_ciphertext = refresh_ct;

        let (opened_access, opened_refresh) =
            open_connection_tokens(&key, &connection).expect("opening succeeds");
        assert_eq!(opened_access.unwrap().expose(), "access-token");
        assert_eq!(opened_refresh.unwrap().expose(), "refresh-token");
    }

    #[test]
    fn test_ciphertext_bound_to_owning_row() {
        let key = test_key();
        let source = sample_connection(None, None);
        let token = SecretToken::new("access-token");

        let (access_ct, _) = seal_connection_tokens(
            &key,
            &source.user_id,
            &source.provider_slug,
            &source.external_id,
            Some(&token),
            None,
        )
        .expect("sealing succeeds");

        // Same ciphertext on a row owned by a different user must not open.
        let mut other = sample_connection(access_ct, None);
        other.provider_slug = source.provider_slug.clone();
        other.external_id = source.external_id.clone();

        assert!(open_connection_tokens(&key, &other).is_err());
    }
}
