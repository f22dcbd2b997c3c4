//! Secrets - Trait abstracting the encryption of secret config and state values
//!
//! Real secrets providers (passphrase, cloud KMS, ...) live outside this
//! workspace. The backend only records which provider a snapshot was written
//! with, so stacks can be loaded and listed without decrypting anything.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use thiserror::Error;

/// Error type for secrets operations
#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("failed to decrypt value: {0}")]
    Decrypt(String),

    #[error("failed to encrypt value: {0}")]
    Encrypt(String),
}

pub type SecretsResult<T> = Result<T, SecretsError>;

/// A secrets manager encrypts and decrypts secret values for one stack
pub trait SecretsManager: Send + Sync {
    /// Provider type recorded in snapshots (e.g., "passphrase")
    fn type_name(&self) -> &str;

    /// Provider configuration recorded in snapshots, if any
    fn state(&self) -> Option<Value>;

    fn encrypt(&self, plaintext: &str) -> SecretsResult<String>;

    fn decrypt(&self, ciphertext: &str) -> SecretsResult<String>;
}

/// Secrets manager that only base64-encodes values
///
/// Provides no confidentiality. Used for stacks created without a configured
/// secrets provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64SecretsManager;

impl SecretsManager for Base64SecretsManager {
    fn type_name(&self) -> &str {
        "b64"
    }

    fn state(&self) -> Option<Value> {
        None
    }

    fn encrypt(&self, plaintext: &str) -> SecretsResult<String> {
        Ok(STANDARD.encode(plaintext))
    }

    fn decrypt(&self, ciphertext: &str) -> SecretsResult<String> {
        let bytes = STANDARD
            .decode(ciphertext)
            .map_err(|e| SecretsError::Decrypt(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| SecretsError::Decrypt(e.to_string()))
    }
}
