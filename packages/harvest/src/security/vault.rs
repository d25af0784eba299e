//! Decryption of stored API keys.

use crate::error::SecurityResult;
use crate::security::SecretString;

/// Decrypts API keys saved with a user's custom backend configuration.
///
/// Keys are stored encrypted at rest; the chain resolver calls this lazily,
/// only when the saved configuration is actually needed.
#[cfg_attr(test, mockall::automock)]
pub trait KeyVault: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> SecurityResult<SecretString>;
}

/// Vault for deployments that store keys unencrypted (local development).
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextVault;

impl KeyVault for PlaintextVault {
    fn decrypt(&self, ciphertext: &str) -> SecurityResult<SecretString> {
        Ok(SecretString::new(ciphertext))
    }
}
