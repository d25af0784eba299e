//! Security primitives: secret handling, SSRF protection and key decryption.

mod credentials;
mod url_validator;
mod vault;

pub use credentials::SecretString;
pub use url_validator::UrlValidator;
pub use vault::{KeyVault, PlaintextVault};

#[cfg(test)]
pub use vault::MockKeyVault;
