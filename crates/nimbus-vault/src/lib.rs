//! Encrypted secrets vault
//!
//! Decrypts the operator's vault file, merges it with inline descriptor
//! credentials and the environment, and re-emits the vault with the
//! inline credentials absorbed so they never stay on disk in plaintext.

pub mod error;
pub mod secrets;
pub mod vault;

pub use error::{Result, VaultError};
pub use secrets::{
    ensure_secrets_file, strip_descriptor_credentials, AddonCreds, CloudCreds, CredentialsBundle,
    Secrets, SecretsFile,
};
pub use vault::{decrypt, encrypt};
