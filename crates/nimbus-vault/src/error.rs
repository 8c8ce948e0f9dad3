use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    /// The passphrase did not authenticate the vault (GCM tag mismatch).
    #[error("vault passphrase is incorrect")]
    BadPassphrase,

    /// The vault file does not carry the expected header or payload shape.
    #[error("malformed vault file: {0}")]
    Malformed(String),

    /// A credential required by the descriptor's provider is absent.
    #[error("missing secret: {0}")]
    MissingSecret(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, VaultError>;
