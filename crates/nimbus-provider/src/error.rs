use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The cloud rejected our credentials.
    #[error("provider authentication failed: {0}")]
    Auth(String),

    /// A cloud API call failed after the transport-level retries.
    #[error("provider API error: {0}")]
    Api(String),

    /// A credential the capability needs is missing from the bundle.
    #[error("missing credential: {0}")]
    MissingCredential(String),

    /// A field we depend on had an unexpected shape.
    #[error("unexpected {what}: {value:?}")]
    Unexpected { what: &'static str, value: String },

    #[error(transparent)]
    Exec(#[from] nimbus_exec::ExecError),

    #[error(transparent)]
    Render(#[from] nimbus_render::RenderError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, ProviderError>;
