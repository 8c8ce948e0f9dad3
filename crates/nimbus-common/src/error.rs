use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommonError {
    /// The descriptor file could not be read.
    #[error("cannot read cluster descriptor {path}: {source}")]
    DescriptorRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The descriptor file is not well-formed YAML for the expected schema.
    #[error("invalid cluster descriptor: {0}")]
    InvalidDescriptor(String),

    /// Cross-field validation failed. Every offending field is listed.
    #[error("descriptor validation failed: {}", .0.join("; "))]
    ValidationFailed(Vec<String>),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, CommonError>;
