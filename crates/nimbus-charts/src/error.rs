use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChartError {
    /// The chart repository answered, but no tag matched any version class.
    #[error("no chart version matching a known pattern in {repo}")]
    NoVersion { repo: String },

    /// A chart is listed twice in the same namespace.
    #[error("chart {name} appears more than once in namespace {namespace}")]
    DuplicateChart { name: String, namespace: String },

    #[error("chart repository error: {0}")]
    Repo(String),

    #[error(transparent)]
    Exec(#[from] nimbus_exec::ExecError),

    #[error(transparent)]
    Render(#[from] nimbus_render::RenderError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, ChartError>;
