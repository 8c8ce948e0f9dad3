use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    /// A template failed to resolve or render.
    #[error("template {name}: {source}")]
    Template {
        name: String,
        #[source]
        source: minijinja::Error,
    },
}

pub type Result<T> = std::result::Result<T, RenderError>;
