use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrossplaneError {
    #[error(transparent)]
    Exec(#[from] nimbus_exec::ExecError),

    #[error(transparent)]
    Render(#[from] nimbus_render::RenderError),

    #[error(transparent)]
    Provider(#[from] nimbus_provider::ProviderError),
}

pub type Result<T> = std::result::Result<T, CrossplaneError>;
