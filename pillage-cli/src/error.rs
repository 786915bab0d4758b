use thiserror::Error;

#[derive(Error, Debug)]
pub enum PilregError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Registry(#[from] pillage::RegistryError),
}

pub type Result<T> = std::result::Result<T, PilregError>;
