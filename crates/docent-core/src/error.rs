use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Catalogue file error: {0}")]
    CatalogIo(#[from] std::io::Error),
    #[error("Catalogue document is malformed: {0}")]
    CatalogShape(String),
    #[error("Control message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}
