use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("wire protocol error: {0}")]
    Wire(String),

    #[error("cache error: {0}")]
    Cache(#[from] tiered_cache::TieredCacheError),
}

pub type GatewayResult<T> = Result<T, GatewayError>;
