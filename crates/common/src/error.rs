//! Error types for shared chat types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing routing header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid routing header {name}: {value}")]
    InvalidHeader { name: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, Error>;
