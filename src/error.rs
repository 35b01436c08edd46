// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid file pattern: {0}")]
    InvalidPattern(String),

    #[error("Channel transaction error: {0}")]
    Channel(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Source is not running")]
    NotRunning,
}

pub type Result<T> = std::result::Result<T, Error>;
