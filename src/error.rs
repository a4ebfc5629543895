use thiserror::Error;

use crate::model::{TensorId, Tier};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Failed to allocate tensor {name} (id {tensor}) in {tier} memory: {size} bytes requested")]
    AllocationFailed {
        tensor: TensorId,
        name: String,
        tier: Tier,
        size: u64,
    },

    #[error("Workspace size search failed: {0}")]
    WorkspaceSearchFailed(String),

    #[error("Invalid allocator configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),
}
