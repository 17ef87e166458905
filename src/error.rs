use std::io;
use thiserror::Error;

use crate::types::PageAddress;

pub type Result<T> = std::result::Result<T, BurrowError>;

#[derive(Debug, Error)]
pub enum BurrowError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("out of memory")]
    OutOfMemory,
    #[error("page not found")]
    NotFound,
    #[error("page {0} already cached")]
    AlreadyPresent(PageAddress),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("corruption detected: {0}")]
    Corrupt(String),
}
