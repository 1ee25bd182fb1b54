pub mod block_store;
pub mod db;

pub use block_store::{BlockStore, MemoryBlockStore, StoreTier};
pub use db::{DBCol, Database, TestDB};

/// Opaque error type representing storage errors.
///
/// Invariant: any store error is a critical operational error which signals
/// about data corruption. If you have an error condition which needs to be
/// handled somehow, it should be some *other* error type.
#[derive(thiserror::Error, Debug)]
#[error("{0}")]
pub struct Error(String);

impl Error {
    pub fn new(msg: impl Into<String>) -> Self {
        Error(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error(e.to_string())
    }
}
