//! Error taxonomy shared by every component.
//!
//! Per-block read/write failures are *not* represented here; those are
//! captured into a batch's result array (see `device::BlockResult`) and
//! never propagated through `?`. This enum is for errors that abort the
//! current operation outright.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DdbError {
    #[error("invalid data: {0}")]
    Invalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("is a directory: {0}")]
    IsDir(String),

    #[error("not a directory: {0}")]
    NotDir(String),

    #[error("too many levels of symbolic links: {0}")]
    Loop(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl DdbError {
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        DdbError::Invalid(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, DdbError>;
