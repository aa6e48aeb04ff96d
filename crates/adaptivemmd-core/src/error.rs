//! Error taxonomy for the daemon core.
//!
//! Mirrors the three-way split the control loop acts on: fatal errors
//! unwind out of `main`, parse/I/O errors are logged and absorbed at the
//! component boundary with the previous snapshot retained.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed line in {path}: {detail}")]
    Parse { path: String, detail: String },

    #[error("{0}")]
    Fatal(String),
}

impl Error {
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parse(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Parse {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// True for the startup-fatal class (§7): these propagate out of the
    /// control loop instead of being absorbed as "no action this tick".
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}
