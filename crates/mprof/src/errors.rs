use std::{io, path::PathBuf};

use crate::Backend;

/// Errors raised by samplers, watchers and profilers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The snapshot backend needs a physical source file to attribute memory to.
    #[error("there is no access to the source file of the profiled code ({0:?})")]
    UnknownSource(Option<PathBuf>),

    #[error("memory backend `{0}` is not available in this process")]
    BackendUnavailable(Backend),

    #[error("memory backend `{0}` can not monitor child processes")]
    ChildrenUnsupported(Backend),

    #[error("invalid watch options: {0}")]
    InvalidOptions(&'static str),

    /// The watched callable panicked, the payload message is kept.
    #[error("watched callable panicked: {0}")]
    TargetPanicked(String),

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
