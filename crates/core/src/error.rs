use std::fmt;

/// Errors that can occur while bridging a sandboxed worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to load module from '{location}': {reason}")]
    Load { location: String, reason: String },

    #[error("module failed to compile or instantiate: {0}")]
    Compile(String),

    #[error("resource budget cannot be satisfied: {0}")]
    Resource(String),

    #[error("worker failed to launch: {0}")]
    Launch(String),

    #[error("invalid text on worker stream: {0}")]
    StreamDecode(String),

    #[error("transport factory has already been used")]
    TransportConsumed,

    #[error("worker is not running")]
    NotRunning,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Builds a [`Error::Load`] for the given storage location.
    pub fn load(location: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::Load {
            location: location.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Returns the bridge stage this error belongs to.
    ///
    /// Used when surfacing a failed activation so the user can tell which
    /// step broke.
    pub fn stage(&self) -> Stage {
        match self {
            Error::Load { .. } => Stage::Load,
            Error::Compile(_) => Stage::Compile,
            Error::Resource(_) => Stage::Resource,
            Error::Launch(_) | Error::NotRunning => Stage::Launch,
            Error::StreamDecode(_) => Stage::Stream,
            Error::TransportConsumed | Error::Timeout(_) | Error::Io(_) => Stage::Transport,
            Error::InvalidConfig(_) => Stage::Config,
        }
    }
}

/// Step of the bridge setup an [`Error`] is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    Load,
    Compile,
    Resource,
    Launch,
    Stream,
    Transport,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Config => "config",
            Stage::Load => "load",
            Stage::Compile => "compile",
            Stage::Resource => "resource",
            Stage::Launch => "launch",
            Stage::Stream => "stream",
            Stage::Transport => "transport",
        };
        f.write_str(name)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
