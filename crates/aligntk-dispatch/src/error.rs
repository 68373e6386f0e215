use thiserror::Error;

/// Error kinds produced by the dispatcher (§7). Only [`DispatchError::Transport`]
/// is fatal to a running master or worker loop; everything else is reported
/// back as a unit's `DONE(FAIL)` reason and never unwinds the loop itself.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("input missing: {0}")]
    InputMissing(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Align(#[from] aligntk_core::error::AlignError),
}

impl DispatchError {
    pub fn kind_tag(&self) -> &'static str {
        match self {
            Self::InputMissing(_) => "InputMissing",
            Self::Config(_) => "Config",
            Self::Io(_) => "Io",
            Self::Transport(_) => "Transport",
            Self::Serialization(_) => "Serialization",
            Self::Align(e) => e.kind_tag(),
        }
    }

    /// Only `Transport` failures propagate to the master/worker loop as
    /// fatal; everything else stays local to the unit that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
