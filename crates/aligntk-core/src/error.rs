use thiserror::Error;

/// Error kinds produced by the core solver (§7). Every variant renders as
/// a single-line ASCII message suitable for a log line or a `DONE(FAIL)`
/// reason string — never a stack trace. Per-cell and per-pair failures
/// stay local to the work unit that produced them; only
/// [`AlignError::Transport`] is meant to propagate to a dispatcher's
/// master loop as fatal.
#[derive(Error, Debug)]
pub enum AlignError {
    #[error("input missing: {0}")]
    InputMissing(String),

    #[error("format error: {0}")]
    FormatError(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("degenerate: {0}")]
    Degenerate(String),

    #[error("convergence: {0}")]
    Convergence(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image codec error: {0}")]
    ImageError(#[from] image::ImageError),
}

impl AlignError {
    /// Short kind tag used when reporting a unit's failure reason to the
    /// dispatcher (`DONE(FAIL, reason)`).
    pub fn kind_tag(&self) -> &'static str {
        match self {
            Self::InputMissing(_) => "InputMissing",
            Self::FormatError(_) => "FormatError",
            Self::OutOfMemory(_) => "OutOfMemory",
            Self::Degenerate(_) => "Degenerate",
            Self::Convergence(_) => "Convergence",
            Self::Transport(_) => "Transport",
            Self::Io(_) => "Io",
            Self::ImageError(_) => "FormatError",
        }
    }

    /// Whether this error should be treated as fatal to a master loop
    /// rather than a local, per-unit failure (§7).
    pub fn is_fatal_to_master(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, AlignError>;
