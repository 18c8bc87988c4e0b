use crate::encoding::ReadError;

/// Errors surfaced by the replicated text model and its update codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A local edit addressed a range outside the visible text.
    /// The document is left untouched.
    InvalidLocalOperation {
        position: usize,
        length: usize,
        visible_len: usize,
    },
    /// An encoded update or state vector could not be decoded.
    CorruptUpdate(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidLocalOperation { position, length, visible_len } => write!(
                f,
                "Invalid local operation: range {position}..{} outside document of length {visible_len}",
                position + length
            ),
            Self::CorruptUpdate(e) => write!(f, "Corrupt update: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ReadError> for EngineError {
    fn from(e: ReadError) -> Self {
        EngineError::CorruptUpdate(e.to_string())
    }
}
