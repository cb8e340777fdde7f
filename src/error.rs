//! Error taxonomy for the request pipeline

use thiserror::Error;

/// Failure of a single request. Every pipeline stage either returns a valid
/// record or one of these; there is no partial success.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Malformed or missing request fields
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A stage received a representation it cannot handle
    #[error("shape mismatch in {stage}: {detail}")]
    ShapeMismatch { stage: &'static str, detail: String },

    /// Scratch-file creation, write, read or deletion failed
    #[error("resource error while {context}: {source}")]
    Resource {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The volume bytes could not be decoded or encoded
    #[error("volume codec error: {0}")]
    Codec(String),

    /// Opaque failure from the inference runtime
    #[error("inference runtime error: {0:#}")]
    Runtime(anyhow::Error),
}

impl ServiceError {
    pub fn shape(stage: &'static str, detail: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            stage,
            detail: detail.into(),
        }
    }

    pub fn resource(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Resource {
            context: context.into(),
            source,
        }
    }

    /// Stable label used in logs, metrics and error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::ShapeMismatch { .. } => "shape_mismatch",
            Self::Resource { .. } => "resource",
            Self::Codec(_) => "codec",
            Self::Runtime(_) => "runtime",
        }
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;
