//! Error taxonomy shared by every handle in the crate

/// Errors surfaced by document, page and rendering operations
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("document source not found: {path}")]
    NotFound { path: String },

    #[error("document requires a password, none or an incorrect one was supplied")]
    AuthenticationRequired,

    #[error("native open failed with code {code}")]
    OpenFailed { code: i32 },

    #[error("could not create page {page}")]
    PageCreationFailed { page: usize },

    #[error("invalid argument: {detail}")]
    InvalidArgument { detail: String },

    #[error("rasterization failed: {detail}")]
    RenderFailed { detail: String },

    #[error("out of memory while rendering")]
    OutOfMemory,

    #[error("{what} used after its resources were freed")]
    Disposed { what: &'static str },

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl RenderError {
    pub fn invalid(detail: impl Into<String>) -> Self {
        Self::InvalidArgument {
            detail: detail.into(),
        }
    }

    pub fn render_failed(detail: impl Into<String>) -> Self {
        Self::RenderFailed {
            detail: detail.into(),
        }
    }

    /// Use-after-free of a handle. Logged loudly, returned as a value.
    pub(crate) fn disposed(what: &'static str) -> Self {
        log::error!("{what} used after disposal");
        Self::Disposed { what }
    }

    /// Rendering-path errors are absorbed by the renderer and leave it retryable.
    #[must_use]
    pub fn is_render_path(&self) -> bool {
        matches!(self, Self::RenderFailed { .. } | Self::OutOfMemory)
    }
}

pub type Result<T> = std::result::Result<T, RenderError>;
