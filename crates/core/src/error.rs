use studio_render::ExportError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid loop: end ({end}) must be after start ({start}), and start must not be negative")]
    InvalidLoop { start: f64, end: f64 },

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
