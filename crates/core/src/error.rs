//! Error taxonomy for pyramid generation.

use std::fmt;

/// A tile that could not be rendered.
///
/// Scoped to one `(zoom, x, y)` address; sibling tiles keep rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct TileFailure {
    pub zoom: u32,
    pub x: usize,
    pub y: usize,
    pub reason: String,
}

impl fmt::Display for TileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tile {}/{}/{}: {}", self.zoom, self.x, self.y, self.reason)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PyramidError {
    /// Empty buffer, bad sample rate, or an inconsistent configuration.
    /// Raised before any work starts.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The configuration would keep more frames resident than allowed.
    #[error("resource exhausted: {required} resident frames required, limit is {limit}")]
    ResourceExhausted { required: usize, limit: usize },

    /// One or more tiles failed to render. Collected over the whole run.
    #[error("{} tile(s) failed to render (first: {})", .0.len(), first_failure(.0))]
    RenderFailures(Vec<TileFailure>),

    #[error("generation cancelled")]
    Cancelled,

    /// The tile sink rejected a write, commit, or abort.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

fn first_failure(failures: &[TileFailure]) -> String {
    failures
        .first()
        .map(|f| f.to_string())
        .unwrap_or_else(|| "none".to_string())
}

pub type Result<T> = std::result::Result<T, PyramidError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_failures_message() {
        let err = PyramidError::RenderFailures(vec![
            TileFailure { zoom: 2, x: 0, y: 1, reason: "encoder".into() },
            TileFailure { zoom: 3, x: 4, y: 0, reason: "encoder".into() },
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("2 tile(s) failed"), "got {}", msg);
        assert!(msg.contains("tile 2/0/1"), "got {}", msg);
    }

    #[test]
    fn test_resource_exhausted_message() {
        let err = PyramidError::ResourceExhausted { required: 9000, limit: 4096 };
        assert_eq!(
            err.to_string(),
            "resource exhausted: 9000 resident frames required, limit is 4096"
        );
    }

    #[test]
    fn test_storage_from_anyhow() {
        let err: PyramidError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, PyramidError::Storage(_)));
        assert_eq!(err.to_string(), "disk full");
    }
}
