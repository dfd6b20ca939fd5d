use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WtyError {
    /// Bad magic, malformed record layout, or an unusable manifest.
    #[error("format error: {0}")]
    Format(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsafe path: {0}")]
    UnsafePath(String),
}

impl WtyError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        WtyError::Io { path: path.as_ref().to_path_buf(), source }
    }
}

pub type Result<T> = std::result::Result<T, WtyError>;

/// Attach a path to a bare `io::Result`.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| WtyError::io(path, e))
    }
}
