use core::time::Duration;
use std::path::PathBuf;

use thiserror::Error;

/// Failure to load or durably write one of the JSON data files.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("encoding {path:?}: {source}")]
    Encode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("decoding {path:?}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("i/o on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("writing {path:?} timed out after {after:?}")]
    Timeout { path: PathBuf, after: Duration },
}
