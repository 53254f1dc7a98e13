// src/error.rs
//
// Two classes of failure:
// - `LensError`: recoverable, returned through `Result` (config, snapshot source, I/O).
// - `fatal!`: invariant violations (non-finite accumulations, broken exchange pairing,
//   empty-after-fill buffers). These log and panic; release builds abort on panic.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LensError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse config {path:?}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("snapshot catalog is empty")]
    EmptyCatalog,

    #[error("no potential has been computed yet; call prepare_plane first")]
    NoPotential,
}

pub type Result<T> = std::result::Result<T, LensError>;

impl LensError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LensError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Log an invariant violation at `error` level and panic.
///
/// Used for conditions that mean the data or the collective schedule is corrupt;
/// there is no sensible way to continue the run once one fires.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        log::error!("{}", msg);
        panic!("{}", msg)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_reports_path() {
        let e = LensError::io(
            "snaps.txt",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        let s = e.to_string();
        assert!(s.contains("snaps.txt"), "message was {s}");
    }

    #[test]
    #[should_panic(expected = "broken invariant 7")]
    fn fatal_panics_with_message() {
        fatal!("broken invariant {}", 7);
    }
}
