//! Engine error types.
//!
//! Fatal diagnostics carry a locating prefix of the form `path|line| ERROR: …`
//! pointing at the statement that introduced the offending entity.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Statement location used in locating messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub file: PathBuf,
    pub line: u32,
}

impl Origin {
    pub fn new(file: impl Into<PathBuf>, line: u32) -> Self {
        Origin {
            file: file.into(),
            line,
        }
    }

    /// Origin for entities not introduced by any statement.
    pub fn none() -> Self {
        Origin {
            file: PathBuf::new(),
            line: 0,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|", self.file.display(), self.line)
    }
}

/// Fatal engine errors.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Missing options file, malformed statement, duplicate definition,
    /// unknown system library, and the like.
    #[error("{origin} ERROR: {message}")]
    Config { origin: Origin, message: String },

    /// A dependency edge that violates the visibility rules.
    #[error("{origin} ERROR: {message}")]
    Visibility { origin: Origin, message: String },

    /// The build was cancelled by a failure or an external signal.
    #[error("build bailed ({initiator}): {outstanding} target(s) outstanding")]
    Bail {
        initiator: String,
        outstanding: usize,
    },
}

impl BuildError {
    pub fn config(origin: &Origin, message: impl Into<String>) -> Self {
        BuildError::Config {
            origin: origin.clone(),
            message: message.into(),
        }
    }

    pub fn visibility(origin: &Origin, message: impl Into<String>) -> Self {
        BuildError::Visibility {
            origin: origin.clone(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locating_format() {
        let origin = Origin::new("src/a/Bubfile", 7);
        let err = BuildError::config(&origin, "duplicate definition of foo");
        assert_eq!(
            err.to_string(),
            "src/a/Bubfile|7| ERROR: duplicate definition of foo"
        );
    }
}
