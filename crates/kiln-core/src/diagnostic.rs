//! Build diagnostics collected during a rebuild cycle

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Error,
    Warn,
    Info,
}

/// A single message produced by the compiler service or a transform stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: Level,
    pub header: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Diagnostic {
    pub fn error(header: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: Level::Error,
            header: header.into(),
            message: message.into(),
            file: None,
        }
    }

    pub fn warn(header: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: Level::Warn,
            header: header.into(),
            message: message.into(),
            file: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == Level::Error
    }
}

/// True when any diagnostic is an error
pub fn has_error(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_error() {
        let mut diags = vec![Diagnostic::warn("Style", "unused selector")];
        assert!(!has_error(&diags));

        diags.push(Diagnostic::error("Style", "unterminated comment").with_file("/src/a.css"));
        assert!(has_error(&diags));
    }
}
