use anyhow::anyhow;
use serde::Serialize;

/// A position in the source being compiled, as tracked by the scanner
/// from the preprocessor's line markers. Every fatal diagnostic carries
/// one of these so the message can name the file and line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SrcPos {
    pub file: String,
    pub line: i32,
}

impl SrcPos {
    pub fn new(file: impl Into<String>, line: i32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    /// Build a fatal diagnostic at this position.
    pub fn error(&self, msg: impl AsRef<str>) -> anyhow::Error {
        anyhow!("{} on line {} of {}", msg.as_ref(), self.line, self.file)
    }
}

impl std::fmt::Display for SrcPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}
