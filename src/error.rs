use std::path::PathBuf;

use thiserror::Error;

/// Fatal errors that abort a pipeline stage.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{what} not found at {}", path.display())]
    MissingInput { what: &'static str, path: PathBuf },
}

/// Per-file extraction failures. These are recorded in the repository
/// metadata and never abort the run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("SyntaxError: {0}")]
    Syntax(String),
    #[error("Error processing file: {0}")]
    Processing(String),
}

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("cannot parse source: {0}")]
    Unparsable(String),
    #[error("invalid formatter command: {0}")]
    InvalidCommand(String),
    #[error("formatter command `{command}` failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
