use camino::Utf8PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ConnError {
    #[error("{kind} not found: {path}")]
    PathNotFound { kind: &'static str, path: Utf8PathBuf },

    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(String),

    #[error("BIDS metadata unavailable: {0}")]
    MetadataUnavailable(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to read script template {path}: {message}")]
    TemplateRead { path: Utf8PathBuf, message: String },

    #[error("failed to write batch script {path}: {message}")]
    TemplateWrite { path: Utf8PathBuf, message: String },

    #[error("CONN or MATLAB not found in PATH")]
    #[diagnostic(help("install CONN standalone or MATLAB, or pass --install-dir"))]
    MissingTool,

    #[error("failed to launch {command}: {message}")]
    Spawn { command: String, message: String },

    #[error("step {index} ({name}) failed, see {log_file}")]
    StageFailed {
        index: u8,
        name: &'static str,
        log_file: Utf8PathBuf,
    },

    #[error("{count} corrupt derivative file(s) detected")]
    #[diagnostic(help("regenerate the listed files before importing"))]
    ValidationFailed { count: usize },

    #[error("participants.tsv is empty: {0}")]
    EmptyParticipants(Utf8PathBuf),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("pipeline interrupted by user")]
    Interrupted,
}
