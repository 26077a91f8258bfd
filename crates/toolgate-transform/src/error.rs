use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings from {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse legacy settings {path}: {source}")]
    LegacyJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("replacement rule {rule} has an invalid pattern: {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },
    #[error("replacement rule {rule} has unknown role `{role}`")]
    UnknownRole { rule: String, role: String },
}

/// Raised by the stream reconstructors; fatal for the stream it happened on.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("upstream event is not valid JSON: {source}")]
    Decode {
        payload: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Reasons a declaration cannot be tightened into a strict schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StrictSchemaError {
    #[error("keyword `{0}` has no strict-mode equivalent")]
    UnsupportedKeyword(String),
    #[error("unsupported reference `{0}`")]
    UnsupportedRef(String),
    #[error("unresolvable reference `{0}`")]
    UnresolvedRef(String),
}
