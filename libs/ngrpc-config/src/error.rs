use std::path::PathBuf;

use crate::credentials::TlsField;

/// Errors produced while loading the config or resolving how to dial an app.
///
/// The messages are stable: operators grep for them and tests assert them verbatim.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to load config file: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("invalid config file {}: {source}", path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: Box<figment::Error>,
    },

    #[error("invalid uri '{uri}' for app [{app}]: {source}")]
    InvalidUri {
        app: String,
        uri: String,
        #[source]
        source: url::ParseError,
    },

    #[error("missing host in uri '{uri}' for app [{app}]")]
    MissingHost { app: String, uri: String },

    #[error("unsupported scheme '{scheme}' for app [{app}]")]
    UnsupportedScheme { app: String, scheme: String },

    #[error("missing '{field}' config for app [{app}]")]
    MissingTlsField { field: TlsField, app: String },

    /// A TLS material file could not be read. `path` is kept exactly as configured.
    #[error("open {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to create cert pool for CA: {path}")]
    CertPool { path: String },

    #[error("unable to load key pair (cert: {cert}, key: {key}): {reason}")]
    KeyPair {
        cert: String,
        key: String,
        reason: String,
    },
}
