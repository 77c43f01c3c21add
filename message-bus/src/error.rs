use thiserror::Error;

use crate::consumer::GroupError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid message bus properties: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read properties file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("commit mode [{0}] is not supported")]
    UnsupportedCommitMode(String),
    #[error("initial offset [{0}] is not supported, expected -1 (newest) or -2 (oldest)")]
    UnsupportedInitialOffset(i64),
    #[error("security protocol [{0}] is not supported")]
    UnsupportedSecurityProtocol(String),
    #[error("{role} has no bootstrap servers")]
    MissingBootstrapServers { role: &'static str },
    #[error("{role} uses tls but no tls properties are set")]
    MissingTlsProperties { role: &'static str },
    #[error("invalid bootstrap server [{0}], expected host:port")]
    InvalidBootstrapServer(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("missing handler mapping")]
    MissingHandlerMappings,
    #[error("failed to create consumer for mapping [{key}]: {source}")]
    Consumer {
        key: String,
        #[source]
        source: GroupError,
    },
}
