use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Network,
    Timeout,
    Server,
    Storage,
    Cache,
    Validation,
    Authentication,
    Permission,
    Plugin,
    Download,
    StorageFull,
    Playback,
    Codec,
    Unknown,
}

/// Closed failure taxonomy carried by every failure envelope.
///
/// The core only classifies failures; wording shown to a user is owned by
/// whoever reads the controller's error channel.
#[derive(Debug, Clone, Error)]
pub enum AppError {
    #[error("{message}")]
    Network { message: String },
    #[error("{message}")]
    Timeout { message: String },
    #[error("{message}")]
    Server { message: String, status: u16 },
    #[error("{message}")]
    Storage { message: String },
    #[error("{message}")]
    Cache { message: String },
    #[error("{message}")]
    Validation {
        message: String,
        field: Option<String>,
    },
    #[error("{message}")]
    Authentication { message: String },
    #[error("{message}")]
    Permission { message: String },
    #[error("{message}")]
    Plugin {
        message: String,
        plugin_id: Option<String>,
    },
    #[error("{message}")]
    Download {
        message: String,
        filename: Option<String>,
    },
    #[error("{message}")]
    StorageFull {
        message: String,
        required_bytes: Option<u64>,
    },
    #[error("{message}")]
    Playback { message: String },
    #[error("{message}")]
    Codec {
        message: String,
        format: Option<String>,
    },
    #[error("{message}")]
    Unknown {
        message: String,
        cause: Option<Arc<anyhow::Error>>,
    },
}

impl AppError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            message: message.into(),
            status,
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Validation {
            message: message.into(),
            field: field.map(str::to_string),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::Permission {
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
            cause: None,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Network { .. } => ErrorCode::Network,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Server { .. } => ErrorCode::Server,
            Self::Storage { .. } => ErrorCode::Storage,
            Self::Cache { .. } => ErrorCode::Cache,
            Self::Validation { .. } => ErrorCode::Validation,
            Self::Authentication { .. } => ErrorCode::Authentication,
            Self::Permission { .. } => ErrorCode::Permission,
            Self::Plugin { .. } => ErrorCode::Plugin,
            Self::Download { .. } => ErrorCode::Download,
            Self::StorageFull { .. } => ErrorCode::StorageFull,
            Self::Playback { .. } => ErrorCode::Playback,
            Self::Codec { .. } => ErrorCode::Codec,
            Self::Unknown { .. } => ErrorCode::Unknown,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Network { message }
            | Self::Timeout { message }
            | Self::Server { message, .. }
            | Self::Storage { message }
            | Self::Cache { message }
            | Self::Validation { message, .. }
            | Self::Authentication { message }
            | Self::Permission { message }
            | Self::Plugin { message, .. }
            | Self::Download { message, .. }
            | Self::StorageFull { message, .. }
            | Self::Playback { message }
            | Self::Codec { message, .. }
            | Self::Unknown { message, .. } => message,
        }
    }

    /// Failures worth retrying from inside an `execute` body. Nothing in the
    /// core retries on its own.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::Server { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(classified) = err.chain().find_map(|c| c.downcast_ref::<AppError>()) {
            return classified.clone();
        }
        if err.chain().any(|c| c.is::<std::io::Error>()) {
            return Self::storage(format!("{err:#}"));
        }
        Self::Unknown {
            message: format!("{err:#}"),
            cause: Some(Arc::new(err)),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::storage(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec {
            message: err.to_string(),
            format: Some("json".to_string()),
        }
    }
}
