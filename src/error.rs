use std::{fmt, io, path::StripPrefixError};

use http::status::StatusCode;
use regex::Error as RegexError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "service")]
use notify::{Error as NotifyError, ErrorKind as NotifyErrorKind};

use sqlx::{
    error::{DatabaseError, ErrorKind as DatabaseErrorKind},
    Error as SqlxError,
};

use serde_json::Error as JsonError;

/// A single schema violation found while validating a document's fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Field path, e.g. `name`, `tags[2]`
    pub path: String,
    pub reason: String,
}

impl FieldError {
    pub fn new<P: Into<String>, R: Into<String>>(path: P, reason: R) -> Self {
        FieldError {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<String>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum VaultError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Validation failed for '{path}': {}", join_field_errors(.errors))]
    Validation {
        path: String,
        errors: Vec<FieldError>,
    },
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Unresolved entity type for '{path}': {reason}")]
    UnresolvedType { path: String, reason: String },
    #[error("Integrity violation: {0}")]
    Integrity(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("File System error: {0}")]
    Io(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("File watcher error: {0}")]
    Watch(String),
}

impl VaultError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            VaultError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            VaultError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            VaultError::Conflict(_) => StatusCode::CONFLICT,
            VaultError::UnresolvedType { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            VaultError::Integrity(_) => StatusCode::INTERNAL_SERVER_ERROR,
            VaultError::NotFound(_) => StatusCode::NOT_FOUND,
            VaultError::Cancelled => StatusCode::NO_CONTENT,
            VaultError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            VaultError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            VaultError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            VaultError::Watch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StripPrefixError> for VaultError {
    fn from(src: StripPrefixError) -> VaultError {
        VaultError::NotFound(format!("Strip prefix failed for path. Error: {src}"))
    }
}

impl From<toml::de::Error> for VaultError {
    fn from(src: toml::de::Error) -> VaultError {
        VaultError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for VaultError {
    fn from(src: toml::ser::Error) -> VaultError {
        VaultError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<JsonError> for VaultError {
    fn from(src: JsonError) -> VaultError {
        VaultError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<serde_yaml::Error> for VaultError {
    fn from(src: serde_yaml::Error) -> VaultError {
        VaultError::Serialization(format!("YAML deserialization error: {src}"))
    }
}

impl From<io::Error> for VaultError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => VaultError::NotFound(format!("{x}")),
            _ => VaultError::Io(format!("IOError: {}: {x}", x.kind())),
        }
    }
}

impl From<RegexError> for VaultError {
    fn from(x: RegexError) -> Self {
        VaultError::Configuration(format!("Regex parse failed: {x}"))
    }
}

#[cfg(feature = "service")]
impl From<NotifyError> for VaultError {
    fn from(notify_error: NotifyError) -> Self {
        match notify_error.kind {
            NotifyErrorKind::Generic(msg) => VaultError::Watch(format!(
                "notify-debouncer: {}, paths: {:?}",
                msg, notify_error.paths
            )),
            NotifyErrorKind::Io(io_error) => VaultError::Watch(format!(
                "notify-debouncer: io error {}, paths: {:?}",
                io_error.kind(),
                notify_error.paths
            )),
            NotifyErrorKind::PathNotFound => VaultError::NotFound(format!(
                "notify-debouncer: path(s) not found: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::WatchNotFound => VaultError::NotFound(format!(
                "notify-debouncer: watch not found, paths: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::InvalidConfig(_) => {
                VaultError::Watch("notify-debouncer invalid config".to_string())
            }
            NotifyErrorKind::MaxFilesWatch => {
                VaultError::Watch("notify-debouncer max file watch limit reached".to_string())
            }
        }
    }
}

impl From<SqlxError> for VaultError {
    fn from(db_error: SqlxError) -> Self {
        VaultError::Database(format!("{db_error:?}"))
    }
}

impl From<sqlx::migrate::MigrateError> for VaultError {
    fn from(migrate_error: sqlx::migrate::MigrateError) -> Self {
        VaultError::Database(format!("migration failed: {migrate_error}"))
    }
}

// Lets `FromRow` implementations surface decoding failures as `VaultError`s.
impl DatabaseError for VaultError {
    fn message(&self) -> &str {
        "vaultgraph FromRow parsing failure"
    }

    fn kind(&self) -> sqlx::error::ErrorKind {
        DatabaseErrorKind::Other
    }

    #[inline]
    fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
        None
    }

    #[doc(hidden)]
    fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self
    }

    #[doc(hidden)]
    fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
        self
    }

    #[doc(hidden)]
    fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
        self
    }
}
