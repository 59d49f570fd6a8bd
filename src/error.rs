use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("collection {collection} requires a query index and none matched")]
    IndexRequired { collection: String },

    #[error("duplicate value for unique index {index}: {doc_id}")]
    UniqueViolation { index: String, doc_id: String },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("operation canceled")]
    Canceled,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an error, independent of its message and cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Forbidden,
    NotFound,
    IndexRequired,
    UniqueViolation,
    Internal,
    Canceled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::IndexRequired { .. } => ErrorKind::IndexRequired,
            Error::UniqueViolation { .. } => ErrorKind::UniqueViolation,
            Error::Canceled => ErrorKind::Canceled,
            Error::Internal(_) | Error::Json(_) | Error::Yaml(_) | Error::Io(_) => {
                ErrorKind::Internal
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
