use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("database error: {0}")]
    Db(sqlx::Error),
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("row {row}: missing required field `{field}`")]
    MissingRequiredField { row: usize, field: &'static str },
    #[error("invalid measurement type `{value}`")]
    InvalidEnum { value: String },
    #[error("row {row}: invalid `{field}`: {detail}")]
    InvalidValue {
        row: usize,
        field: &'static str,
        detail: String,
    },
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("constraint violation on `{constraint}`: {detail}")]
    ConstraintViolation { constraint: String, detail: String },
    #[error("{stage} failed after earlier stages committed: {source}")]
    PartialFailure {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(ref db_err) if is_integrity_violation(db_err.code().as_deref()) => {
                Error::ConstraintViolation {
                    constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                    detail: db_err.message().to_string(),
                }
            }
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => Error::StoreUnavailable(err),
            other => Error::Db(other),
        }
    }
}

// SQLSTATE class 23 covers not-null, check, unique and foreign key violations.
fn is_integrity_violation(code: Option<&str>) -> bool {
    code.is_some_and(|c| c.starts_with("23"))
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait WithContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> WithContext<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: msg.into(),
            source: Box::new(e),
        })
    }
}

impl Error {
    pub(crate) fn partial(stage: &'static str, source: Error) -> Self {
        Error::PartialFailure {
            stage,
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_joins_messages() {
        let err = Error::Validation(vec!["Missing column value".into(), "bad type".into()]);
        assert_eq!(
            err.to_string(),
            "validation failed: Missing column value; bad type"
        );
    }

    #[test]
    fn pool_timeout_is_unavailable() {
        let err: Error = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, Error::StoreUnavailable(_)));
    }

    #[test]
    fn integrity_class() {
        assert!(is_integrity_violation(Some("23505")));
        assert!(is_integrity_violation(Some("23514")));
        assert!(!is_integrity_violation(Some("40001")));
        assert!(!is_integrity_violation(None));
    }
}
