use sled::transaction::ConflictableTransactionError;

pub type Result<T> = std::result::Result<T, SettlementError>;

#[derive(thiserror::Error, Debug)]
pub enum SettlementError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("cannot act on own resource: {0}")]
    SelfAction(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{op} exceeded its transaction deadline")]
    Timeout { op: &'static str },
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("encoding error: {0}")]
    Codec(String),
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl SettlementError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        SettlementError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Transient failures the caller may retry; everything else is a
    /// precondition failure and retrying will fail the same way.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SettlementError::Timeout { .. } | SettlementError::Storage(_)
        )
    }

    /// HTTP status the request layer maps this error onto.
    pub fn status_code(&self) -> u16 {
        match self {
            SettlementError::NotFound { .. } => 404,
            SettlementError::Forbidden(_) => 403,
            SettlementError::InvalidState(_)
            | SettlementError::SelfAction(_)
            | SettlementError::Validation(_) => 400,
            SettlementError::AlreadyExists(_) => 409,
            SettlementError::Timeout { .. } | SettlementError::Storage(_) => 503,
            SettlementError::Codec(_) | SettlementError::Config(_) => 500,
        }
    }

    /// Stable machine readable code for response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SettlementError::NotFound { .. } => "not_found",
            SettlementError::Forbidden(_) => "forbidden",
            SettlementError::InvalidState(_) => "invalid_state",
            SettlementError::AlreadyExists(_) => "already_exists",
            SettlementError::SelfAction(_) => "self_action",
            SettlementError::Validation(_) => "validation",
            SettlementError::Timeout { .. } => "timeout",
            SettlementError::Storage(_) => "storage",
            SettlementError::Codec(_) | SettlementError::Config(_) => "internal",
        }
    }
}

impl From<minicbor::decode::Error> for SettlementError {
    fn from(value: minicbor::decode::Error) -> Self {
        SettlementError::Codec(value.to_string())
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for SettlementError {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        SettlementError::Codec(value.to_string())
    }
}

// lets `?` abort a store transaction with a domain error
impl From<SettlementError> for ConflictableTransactionError<SettlementError> {
    fn from(value: SettlementError) -> Self {
        ConflictableTransactionError::Abort(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_failures_map_to_client_errors() {
        let lost_race = SettlementError::InvalidState("listing has an active trade".into());
        assert_eq!(lost_race.status_code(), 400);
        assert_eq!(lost_race.code(), "invalid_state");
        assert!(!lost_race.is_retryable());

        let dup = SettlementError::AlreadyExists("rating".into());
        assert_eq!(dup.status_code(), 409);

        let missing = SettlementError::not_found("transaction", "txn_1abc");
        assert_eq!(missing.status_code(), 404);
        assert_eq!(missing.to_string(), "transaction txn_1abc not found");
    }

    #[test]
    fn transient_failures_are_retryable() {
        let timeout = SettlementError::Timeout { op: "offer.accept" };
        assert!(timeout.is_retryable());
        assert_eq!(timeout.status_code(), 503);

        let storage = SettlementError::Storage(sled::Error::Unsupported("io".into()));
        assert!(storage.is_retryable());
    }
}
