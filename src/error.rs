use crate::{
    models::{Id, Kind, Role},
    store::{Conflict, StoreError},
};
use thiserror::Error;

/// Why an access check refused the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Denial {
    #[error("no active session")]
    NoSession,
    #[error("session refers to a missing account")]
    UnknownUser,
    #[error("account is pending approval")]
    PendingApproval,
    #[error("role {actual} may not use this operation")]
    WrongRole { actual: Role },
    #[error("email or password did not match")]
    BadCredentials,
    #[error("transaction belongs to another member")]
    NotOwner,
}

/// Which input was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Invalid {
    #[error("field {0} is missing or malformed")]
    Field(String),
    #[error("password confirmation does not match")]
    PasswordMismatch,
    #[error("usn does not match 1CK##XX###")]
    MalformedUsn,
    #[error("phone must be exactly 10 digits")]
    MalformedPhone,
    #[error("email already registered")]
    EmailTaken,
    #[error("usn already registered")]
    UsnTaken,
    #[error("no account matches this email and usn")]
    NoMatchingAccount,
    #[error("import contains no rows")]
    EmptyImport,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} {id} not found")]
    NotFound { kind: Kind, id: Id },

    #[error("book {book_id} has no copies on the shelf")]
    Unavailable { book_id: Id },

    #[error("user {user_id} already holds book {book_id}")]
    DuplicateActiveLoan { book_id: Id, user_id: Id },

    #[error("transaction {transaction_id} is not currently issued")]
    NotCurrentlyIssued { transaction_id: Id },

    #[error("unauthorized: {0}")]
    Unauthorized(Denial),

    #[error("validation failed: {0}")]
    ValidationFailed(Invalid),

    #[error("credential hashing failed: {0}")]
    Credential(String),

    #[error(transparent)]
    Store(StoreError),
}

impl Error {
    pub fn not_found(kind: Kind, id: &str) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn field(name: &str) -> Self {
        Error::ValidationFailed(Invalid::Field(name.to_string()))
    }
}

impl From<Denial> for Error {
    fn from(denial: Denial) -> Self {
        Error::Unauthorized(denial)
    }
}

impl From<Invalid> for Error {
    fn from(invalid: Invalid) -> Self {
        Error::ValidationFailed(invalid)
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => Error::NotFound { kind, id },
            StoreError::Conflict(conflict) => conflict.into(),
            other => Error::Store(other),
        }
    }
}

impl From<Conflict> for Error {
    fn from(conflict: Conflict) -> Self {
        match conflict {
            Conflict::Unavailable { book_id } => Error::Unavailable { book_id },
            Conflict::DuplicateActiveLoan { book_id, user_id } => {
                Error::DuplicateActiveLoan { book_id, user_id }
            }
            Conflict::NotCurrentlyIssued { transaction_id } => {
                Error::NotCurrentlyIssued { transaction_id }
            }
            Conflict::EmailTaken => Error::ValidationFailed(Invalid::EmailTaken),
            Conflict::UsnTaken => Error::ValidationFailed(Invalid::UsnTaken),
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut fields: Vec<String> = errors
            .field_errors()
            .keys()
            .map(|field| field.to_string())
            .collect();
        fields.sort();
        let first = fields.into_iter().next().unwrap_or_default();
        Error::ValidationFailed(Invalid::Field(first))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
