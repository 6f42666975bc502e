use crate::models::{
    Book, BookPatch, Id, Kind, NewBook, NewTransaction, NewUser, Transaction, TransactionPatch,
    UnknownVariant, User, UserPatch,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// A conditional commit lost against the current stored state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Conflict {
    #[error("book {book_id} has no copies left")]
    Unavailable { book_id: Id },
    #[error("user {user_id} already holds book {book_id}")]
    DuplicateActiveLoan { book_id: Id, user_id: Id },
    #[error("transaction {transaction_id} is not issued")]
    NotCurrentlyIssued { transaction_id: Id },
    #[error("email already registered")]
    EmailTaken,
    #[error("usn already registered")]
    UsnTaken,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: Kind, id: Id },

    #[error("conflict: {0}")]
    Conflict(Conflict),

    #[error("stored record is malformed: {0}")]
    Corrupt(String),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("encoding error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn not_found(kind: Kind, id: &str) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<UnknownVariant> for StoreError {
    fn from(err: UnknownVariant) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

impl From<Conflict> for StoreError {
    fn from(conflict: Conflict) -> Self {
        StoreError::Conflict(conflict)
    }
}

/// Persistence for the three record kinds.
///
/// Plain CRUD accessors carry no business rules. The `commit_*` and
/// `discard_transaction` operations re-check their preconditions against the
/// stored state and apply every write they make as one unit, so two callers
/// racing for the last copy of a book cannot both win.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn list_users(&self) -> Result<Vec<User>, StoreError>;
    async fn get_user(&self, id: &str) -> Result<User, StoreError>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    /// Fails with [`Conflict::EmailTaken`] or [`Conflict::UsnTaken`].
    async fn create_user(&self, user: NewUser) -> Result<User, StoreError>;
    async fn update_user(&self, id: &str, patch: UserPatch) -> Result<User, StoreError>;
    async fn delete_user(&self, id: &str) -> Result<(), StoreError>;

    async fn list_books(&self) -> Result<Vec<Book>, StoreError>;
    async fn get_book(&self, id: &str) -> Result<Book, StoreError>;
    async fn create_book(&self, book: NewBook) -> Result<Book, StoreError>;
    async fn update_book(&self, id: &str, patch: BookPatch) -> Result<Book, StoreError>;
    async fn delete_book(&self, id: &str) -> Result<(), StoreError>;

    async fn list_transactions(&self) -> Result<Vec<Transaction>, StoreError>;
    async fn get_transaction(&self, id: &str) -> Result<Transaction, StoreError>;
    async fn create_transaction(&self, transaction: NewTransaction)
        -> Result<Transaction, StoreError>;
    async fn update_transaction(
        &self,
        id: &str,
        patch: TransactionPatch,
    ) -> Result<Transaction, StoreError>;
    async fn delete_transaction(&self, id: &str) -> Result<(), StoreError>;

    /// Takes one copy off the shelf and records the loan.
    async fn commit_issue(&self, loan: NewTransaction) -> Result<Transaction, StoreError>;

    /// Closes an issued loan and puts the copy back, if the book still exists.
    async fn commit_return(
        &self,
        transaction_id: &str,
        returned_at: DateTime<Utc>,
    ) -> Result<Transaction, StoreError>;

    /// Deletes a loan, restoring stock first when it was still issued.
    async fn discard_transaction(&self, transaction_id: &str) -> Result<Transaction, StoreError>;
}
