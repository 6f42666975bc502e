use crate::{
    models::{
        non_empty, ApprovalStatus, Book, BookPatch, Kind, LoanStatus, NewBook, NewTransaction,
        NewUser, Role, Transaction, TransactionPatch, User, UserPatch,
    },
    store::{Conflict, EntityStore, StoreError},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgDatabaseError, FromRow, PgPool};
use tracing::debug;

const UNIQUE_VIOLATION: &str = "23505";
const ACTIVE_LOAN_INDEX: &str = "transactions_one_active_loan";

/// Postgres backend. Conditional commits run inside one database transaction
/// and guard stock with `quantity > 0` in the UPDATE itself.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(FromRow)]
struct UserRow {
    id: String,
    name: String,
    email: String,
    usn: String,
    phone: String,
    password_hash: String,
    role: String,
    approval_status: String,
    created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct BookRow {
    id: String,
    title: String,
    author: String,
    isbn: Option<String>,
    category: String,
    quantity: i32,
    cover_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct TransactionRow {
    id: String,
    book_id: String,
    book_title: String,
    user_id: String,
    user_name: String,
    user_usn: String,
    issue_date: DateTime<Utc>,
    due_date: DateTime<Utc>,
    return_date: Option<DateTime<Utc>>,
    status: String,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, StoreError> {
        Ok(User {
            id: row.id,
            name: row.name,
            email: row.email,
            usn: row.usn,
            phone: row.phone,
            password_hash: row.password_hash,
            role: row.role.parse::<Role>()?,
            approval_status: row.approval_status.parse::<ApprovalStatus>()?,
            created_at: row.created_at,
        })
    }
}

impl TryFrom<BookRow> for Book {
    type Error = StoreError;

    fn try_from(row: BookRow) -> Result<Self, StoreError> {
        let quantity = u32::try_from(row.quantity).map_err(|_| {
            StoreError::Corrupt(format!("book {} has quantity {}", row.id, row.quantity))
        })?;
        Ok(Book {
            id: row.id,
            title: row.title,
            author: row.author,
            isbn: row.isbn,
            category: row.category,
            quantity,
            cover_url: row.cover_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self, StoreError> {
        Ok(Transaction {
            id: row.id,
            book_id: row.book_id,
            book_title: row.book_title,
            user_id: row.user_id,
            user_name: row.user_name,
            user_usn: row.user_usn,
            issue_date: row.issue_date,
            due_date: row.due_date,
            return_date: row.return_date,
            status: row.status.parse::<LoanStatus>()?,
        })
    }
}

fn convert<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn quantity(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt(format!("quantity {value} out of range")))
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Name of the unique constraint a statement tripped over, if any.
fn unique_violation(err: &sqlx::Error) -> Option<String> {
    let sqlx::Error::Database(db) = err else {
        return None;
    };
    if db.code().as_deref() != Some(UNIQUE_VIOLATION) {
        return None;
    }
    let constraint = db
        .try_downcast_ref::<PgDatabaseError>()
        .and_then(|pg| pg.constraint())
        .unwrap_or_default();
    Some(constraint.to_string())
}

impl PgStore {
    pub async fn new(db_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(db_url).await?;
        let store = PgStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                usn TEXT NOT NULL,
                phone TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL,
                approval_status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS users_usn_key ON users (upper(usn))")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS books (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                author TEXT NOT NULL,
                isbn TEXT,
                category TEXT NOT NULL,
                quantity INTEGER NOT NULL CHECK (quantity >= 0),
                cover_url TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                book_id TEXT NOT NULL,
                book_title TEXT NOT NULL,
                user_id TEXT NOT NULL,
                user_name TEXT NOT NULL,
                user_usn TEXT NOT NULL,
                issue_date TIMESTAMPTZ NOT NULL,
                due_date TIMESTAMPTZ NOT NULL,
                return_date TIMESTAMPTZ,
                status TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {ACTIVE_LOAN_INDEX} \
             ON transactions (book_id, user_id) WHERE status = 'issued'"
        ))
        .execute(&self.pool)
        .await?;

        debug!("postgres schema ready");
        Ok(())
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let rows: Vec<UserRow> = sqlx::query_as("SELECT * FROM users ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        convert(rows)
    }

    async fn get_user(&self, id: &str) -> Result<User, StoreError> {
        let row: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| StoreError::not_found(Kind::User, id))?.try_into()
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.map(User::try_from).transpose()
    }

    async fn create_user(&self, new: NewUser) -> Result<User, StoreError> {
        let inserted = sqlx::query_as::<_, UserRow>(
            "INSERT INTO users (id, name, email, usn, phone, password_hash, role, \
             approval_status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING *",
        )
        .bind(new_id())
        .bind(&new.name)
        .bind(&new.email)
        .bind(&new.usn)
        .bind(&new.phone)
        .bind(&new.password_hash)
        .bind(new.role.as_str())
        .bind(new.approval_status.as_str())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(row) => row.try_into(),
            Err(err) => match unique_violation(&err) {
                Some(constraint) if constraint == "users_usn_key" => Err(Conflict::UsnTaken.into()),
                Some(_) => Err(Conflict::EmailTaken.into()),
                None => Err(err.into()),
            },
        }
    }

    async fn update_user(&self, id: &str, patch: UserPatch) -> Result<User, StoreError> {
        // unset fields keep whatever the row holds at write time
        let row: Option<UserRow> = sqlx::query_as(
            "UPDATE users SET name = COALESCE($2, name), phone = COALESCE($3, phone), \
             password_hash = COALESCE($4, password_hash), role = COALESCE($5, role), \
             approval_status = COALESCE($6, approval_status) WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(patch.name)
        .bind(patch.phone)
        .bind(patch.password_hash)
        .bind(patch.role.map(|role| role.as_str()))
        .bind(patch.approval_status.map(|status| status.as_str()))
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| StoreError::not_found(Kind::User, id))?.try_into()
    }

    async fn delete_user(&self, id: &str) -> Result<(), StoreError> {
        let done = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::not_found(Kind::User, id));
        }
        Ok(())
    }

    async fn list_books(&self) -> Result<Vec<Book>, StoreError> {
        let rows: Vec<BookRow> = sqlx::query_as("SELECT * FROM books ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        convert(rows)
    }

    async fn get_book(&self, id: &str) -> Result<Book, StoreError> {
        let row: Option<BookRow> = sqlx::query_as("SELECT * FROM books WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| StoreError::not_found(Kind::Book, id))?.try_into()
    }

    async fn create_book(&self, new: NewBook) -> Result<Book, StoreError> {
        let now = Utc::now();
        let row: BookRow = sqlx::query_as(
            "INSERT INTO books (id, title, author, isbn, category, quantity, cover_url, \
             created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8) RETURNING *",
        )
        .bind(new_id())
        .bind(&new.title)
        .bind(&new.author)
        .bind(new.isbn.and_then(non_empty))
        .bind(&new.category)
        .bind(quantity(new.quantity)?)
        .bind(new.cover_url.and_then(non_empty))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn update_book(&self, id: &str, patch: BookPatch) -> Result<Book, StoreError> {
        // only the patched columns are written, so a concurrent issue or
        // return keeps its quantity change; a blank isbn or cover clears it
        let row: Option<BookRow> = sqlx::query_as(
            "UPDATE books SET title = COALESCE($2, title), author = COALESCE($3, author), \
             isbn = CASE WHEN $4 THEN $5 ELSE isbn END, category = COALESCE($6, category), \
             quantity = COALESCE($7, quantity), \
             cover_url = CASE WHEN $8 THEN $9 ELSE cover_url END, updated_at = now() \
             WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(patch.title)
        .bind(patch.author)
        .bind(patch.isbn.is_some())
        .bind(patch.isbn.and_then(non_empty))
        .bind(patch.category)
        .bind(patch.quantity.map(quantity).transpose()?)
        .bind(patch.cover_url.is_some())
        .bind(patch.cover_url.and_then(non_empty))
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| StoreError::not_found(Kind::Book, id))?.try_into()
    }

    async fn delete_book(&self, id: &str) -> Result<(), StoreError> {
        let done = sqlx::query("DELETE FROM books WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::not_found(Kind::Book, id));
        }
        Ok(())
    }

    async fn list_transactions(&self) -> Result<Vec<Transaction>, StoreError> {
        let rows: Vec<TransactionRow> =
            sqlx::query_as("SELECT * FROM transactions ORDER BY issue_date, id")
                .fetch_all(&self.pool)
                .await?;
        convert(rows)
    }

    async fn get_transaction(&self, id: &str) -> Result<Transaction, StoreError> {
        let row: Option<TransactionRow> = sqlx::query_as("SELECT * FROM transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| StoreError::not_found(Kind::Transaction, id))?.try_into()
    }

    async fn create_transaction(&self, new: NewTransaction) -> Result<Transaction, StoreError> {
        let row: TransactionRow = sqlx::query_as(
            "INSERT INTO transactions (id, book_id, book_title, user_id, user_name, user_usn, \
             issue_date, due_date, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING *",
        )
        .bind(new_id())
        .bind(&new.book_id)
        .bind(&new.book_title)
        .bind(&new.user_id)
        .bind(&new.user_name)
        .bind(&new.user_usn)
        .bind(new.issue_date)
        .bind(new.due_date)
        .bind(LoanStatus::Issued.as_str())
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn update_transaction(
        &self,
        id: &str,
        patch: TransactionPatch,
    ) -> Result<Transaction, StoreError> {
        let row: Option<TransactionRow> = sqlx::query_as(
            "UPDATE transactions SET due_date = COALESCE($2, due_date), \
             return_date = COALESCE($3, return_date), status = COALESCE($4, status) \
             WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(patch.due_date)
        .bind(patch.return_date)
        .bind(patch.status.map(|status| status.as_str()))
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| StoreError::not_found(Kind::Transaction, id))?.try_into()
    }

    async fn delete_transaction(&self, id: &str) -> Result<(), StoreError> {
        let done = sqlx::query("DELETE FROM transactions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::not_found(Kind::Transaction, id));
        }
        Ok(())
    }

    async fn commit_issue(&self, loan: NewTransaction) -> Result<Transaction, StoreError> {
        let mut tx = self.pool.begin().await?;

        let taken = sqlx::query(
            "UPDATE books SET quantity = quantity - 1, updated_at = now() \
             WHERE id = $1 AND quantity > 0",
        )
        .bind(&loan.book_id)
        .execute(&mut tx)
        .await?;

        if taken.rows_affected() == 0 {
            let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM books WHERE id = $1")
                .bind(&loan.book_id)
                .fetch_optional(&mut tx)
                .await?;
            return Err(match exists {
                Some(_) => Conflict::Unavailable {
                    book_id: loan.book_id,
                }
                .into(),
                None => StoreError::not_found(Kind::Book, &loan.book_id),
            });
        }

        let inserted = sqlx::query_as::<_, TransactionRow>(
            "INSERT INTO transactions (id, book_id, book_title, user_id, user_name, user_usn, \
             issue_date, due_date, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING *",
        )
        .bind(new_id())
        .bind(&loan.book_id)
        .bind(&loan.book_title)
        .bind(&loan.user_id)
        .bind(&loan.user_name)
        .bind(&loan.user_usn)
        .bind(loan.issue_date)
        .bind(loan.due_date)
        .bind(LoanStatus::Issued.as_str())
        .fetch_one(&mut tx)
        .await;

        // dropping `tx` on any error path rolls the decrement back
        let row = match inserted {
            Ok(row) => row,
            Err(err) if unique_violation(&err).as_deref() == Some(ACTIVE_LOAN_INDEX) => {
                return Err(Conflict::DuplicateActiveLoan {
                    book_id: loan.book_id,
                    user_id: loan.user_id,
                }
                .into())
            }
            Err(err) => return Err(err.into()),
        };

        tx.commit().await?;
        row.try_into()
    }

    async fn commit_return(
        &self,
        transaction_id: &str,
        returned_at: DateTime<Utc>,
    ) -> Result<Transaction, StoreError> {
        let mut tx = self.pool.begin().await?;

        let closed: Option<TransactionRow> = sqlx::query_as(
            "UPDATE transactions SET status = $2, return_date = $3 \
             WHERE id = $1 AND status = $4 RETURNING *",
        )
        .bind(transaction_id)
        .bind(LoanStatus::Returned.as_str())
        .bind(returned_at)
        .bind(LoanStatus::Issued.as_str())
        .fetch_optional(&mut tx)
        .await?;

        let Some(closed) = closed else {
            let exists: Option<(String,)> =
                sqlx::query_as("SELECT id FROM transactions WHERE id = $1")
                    .bind(transaction_id)
                    .fetch_optional(&mut tx)
                    .await?;
            return Err(match exists {
                Some(_) => Conflict::NotCurrentlyIssued {
                    transaction_id: transaction_id.to_string(),
                }
                .into(),
                None => StoreError::not_found(Kind::Transaction, transaction_id),
            });
        };

        // the book may have been removed meanwhile; nothing to restock then
        sqlx::query("UPDATE books SET quantity = quantity + 1, updated_at = now() WHERE id = $1")
            .bind(&closed.book_id)
            .execute(&mut tx)
            .await?;

        tx.commit().await?;
        closed.try_into()
    }

    async fn discard_transaction(&self, transaction_id: &str) -> Result<Transaction, StoreError> {
        let mut tx = self.pool.begin().await?;

        let removed: Option<TransactionRow> =
            sqlx::query_as("DELETE FROM transactions WHERE id = $1 RETURNING *")
                .bind(transaction_id)
                .fetch_optional(&mut tx)
                .await?;
        let removed: Transaction = removed
            .ok_or_else(|| StoreError::not_found(Kind::Transaction, transaction_id))?
            .try_into()?;

        if removed.is_active() {
            sqlx::query(
                "UPDATE books SET quantity = quantity + 1, updated_at = now() WHERE id = $1",
            )
            .bind(&removed.book_id)
            .execute(&mut tx)
            .await?;
        }

        tx.commit().await?;
        Ok(removed)
    }
}
