use crate::{
    models::{
        non_empty, Book, BookPatch, Kind, LoanStatus, NewBook, NewTransaction, NewUser,
        Transaction, TransactionPatch, User, UserPatch,
    },
    store::{Conflict, EntityStore, StoreError},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

pub const USERS_KEY: &str = "sl_users";
pub const BOOKS_KEY: &str = "sl_books";
pub const TRANSACTIONS_KEY: &str = "sl_transactions";

/// Browser-storage style backend: each kind lives as one JSON array under a
/// namespaced key. Every call decodes, edits and re-encodes under one lock.
#[derive(Debug, Default, Clone)]
pub struct LocalStore {
    slots: Arc<RwLock<HashMap<String, String>>>,
    mirror: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct Tables {
    users: Vec<User>,
    books: Vec<Book>,
    transactions: Vec<Transaction>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    // load every slot from the mirror file, creating nothing until first write
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let slots = if path.exists() {
            let text = fs::read_to_string(path)?;
            serde_json::from_str(&text)?
        } else {
            HashMap::new()
        };

        Ok(Self {
            slots: Arc::new(RwLock::new(slots)),
            mirror: Some(path.to_path_buf()),
        })
    }

    /// Raw JSON held under `key`, as a browser's storage would show it.
    pub fn raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        let slots = self.slots.read().map_err(|_| StoreError::Poisoned)?;
        Ok(slots.get(key).cloned())
    }

    fn view<R>(&self, read: impl FnOnce(&Tables) -> R) -> Result<R, StoreError> {
        let slots = self.slots.read().map_err(|_| StoreError::Poisoned)?;
        let tables = Tables::decode(&slots)?;
        Ok(read(&tables))
    }

    fn mutate<R>(
        &self,
        edit: impl FnOnce(&mut Tables) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut slots = self.slots.write().map_err(|_| StoreError::Poisoned)?;
        let mut tables = Tables::decode(&slots)?;
        let result = edit(&mut tables)?;

        // nothing becomes visible until the mirror holds the new state
        let mut staged = slots.clone();
        tables.encode(&mut staged)?;
        if let Some(path) = &self.mirror {
            write_mirror(path, &staged)?;
        }
        *slots = staged;

        Ok(result)
    }
}

fn write_mirror(path: &Path, slots: &HashMap<String, String>) -> Result<(), StoreError> {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);
    fs::write(&staging, serde_json::to_string(slots)?)?;
    fs::rename(&staging, path)?;
    Ok(())
}

impl Tables {
    fn decode(slots: &HashMap<String, String>) -> Result<Self, StoreError> {
        Ok(Tables {
            users: read_slot(slots, USERS_KEY)?,
            books: read_slot(slots, BOOKS_KEY)?,
            transactions: read_slot(slots, TRANSACTIONS_KEY)?,
        })
    }

    fn encode(&self, slots: &mut HashMap<String, String>) -> Result<(), StoreError> {
        slots.insert(USERS_KEY.to_string(), serde_json::to_string(&self.users)?);
        slots.insert(BOOKS_KEY.to_string(), serde_json::to_string(&self.books)?);
        slots.insert(
            TRANSACTIONS_KEY.to_string(),
            serde_json::to_string(&self.transactions)?,
        );
        Ok(())
    }

    fn user_mut(&mut self, id: &str) -> Result<&mut User, StoreError> {
        self.users
            .iter_mut()
            .find(|user| user.id == id)
            .ok_or_else(|| StoreError::not_found(Kind::User, id))
    }

    fn book_mut(&mut self, id: &str) -> Result<&mut Book, StoreError> {
        self.books
            .iter_mut()
            .find(|book| book.id == id)
            .ok_or_else(|| StoreError::not_found(Kind::Book, id))
    }

    fn transaction_mut(&mut self, id: &str) -> Result<&mut Transaction, StoreError> {
        self.transactions
            .iter_mut()
            .find(|transaction| transaction.id == id)
            .ok_or_else(|| StoreError::not_found(Kind::Transaction, id))
    }

    fn restock(&mut self, book_id: &str) {
        if let Some(book) = self.books.iter_mut().find(|book| book.id == book_id) {
            book.quantity = book.quantity.saturating_add(1);
            book.updated_at = Utc::now();
        }
    }

    fn push_transaction(&mut self, new: NewTransaction) -> Transaction {
        let transaction = Transaction {
            id: next_id("TXN", 4, self.transactions.iter().map(|t| t.id.as_str())),
            book_id: new.book_id,
            book_title: new.book_title,
            user_id: new.user_id,
            user_name: new.user_name,
            user_usn: new.user_usn,
            issue_date: new.issue_date,
            due_date: new.due_date,
            return_date: None,
            status: LoanStatus::Issued,
        };
        self.transactions.push(transaction.clone());
        transaction
    }
}

fn read_slot<T: DeserializeOwned>(
    slots: &HashMap<String, String>,
    key: &str,
) -> Result<Vec<T>, StoreError> {
    match slots.get(key) {
        Some(text) => Ok(serde_json::from_str(text)?),
        None => Ok(Vec::new()),
    }
}

// BK001, TXN0001, USR0001: one past the highest numeric suffix in use
fn next_id<'a>(prefix: &str, width: usize, ids: impl Iterator<Item = &'a str>) -> String {
    let max = ids
        .filter_map(|id| id.strip_prefix(prefix))
        .filter_map(|digits| digits.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    format!("{prefix}{:0width$}", max + 1)
}

fn find_cloned<T: Clone>(
    items: &[T],
    kind: Kind,
    id: &str,
    key: impl Fn(&T) -> &str,
) -> Result<T, StoreError> {
    items
        .iter()
        .find(|item| key(item) == id)
        .cloned()
        .ok_or_else(|| StoreError::not_found(kind, id))
}

fn remove_by_id<T>(
    items: &mut Vec<T>,
    kind: Kind,
    id: &str,
    key: impl Fn(&T) -> &str,
) -> Result<T, StoreError> {
    let index = items
        .iter()
        .position(|item| key(item) == id)
        .ok_or_else(|| StoreError::not_found(kind, id))?;
    Ok(items.remove(index))
}

#[async_trait]
impl EntityStore for LocalStore {
    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        self.view(|tables| tables.users.clone())
    }

    async fn get_user(&self, id: &str) -> Result<User, StoreError> {
        self.view(|tables| find_cloned(&tables.users, Kind::User, id, |u| u.id.as_str()))?
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        self.view(|tables| {
            tables
                .users
                .iter()
                .find(|user| user.email == email)
                .cloned()
        })
    }

    async fn create_user(&self, new: NewUser) -> Result<User, StoreError> {
        self.mutate(|tables| {
            if tables.users.iter().any(|user| user.email == new.email) {
                return Err(Conflict::EmailTaken.into());
            }
            if tables
                .users
                .iter()
                .any(|user| user.usn.eq_ignore_ascii_case(&new.usn))
            {
                return Err(Conflict::UsnTaken.into());
            }

            let user = User {
                id: next_id("USR", 4, tables.users.iter().map(|u| u.id.as_str())),
                name: new.name,
                email: new.email,
                usn: new.usn,
                phone: new.phone,
                password_hash: new.password_hash,
                role: new.role,
                approval_status: new.approval_status,
                created_at: Utc::now(),
            };
            tables.users.push(user.clone());
            Ok(user)
        })
    }

    async fn update_user(&self, id: &str, patch: UserPatch) -> Result<User, StoreError> {
        self.mutate(|tables| {
            let user = tables.user_mut(id)?;
            patch.apply(user);
            Ok(user.clone())
        })
    }

    async fn delete_user(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|tables| {
            remove_by_id(&mut tables.users, Kind::User, id, |u| u.id.as_str()).map(drop)
        })
    }

    async fn list_books(&self) -> Result<Vec<Book>, StoreError> {
        self.view(|tables| tables.books.clone())
    }

    async fn get_book(&self, id: &str) -> Result<Book, StoreError> {
        self.view(|tables| find_cloned(&tables.books, Kind::Book, id, |b| b.id.as_str()))?
    }

    async fn create_book(&self, new: NewBook) -> Result<Book, StoreError> {
        self.mutate(|tables| {
            let now = Utc::now();
            let book = Book {
                id: next_id("BK", 3, tables.books.iter().map(|b| b.id.as_str())),
                title: new.title,
                author: new.author,
                isbn: new.isbn.and_then(non_empty),
                category: new.category,
                quantity: new.quantity,
                cover_url: new.cover_url.and_then(non_empty),
                created_at: now,
                updated_at: now,
            };
            tables.books.push(book.clone());
            Ok(book)
        })
    }

    async fn update_book(&self, id: &str, patch: BookPatch) -> Result<Book, StoreError> {
        self.mutate(|tables| {
            let book = tables.book_mut(id)?;
            patch.apply(book);
            book.updated_at = Utc::now();
            Ok(book.clone())
        })
    }

    async fn delete_book(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|tables| {
            remove_by_id(&mut tables.books, Kind::Book, id, |b| b.id.as_str()).map(drop)
        })
    }

    async fn list_transactions(&self) -> Result<Vec<Transaction>, StoreError> {
        self.view(|tables| tables.transactions.clone())
    }

    async fn get_transaction(&self, id: &str) -> Result<Transaction, StoreError> {
        self.view(|tables| {
            find_cloned(&tables.transactions, Kind::Transaction, id, |t| t.id.as_str())
        })?
    }

    async fn create_transaction(&self, new: NewTransaction) -> Result<Transaction, StoreError> {
        self.mutate(|tables| Ok(tables.push_transaction(new)))
    }

    async fn update_transaction(
        &self,
        id: &str,
        patch: TransactionPatch,
    ) -> Result<Transaction, StoreError> {
        self.mutate(|tables| {
            let transaction = tables.transaction_mut(id)?;
            patch.apply(transaction);
            Ok(transaction.clone())
        })
    }

    async fn delete_transaction(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|tables| {
            remove_by_id(&mut tables.transactions, Kind::Transaction, id, |t| {
                t.id.as_str()
            })
            .map(drop)
        })
    }

    async fn commit_issue(&self, loan: NewTransaction) -> Result<Transaction, StoreError> {
        self.mutate(|tables| {
            if tables.book_mut(&loan.book_id)?.quantity == 0 {
                return Err(Conflict::Unavailable {
                    book_id: loan.book_id.clone(),
                }
                .into());
            }
            if tables
                .transactions
                .iter()
                .any(|t| t.holds(&loan.book_id, &loan.user_id))
            {
                return Err(Conflict::DuplicateActiveLoan {
                    book_id: loan.book_id.clone(),
                    user_id: loan.user_id.clone(),
                }
                .into());
            }

            let book = tables.book_mut(&loan.book_id)?;
            book.quantity -= 1;
            book.updated_at = Utc::now();

            Ok(tables.push_transaction(loan))
        })
    }

    async fn commit_return(
        &self,
        transaction_id: &str,
        returned_at: DateTime<Utc>,
    ) -> Result<Transaction, StoreError> {
        self.mutate(|tables| {
            let transaction = tables.transaction_mut(transaction_id)?;
            if !transaction.is_active() {
                return Err(Conflict::NotCurrentlyIssued {
                    transaction_id: transaction_id.to_string(),
                }
                .into());
            }
            transaction.status = LoanStatus::Returned;
            transaction.return_date = Some(returned_at);
            let closed = transaction.clone();

            tables.restock(&closed.book_id);
            Ok(closed)
        })
    }

    async fn discard_transaction(&self, transaction_id: &str) -> Result<Transaction, StoreError> {
        self.mutate(|tables| {
            let removed = remove_by_id(
                &mut tables.transactions,
                Kind::Transaction,
                transaction_id,
                |t| t.id.as_str(),
            )?;
            if removed.is_active() {
                tables.restock(&removed.book_id);
            }
            Ok(removed)
        })
    }
}
