use crate::{
    clock::Clock,
    error::{Denial, Error, Result},
    fine::LoanPolicy,
    models::{Book, Kind, LoanStatus, NewTransaction, Role, Transaction, User},
    store::EntityStore,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt, sync::Arc};
use tracing::info;

pub const RECENT_TRANSACTIONS: usize = 10;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BookSearch {
    pub query: Option<String>,
    pub category: Option<String>,
    pub available_only: bool,
}

impl BookSearch {
    /// Case-insensitive substring over title, author and ISBN; exact category.
    pub fn matches(&self, book: &Book) -> bool {
        let matches_query = match needle(&self.query) {
            Some(needle) => {
                contains(&book.title, &needle)
                    || contains(&book.author, &needle)
                    || book.isbn.as_deref().is_some_and(|isbn| contains(isbn, &needle))
            }
            None => true,
        };
        let matches_category = match exact(&self.category) {
            Some(category) => book.category == category,
            None => true,
        };
        let matches_availability = !self.available_only || book.is_available();

        matches_query && matches_category && matches_availability
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransactionFilter {
    pub query: Option<String>,
    pub status: Option<LoanStatus>,
    pub user_id: Option<String>,
    pub newest_first: bool,
}

impl TransactionFilter {
    /// Case-insensitive substring over book title, user name and USN.
    pub fn matches(&self, transaction: &Transaction) -> bool {
        let matches_query = match needle(&self.query) {
            Some(needle) => {
                contains(&transaction.book_title, &needle)
                    || contains(&transaction.user_name, &needle)
                    || contains(&transaction.user_usn, &needle)
            }
            None => true,
        };
        let matches_status = self.status.map_or(true, |status| transaction.status == status);
        let matches_user = match exact(&self.user_id) {
            Some(user_id) => transaction.user_id == user_id,
            None => true,
        };

        matches_query && matches_status && matches_user
    }

    /// Filters in listing order, then optionally sorts by issue date, newest first.
    pub fn apply(&self, transactions: Vec<Transaction>) -> Vec<Transaction> {
        let mut kept: Vec<Transaction> = transactions
            .into_iter()
            .filter(|transaction| self.matches(transaction))
            .collect();
        if self.newest_first {
            kept.sort_by(|a, b| b.issue_date.cmp(&a.issue_date));
        }
        kept
    }
}

fn needle(query: &Option<String>) -> Option<String> {
    exact(query).map(str::to_lowercase)
}

fn exact(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|text| !text.is_empty())
}

fn contains(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Loan {
    #[serde(flatten)]
    pub transaction: Transaction,
    pub overdue: bool,
    pub fine: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminDashboard {
    pub total_books: usize,
    pub available_copies: u64,
    pub total_categories: usize,
    pub registered_students: usize,
    pub issued_books: usize,
    pub overdue_books: usize,
    pub recent_transactions: Vec<Loan>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSummary {
    pub issued_books: usize,
    pub overdue_books: usize,
    pub total_fine: u64,
    pub loans: Vec<Loan>,
}

/// Issue and return workflow over an [`EntityStore`].
///
/// Preconditions are checked against fresh reads so callers get a precise
/// error, then the store re-checks them inside its conditional commit; a
/// caller that loses a race sees the same typed error instead of a no-op.
#[derive(Clone)]
pub struct Circulation {
    store: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
    policy: LoanPolicy,
}

impl fmt::Debug for Circulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circulation")
            .field("clock", &self.clock)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Circulation {
    pub fn new(store: Arc<dyn EntityStore>, clock: Arc<dyn Clock>, policy: LoanPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub async fn issue_book(&self, book_id: &str, user_id: &str) -> Result<Transaction> {
        let book = self.store.get_book(book_id).await?;
        if !book.is_available() {
            return Err(Error::Unavailable {
                book_id: book.id,
            });
        }

        let user = self.store.get_user(user_id).await?;

        let transactions = self.store.list_transactions().await?;
        if transactions.iter().any(|t| t.holds(&book.id, &user.id)) {
            return Err(Error::DuplicateActiveLoan {
                book_id: book.id,
                user_id: user.id,
            });
        }

        let now = self.clock.now();
        let transaction = self
            .store
            .commit_issue(NewTransaction {
                book_id: book.id,
                book_title: book.title,
                user_id: user.id,
                user_name: user.name,
                user_usn: user.usn,
                issue_date: now,
                due_date: self.policy.due_date(now),
            })
            .await?;

        info!(
            transaction_id = %transaction.id,
            book_id = %transaction.book_id,
            user_id = %transaction.user_id,
            due = %transaction.due_date,
            "book issued"
        );
        Ok(transaction)
    }

    /// Self-service return: a student may only close their own loans.
    pub async fn return_book(&self, actor: &User, transaction_id: &str) -> Result<Transaction> {
        let transaction = self.store.get_transaction(transaction_id).await?;
        if actor.role != Role::Admin && transaction.user_id != actor.id {
            return Err(Denial::NotOwner.into());
        }
        self.close(transaction).await
    }

    pub async fn force_return(&self, transaction_id: &str) -> Result<Transaction> {
        let transaction = self.store.get_transaction(transaction_id).await?;
        self.close(transaction).await
    }

    async fn close(&self, transaction: Transaction) -> Result<Transaction> {
        if !transaction.is_active() {
            return Err(Error::NotCurrentlyIssued {
                transaction_id: transaction.id,
            });
        }

        let now = self.clock.now();
        let closed = self.store.commit_return(&transaction.id, now).await?;

        info!(
            transaction_id = %closed.id,
            book_id = %closed.book_id,
            fine = self.policy.fine(closed.due_date, now),
            "book returned"
        );
        Ok(closed)
    }

    /// Removes a transaction record. An issued loan gives its copy back first.
    pub async fn delete_transaction(&self, transaction_id: &str) -> Result<Transaction> {
        let removed = self.store.discard_transaction(transaction_id).await?;
        info!(
            transaction_id = %removed.id,
            was_issued = removed.is_active(),
            "transaction deleted"
        );
        Ok(removed)
    }

    /// Fine accrued so far, or the final fine once returned.
    pub fn fine(&self, transaction: &Transaction) -> u64 {
        let as_of = transaction.fine_reference(self.clock.now());
        self.policy.fine(transaction.due_date, as_of)
    }

    pub fn loan(&self, transaction: Transaction) -> Loan {
        let overdue = transaction.is_overdue(self.clock.now());
        let fine = self.fine(&transaction);
        Loan {
            transaction,
            overdue,
            fine,
        }
    }

    pub async fn search_books(&self, search: &BookSearch) -> Result<Vec<Book>> {
        let books = self.store.list_books().await?;
        Ok(books.into_iter().filter(|book| search.matches(book)).collect())
    }

    pub async fn filter_transactions(&self, filter: &TransactionFilter) -> Result<Vec<Loan>> {
        let transactions = self.store.list_transactions().await?;
        Ok(filter
            .apply(transactions)
            .into_iter()
            .map(|transaction| self.loan(transaction))
            .collect())
    }

    /// One of `user`'s own transactions.
    pub async fn loan_for(&self, user: &User, transaction_id: &str) -> Result<Loan> {
        let transaction = self.store.get_transaction(transaction_id).await?;
        if transaction.user_id != user.id {
            // do not reveal other members' loans
            return Err(Error::not_found(Kind::Transaction, transaction_id));
        }
        Ok(self.loan(transaction))
    }

    pub async fn admin_dashboard(&self) -> Result<AdminDashboard> {
        let books = self.store.list_books().await?;
        let users = self.store.list_users().await?;
        let transactions = self.store.list_transactions().await?;
        let now = self.clock.now();

        let categories: HashSet<&str> = books.iter().map(|book| book.category.as_str()).collect();
        let active: Vec<&Transaction> = transactions.iter().filter(|t| t.is_active()).collect();

        let recent = TransactionFilter {
            newest_first: true,
            ..TransactionFilter::default()
        };
        let recent_transactions = recent
            .apply(transactions.clone())
            .into_iter()
            .take(RECENT_TRANSACTIONS)
            .map(|transaction| self.loan(transaction))
            .collect();

        Ok(AdminDashboard {
            total_books: books.len(),
            available_copies: books.iter().map(|book| u64::from(book.quantity)).sum(),
            total_categories: categories.len(),
            registered_students: users.iter().filter(|u| u.role == Role::Student).count(),
            issued_books: active.len(),
            overdue_books: active.iter().filter(|t| t.is_overdue(now)).count(),
            recent_transactions,
        })
    }

    pub async fn student_summary(&self, user: &User) -> Result<StudentSummary> {
        let filter = TransactionFilter {
            user_id: Some(user.id.clone()),
            newest_first: true,
            ..TransactionFilter::default()
        };
        let loans = self.filter_transactions(&filter).await?;

        Ok(StudentSummary {
            issued_books: loans.iter().filter(|l| l.transaction.is_active()).count(),
            overdue_books: loans.iter().filter(|l| l.overdue).count(),
            total_fine: loans.iter().map(|l| l.fine).sum(),
            loans,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        clock::ManualClock,
        local_store::LocalStore,
        models::{ApprovalStatus, NewBook, NewUser},
        store::StoreError,
    };
    use chrono::{Duration, TimeZone, Utc};

    struct Fixture {
        circulation: Circulation,
        store: Arc<LocalStore>,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        fixture_with(LocalStore::new())
    }

    fn fixture_with(store: LocalStore) -> Fixture {
        let store = Arc::new(store);
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 10, 9, 0, 0).unwrap());
        let circulation = Circulation::new(
            store.clone(),
            Arc::new(clock.clone()),
            LoanPolicy::default(),
        );
        Fixture {
            circulation,
            store,
            clock,
        }
    }

    async fn book(fx: &Fixture, title: &str, category: &str, quantity: u32) -> Book {
        fx.store
            .create_book(NewBook {
                title: title.to_string(),
                author: "Alexander & Sadiku".to_string(),
                isbn: Some("978-0-07-338057-5".to_string()),
                category: category.to_string(),
                quantity,
                cover_url: None,
            })
            .await
            .unwrap()
    }

    async fn student(fx: &Fixture, name: &str, usn: &str) -> User {
        fx.store
            .create_user(NewUser {
                name: name.to_string(),
                email: format!("{}@example.com", usn.to_lowercase()),
                usn: usn.to_string(),
                phone: "9876543210".to_string(),
                password_hash: "hash".to_string(),
                role: Role::Student,
                approval_status: ApprovalStatus::Approved,
            })
            .await
            .unwrap()
    }

    async fn quantity(fx: &Fixture, book_id: &str) -> u32 {
        fx.store.get_book(book_id).await.unwrap().quantity
    }

    #[actix_web::test]
    async fn test_issue_snapshots_and_due_date() {
        let fx = fixture();
        let gatsby = book(&fx, "The Great Gatsby", "Classic Literature", 3).await;
        let asha = student(&fx, "Asha", "1CK23EC001").await;

        let issued = fx.circulation.issue_book(&gatsby.id, &asha.id).await.unwrap();

        assert_eq!(issued.status, LoanStatus::Issued);
        assert_eq!(issued.book_title, "The Great Gatsby");
        assert_eq!(issued.user_name, "Asha");
        assert_eq!(issued.user_usn, "1CK23EC001");
        assert_eq!(issued.due_date, issued.issue_date + Duration::days(15));
        assert_eq!(issued.return_date, None);
        assert_eq!(quantity(&fx, &gatsby.id).await, 2);
    }

    #[actix_web::test]
    async fn test_issue_failures_are_distinct() {
        let fx = fixture();
        let empty = book(&fx, "Circuits", "Electrical Engineering", 0).await;
        let algorithms = book(&fx, "Algorithms", "Computer Science", 1).await;
        let asha = student(&fx, "Asha", "1CK23EC001").await;

        assert!(matches!(
            fx.circulation.issue_book("BK999", &asha.id).await,
            Err(Error::NotFound { kind: Kind::Book, .. })
        ));
        assert!(matches!(
            fx.circulation.issue_book(&empty.id, &asha.id).await,
            Err(Error::Unavailable { .. })
        ));
        // zero stock wins over a missing user
        assert!(matches!(
            fx.circulation.issue_book(&empty.id, "USR999").await,
            Err(Error::Unavailable { .. })
        ));
        assert!(matches!(
            fx.circulation.issue_book(&algorithms.id, "USR999").await,
            Err(Error::NotFound { kind: Kind::User, .. })
        ));
        assert_eq!(quantity(&fx, &algorithms.id).await, 1);
    }

    #[actix_web::test]
    async fn test_duplicate_active_loan() {
        let fx = fixture();
        let algorithms = book(&fx, "Algorithms", "Computer Science", 5).await;
        let asha = student(&fx, "Asha", "1CK23EC001").await;

        fx.circulation.issue_book(&algorithms.id, &asha.id).await.unwrap();
        let second = fx.circulation.issue_book(&algorithms.id, &asha.id).await;

        assert!(matches!(second, Err(Error::DuplicateActiveLoan { .. })));
        assert_eq!(quantity(&fx, &algorithms.id).await, 4);
    }

    #[actix_web::test]
    async fn test_return_once() {
        let fx = fixture();
        let algorithms = book(&fx, "Algorithms", "Computer Science", 3).await;
        let asha = student(&fx, "Asha", "1CK23EC001").await;
        let issued = fx.circulation.issue_book(&algorithms.id, &asha.id).await.unwrap();

        let returned = fx.circulation.return_book(&asha, &issued.id).await.unwrap();
        assert_eq!(returned.status, LoanStatus::Returned);
        assert!(returned.return_date.is_some());

        let again = fx.circulation.return_book(&asha, &issued.id).await;
        assert!(matches!(again, Err(Error::NotCurrentlyIssued { .. })));
        assert_eq!(quantity(&fx, &algorithms.id).await, 3);

        assert!(matches!(
            fx.circulation.force_return("TXN9999").await,
            Err(Error::NotFound { kind: Kind::Transaction, .. })
        ));
    }

    #[actix_web::test]
    async fn test_late_return_round_trip() {
        let fx = fixture();
        let algorithms = book(&fx, "Algorithms", "Computer Science", 3).await;
        let asha = student(&fx, "Asha", "1CK23EC001").await;
        let issued = fx.circulation.issue_book(&algorithms.id, &asha.id).await.unwrap();

        fx.clock.advance(Duration::days(20));
        let returned = fx.circulation.force_return(&issued.id).await.unwrap();

        assert_eq!(returned.return_date, Some(issued.issue_date + Duration::days(20)));
        assert_eq!(fx.circulation.fine(&returned), 25);
        assert_eq!(quantity(&fx, &algorithms.id).await, 3);

        // a closed loan stops accruing
        fx.clock.advance(Duration::days(30));
        assert_eq!(fx.circulation.fine(&returned), 25);
    }

    #[actix_web::test]
    async fn test_accruing_fine_on_open_loan() {
        let fx = fixture();
        let algorithms = book(&fx, "Algorithms", "Computer Science", 1).await;
        let asha = student(&fx, "Asha", "1CK23EC001").await;
        let issued = fx.circulation.issue_book(&algorithms.id, &asha.id).await.unwrap();

        fx.clock.advance(Duration::days(15));
        assert_eq!(fx.circulation.fine(&issued), 0);
        fx.clock.advance(Duration::days(1));
        assert_eq!(fx.circulation.fine(&issued), 5);
        fx.clock.advance(Duration::days(9));
        assert_eq!(fx.circulation.fine(&issued), 50);
    }

    #[actix_web::test]
    async fn test_student_cannot_return_others_loan() {
        let fx = fixture();
        let algorithms = book(&fx, "Algorithms", "Computer Science", 2).await;
        let asha = student(&fx, "Asha", "1CK23EC001").await;
        let ravi = student(&fx, "Ravi", "1CK23EC002").await;
        let issued = fx.circulation.issue_book(&algorithms.id, &asha.id).await.unwrap();

        assert!(matches!(
            fx.circulation.return_book(&ravi, &issued.id).await,
            Err(Error::Unauthorized(Denial::NotOwner))
        ));
        assert!(matches!(
            fx.circulation.loan_for(&ravi, &issued.id).await,
            Err(Error::NotFound { .. })
        ));
        assert_eq!(quantity(&fx, &algorithms.id).await, 1);
    }

    #[actix_web::test]
    async fn test_last_copy_goes_to_one_borrower() {
        let fx = fixture();
        let last = book(&fx, "Algorithms", "Computer Science", 1).await;
        let u1 = student(&fx, "Asha", "1CK23EC001").await;
        let u2 = student(&fx, "Ravi", "1CK23EC002").await;

        let outcomes = [
            fx.circulation.issue_book(&last.id, &u1.id).await,
            fx.circulation.issue_book(&last.id, &u2.id).await,
        ];
        let won = outcomes.iter().filter(|r| r.is_ok()).count();
        let lost = outcomes
            .iter()
            .filter(|r| matches!(r, Err(Error::Unavailable { .. })))
            .count();
        assert_eq!((won, lost), (1, 1));
        assert_eq!(quantity(&fx, &last.id).await, 0);
    }

    #[actix_web::test]
    async fn test_failed_mirror_write_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir(&data).unwrap();
        let fx = fixture_with(LocalStore::open(&data.join("library.json")).unwrap());
        let last = book(&fx, "Algorithms", "Computer Science", 1).await;
        let asha = student(&fx, "Asha", "1CK23EC001").await;

        std::fs::remove_dir_all(&data).unwrap();
        assert!(matches!(
            fx.circulation.issue_book(&last.id, &asha.id).await,
            Err(Error::Store(StoreError::Io(_)))
        ));
        assert_eq!(quantity(&fx, &last.id).await, 1);
        assert!(fx.store.list_transactions().await.unwrap().is_empty());

        std::fs::create_dir(&data).unwrap();
        fx.circulation.issue_book(&last.id, &asha.id).await.unwrap();
        assert_eq!(quantity(&fx, &last.id).await, 0);
    }

    #[actix_web::test]
    async fn test_store_rechecks_stale_precondition() {
        let fx = fixture();
        let last = book(&fx, "Algorithms", "Computer Science", 1).await;
        let u1 = student(&fx, "Asha", "1CK23EC001").await;
        let u2 = student(&fx, "Ravi", "1CK23EC002").await;

        // another writer takes the copy between our read and our commit
        let stale = fx.store.get_book(&last.id).await.unwrap();
        fx.circulation.issue_book(&last.id, &u1.id).await.unwrap();
        assert!(stale.is_available());

        let now = fx.clock.now();
        let lost = fx
            .store
            .commit_issue(NewTransaction {
                book_id: stale.id.clone(),
                book_title: stale.title.clone(),
                user_id: u2.id.clone(),
                user_name: u2.name.clone(),
                user_usn: u2.usn.clone(),
                issue_date: now,
                due_date: now + Duration::days(15),
            })
            .await;
        assert!(matches!(
            lost.map_err(Error::from),
            Err(Error::Unavailable { .. })
        ));
        assert_eq!(quantity(&fx, &last.id).await, 0);
    }

    #[actix_web::test]
    async fn test_quantity_never_negative() {
        let fx = fixture();
        let algorithms = book(&fx, "Algorithms", "Computer Science", 2).await;
        let mut members = Vec::new();
        for n in 1..=4 {
            members.push(student(&fx, "Member", &format!("1CK23EC00{n}")).await);
        }

        let mut open = Vec::new();
        for member in &members {
            if let Ok(issued) = fx.circulation.issue_book(&algorithms.id, &member.id).await {
                open.push(issued);
            }
        }
        assert_eq!(open.len(), 2);
        assert_eq!(quantity(&fx, &algorithms.id).await, 0);

        for issued in &open {
            fx.circulation.force_return(&issued.id).await.unwrap();
        }
        assert_eq!(quantity(&fx, &algorithms.id).await, 2);
    }

    #[actix_web::test]
    async fn test_delete_issued_transaction_restores_stock() {
        let fx = fixture();
        let algorithms = book(&fx, "Algorithms", "Computer Science", 1).await;
        let asha = student(&fx, "Asha", "1CK23EC001").await;
        let issued = fx.circulation.issue_book(&algorithms.id, &asha.id).await.unwrap();

        let removed = fx.circulation.delete_transaction(&issued.id).await.unwrap();
        assert_eq!(removed.id, issued.id);
        assert_eq!(quantity(&fx, &algorithms.id).await, 1);

        let returned_loan = fx.circulation.issue_book(&algorithms.id, &asha.id).await.unwrap();
        fx.circulation.force_return(&returned_loan.id).await.unwrap();
        fx.circulation.delete_transaction(&returned_loan.id).await.unwrap();
        assert_eq!(quantity(&fx, &algorithms.id).await, 1);
    }

    #[actix_web::test]
    async fn test_search_books() {
        let fx = fixture();
        book(&fx, "The Great Gatsby", "Classic Literature", 3).await;
        book(&fx, "Introduction to Algorithms", "Computer Science", 0).await;
        book(&fx, "Algorithms Unlocked", "Computer Science", 2).await;

        let search = BookSearch {
            query: Some("ALGO".to_string()),
            ..BookSearch::default()
        };
        let titles: Vec<String> = fx
            .circulation
            .search_books(&search)
            .await
            .unwrap()
            .into_iter()
            .map(|book| book.title)
            .collect();
        assert_eq!(titles, vec!["Introduction to Algorithms", "Algorithms Unlocked"]);

        let search = BookSearch {
            query: Some("algo".to_string()),
            category: Some("Computer Science".to_string()),
            available_only: true,
        };
        let found = fx.circulation.search_books(&search).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].title, "Algorithms Unlocked");

        let search = BookSearch {
            query: Some("338057".to_string()),
            category: Some(String::new()),
            available_only: false,
        };
        assert_eq!(fx.circulation.search_books(&search).await.unwrap().len(), 3);
    }

    #[actix_web::test]
    async fn test_filter_transactions() {
        let fx = fixture();
        let gatsby = book(&fx, "The Great Gatsby", "Classic Literature", 3).await;
        let algorithms = book(&fx, "Algorithms", "Computer Science", 3).await;
        let asha = student(&fx, "Asha", "1CK23EC001").await;
        let ravi = student(&fx, "Ravi", "1CK23CS002").await;

        let first = fx.circulation.issue_book(&gatsby.id, &asha.id).await.unwrap();
        fx.clock.advance(Duration::days(1));
        fx.circulation.issue_book(&algorithms.id, &ravi.id).await.unwrap();
        fx.clock.advance(Duration::days(1));
        fx.circulation.issue_book(&algorithms.id, &asha.id).await.unwrap();
        fx.circulation.force_return(&first.id).await.unwrap();

        let by_usn = TransactionFilter {
            query: Some("cs002".to_string()),
            ..TransactionFilter::default()
        };
        let found = fx.circulation.filter_transactions(&by_usn).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].transaction.user_name, "Ravi");

        let issued = TransactionFilter {
            status: Some(LoanStatus::Issued),
            ..TransactionFilter::default()
        };
        let ids: Vec<String> = fx
            .circulation
            .filter_transactions(&issued)
            .await
            .unwrap()
            .into_iter()
            .map(|loan| loan.transaction.id)
            .collect();
        assert_eq!(ids, vec!["TXN0002", "TXN0003"]);

        let newest = TransactionFilter {
            user_id: Some(asha.id.clone()),
            newest_first: true,
            ..TransactionFilter::default()
        };
        let ids: Vec<String> = fx
            .circulation
            .filter_transactions(&newest)
            .await
            .unwrap()
            .into_iter()
            .map(|loan| loan.transaction.id)
            .collect();
        assert_eq!(ids, vec!["TXN0003", "TXN0001"]);
    }

    #[actix_web::test]
    async fn test_dashboards() {
        let fx = fixture();
        let gatsby = book(&fx, "The Great Gatsby", "Classic Literature", 3).await;
        let algorithms = book(&fx, "Algorithms", "Computer Science", 5).await;
        book(&fx, "Circuits", "Electrical Engineering", 4).await;
        let asha = student(&fx, "Asha", "1CK23EC001").await;
        let ravi = student(&fx, "Ravi", "1CK23EC002").await;

        let late = fx.circulation.issue_book(&gatsby.id, &asha.id).await.unwrap();
        fx.clock.advance(Duration::days(10));
        fx.circulation.issue_book(&algorithms.id, &asha.id).await.unwrap();
        fx.circulation.issue_book(&algorithms.id, &ravi.id).await.unwrap();
        fx.clock.advance(Duration::days(8));

        let dashboard = fx.circulation.admin_dashboard().await.unwrap();
        assert_eq!(dashboard.total_books, 3);
        assert_eq!(dashboard.available_copies, 2 + 3 + 4);
        assert_eq!(dashboard.total_categories, 3);
        assert_eq!(dashboard.registered_students, 2);
        assert_eq!(dashboard.issued_books, 3);
        assert_eq!(dashboard.overdue_books, 1);
        assert_eq!(dashboard.recent_transactions.len(), 3);
        assert_eq!(dashboard.recent_transactions[2].transaction.id, late.id);

        let summary = fx.circulation.student_summary(&asha).await.unwrap();
        assert_eq!(summary.issued_books, 2);
        assert_eq!(summary.overdue_books, 1);
        assert_eq!(summary.total_fine, 15);
        assert_eq!(summary.loans[1].transaction.id, late.id);
        assert!(summary.loans[1].overdue);
    }
}
