use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use validator::Validate;

pub type Id = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    User,
    Book,
    Transaction,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Kind::User => "user",
            Kind::Book => "book",
            Kind::Transaction => "transaction",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {field} value {value:?}")]
pub struct UnknownVariant {
    pub field: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text {
            "student" => Ok(Role::Student),
            "admin" => Ok(Role::Admin),
            _ => Err(UnknownVariant {
                field: "role",
                value: text.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
        }
    }
}

impl FromStr for ApprovalStatus {
    type Err = UnknownVariant;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            _ => Err(UnknownVariant {
                field: "approvalStatus",
                value: text.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoanStatus {
    Issued,
    Returned,
}

impl LoanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanStatus::Issued => "issued",
            LoanStatus::Returned => "returned",
        }
    }
}

impl FromStr for LoanStatus {
    type Err = UnknownVariant;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text {
            "issued" => Ok(LoanStatus::Issued),
            "returned" => Ok(LoanStatus::Returned),
            _ => Err(UnknownVariant {
                field: "status",
                value: text.to_string(),
            }),
        }
    }
}

/// Stored account record. `password_hash` is an Argon2 PHC string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Id,
    pub name: String,
    pub email: String,
    pub usn: String,
    pub phone: String,
    pub password_hash: String,
    pub role: Role,
    pub approval_status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_approved(&self) -> bool {
        self.approval_status == ApprovalStatus::Approved
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub usn: String,
    pub phone: String,
    pub password_hash: String,
    pub role: Role,
    pub approval_status: ApprovalStatus,
}

#[derive(Debug, Clone, Default)]
pub struct UserPatch {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub password_hash: Option<String>,
    pub role: Option<Role>,
    pub approval_status: Option<ApprovalStatus>,
}

impl UserPatch {
    pub fn apply(self, user: &mut User) {
        if let Some(name) = self.name {
            user.name = name;
        }
        if let Some(phone) = self.phone {
            user.phone = phone;
        }
        if let Some(password_hash) = self.password_hash {
            user.password_hash = password_hash;
        }
        if let Some(role) = self.role {
            user.role = role;
        }
        if let Some(approval_status) = self.approval_status {
            user.approval_status = approval_status;
        }
    }
}

/// Account as shown to clients: everything but the credential.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: Id,
    pub name: String,
    pub email: String,
    pub usn: String,
    pub phone: String,
    pub role: Role,
    pub approval_status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for Member {
    fn from(user: &User) -> Self {
        Member {
            id: user.id.clone(),
            name: user.name.clone(),
            email: user.email.clone(),
            usn: user.usn.clone(),
            phone: user.phone.clone(),
            role: user.role,
            approval_status: user.approval_status,
            created_at: user.created_at,
        }
    }
}

/// Catalog entry. `quantity` counts the copies currently on the shelf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    pub id: Id,
    pub title: String,
    pub author: String,
    pub isbn: Option<String>,
    pub category: String,
    pub quantity: u32,
    pub cover_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Book {
    pub fn is_available(&self) -> bool {
        self.quantity > 0
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewBook {
    #[validate(length(min = 1))]
    pub title: String,
    #[validate(length(min = 1))]
    pub author: String,
    #[serde(default)]
    pub isbn: Option<String>,
    #[validate(length(min = 1))]
    pub category: String,
    pub quantity: u32,
    #[serde(default)]
    pub cover_url: Option<String>,
}

/// Partial book edit. An empty `isbn` or `cover_url` clears the field.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BookPatch {
    pub title: Option<String>,
    pub author: Option<String>,
    pub isbn: Option<String>,
    pub category: Option<String>,
    pub quantity: Option<u32>,
    pub cover_url: Option<String>,
}

impl BookPatch {
    pub fn apply(self, book: &mut Book) {
        if let Some(title) = self.title {
            book.title = title;
        }
        if let Some(author) = self.author {
            book.author = author;
        }
        if let Some(isbn) = self.isbn {
            book.isbn = non_empty(isbn);
        }
        if let Some(category) = self.category {
            book.category = category;
        }
        if let Some(quantity) = self.quantity {
            book.quantity = quantity;
        }
        if let Some(cover_url) = self.cover_url {
            book.cover_url = non_empty(cover_url);
        }
    }
}

/// One circulation event. Book and user fields are copied at issue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Id,
    pub book_id: Id,
    pub book_title: String,
    pub user_id: Id,
    pub user_name: String,
    #[serde(rename = "userUSN")]
    pub user_usn: String,
    pub issue_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub return_date: Option<DateTime<Utc>>,
    pub status: LoanStatus,
}

impl Transaction {
    pub fn is_active(&self) -> bool {
        self.status == LoanStatus::Issued
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && now > self.due_date
    }

    /// The date fines are measured against: the return date once closed.
    pub fn fine_reference(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.return_date.unwrap_or(now)
    }

    pub fn holds(&self, book_id: &str, user_id: &str) -> bool {
        self.is_active() && self.book_id == book_id && self.user_id == user_id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub book_id: Id,
    pub book_title: String,
    pub user_id: Id,
    pub user_name: String,
    pub user_usn: String,
    pub issue_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionPatch {
    pub due_date: Option<DateTime<Utc>>,
    pub return_date: Option<DateTime<Utc>>,
    pub status: Option<LoanStatus>,
}

impl TransactionPatch {
    pub fn apply(self, transaction: &mut Transaction) {
        if let Some(due_date) = self.due_date {
            transaction.due_date = due_date;
        }
        if let Some(return_date) = self.return_date {
            transaction.return_date = Some(return_date);
        }
        if let Some(status) = self.status {
            transaction.status = status;
        }
    }
}

pub fn non_empty(text: String) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.len() == text.len() {
        Some(text)
    } else {
        Some(trimmed.to_string())
    }
}
