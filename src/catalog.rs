use crate::{
    error::{Error, Invalid, Result},
    models::{non_empty, Book, BookPatch, NewBook},
    store::EntityStore,
};
use serde::Serialize;
use std::{collections::HashMap, fmt, mem, sync::Arc};
use tracing::{info, warn};
use validator::Validate;

pub const EXPORT_HEADER: [&str; 6] =
    ["title", "author", "isbn", "category", "quantity", "coverUrl"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
}

/// Book maintenance for administrators.
#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn EntityStore>,
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog").finish_non_exhaustive()
    }
}

impl Catalog {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    pub async fn get_book(&self, id: &str) -> Result<Book> {
        Ok(self.store.get_book(id).await?)
    }

    pub async fn add_book(&self, book: NewBook) -> Result<Book> {
        let book = NewBook {
            title: book.title.trim().to_string(),
            author: book.author.trim().to_string(),
            isbn: book.isbn.and_then(non_empty),
            category: book.category.trim().to_string(),
            quantity: book.quantity,
            cover_url: book.cover_url.and_then(non_empty),
        };
        book.validate()?;

        let created = self.store.create_book(book).await?;
        info!(book_id = %created.id, title = %created.title, "book added");
        Ok(created)
    }

    pub async fn edit_book(&self, id: &str, patch: BookPatch) -> Result<Book> {
        for (name, value) in [
            ("title", &patch.title),
            ("author", &patch.author),
            ("category", &patch.category),
        ] {
            if value.as_deref().is_some_and(|text| text.trim().is_empty()) {
                return Err(Error::field(name));
            }
        }

        let updated = self.store.update_book(id, patch).await?;
        info!(book_id = %updated.id, quantity = updated.quantity, "book edited");
        Ok(updated)
    }

    /// Open loans keep their title snapshot; returning one later restocks nothing.
    pub async fn remove_book(&self, id: &str) -> Result<Book> {
        let book = self.store.get_book(id).await?;
        self.store.delete_book(id).await?;
        info!(book_id = %book.id, "book removed");
        Ok(book)
    }

    pub async fn import_csv(&self, text: &str) -> Result<ImportReport> {
        let mut records = split_records(text).into_iter();
        let header = records.next().ok_or(Invalid::EmptyImport)?;
        let columns: Vec<String> = header
            .into_iter()
            .map(|column| column.trim().to_string())
            .collect();

        let mut report = ImportReport {
            imported: 0,
            skipped: 0,
        };
        let mut rows = 0;
        for fields in records {
            rows += 1;
            let record: HashMap<&str, String> = columns
                .iter()
                .map(String::as_str)
                .zip(fields.into_iter().map(|v| v.trim().to_string()))
                .collect();

            let Some(book) = book_from_record(&record) else {
                warn!(row = rows, "skipping import row without title, author or category");
                report.skipped += 1;
                continue;
            };
            self.store.create_book(book).await?;
            report.imported += 1;
        }

        if rows == 0 {
            return Err(Invalid::EmptyImport.into());
        }

        info!(
            imported = report.imported,
            skipped = report.skipped,
            "catalog import finished"
        );
        Ok(report)
    }

    pub async fn export_csv(&self) -> Result<String> {
        let books = self.store.list_books().await?;

        let mut out = quoted_row(EXPORT_HEADER.iter().map(|column| column.to_string()));
        for book in books {
            out.push_str(&quoted_row([
                book.title,
                book.author,
                book.isbn.unwrap_or_default(),
                book.category,
                book.quantity.to_string(),
                book.cover_url.unwrap_or_default(),
            ]));
        }
        Ok(out)
    }
}

fn book_from_record(record: &HashMap<&str, String>) -> Option<NewBook> {
    let field = |name: &str| record.get(name).cloned().and_then(non_empty);

    Some(NewBook {
        title: field("title")?,
        author: field("author")?,
        category: field("category")?,
        isbn: field("isbn"),
        quantity: field("quantity")
            .and_then(|quantity| quantity.parse().ok())
            .unwrap_or(1),
        cover_url: field("coverUrl"),
    })
}

/// Splits CSV text into records of fields, honouring double quotes and `""`
/// escapes. Line breaks inside quotes belong to the field; blank lines are
/// dropped.
fn split_records(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            ('"', _) => in_quotes = !in_quotes,
            (',', false) => fields.push(mem::take(&mut current)),
            ('\r', false) => {}
            ('\n', false) => {
                fields.push(mem::take(&mut current));
                push_record(&mut records, mem::take(&mut fields));
            }
            _ => current.push(c),
        }
    }
    fields.push(current);
    push_record(&mut records, fields);
    records
}

fn push_record(records: &mut Vec<Vec<String>>, fields: Vec<String>) {
    let blank = matches!(fields.as_slice(), [only] if only.trim().is_empty());
    if !blank {
        records.push(fields);
    }
}

fn quoted_row(values: impl IntoIterator<Item = String>) -> String {
    let mut row = values
        .into_iter()
        .map(|value| format!("\"{}\"", value.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(",");
    row.push('\n');
    row
}
