//! Structured queries over index documents.
//!
//! A [`Query`] is a conjunction of clauses. Each clause targets one text
//! field or the directory flag. An empty query matches everything.

use regex::Regex;

use super::IndexDocument;
use crate::error::{FsError, Result};

/// Default page size when none is requested.
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Text fields a clause can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Name,
    Path,
    ParentPath,
}

impl Field {
    fn value(self, doc: &IndexDocument) -> &str {
        match self {
            Self::Name => &doc.name,
            Self::Path => &doc.path,
            Self::ParentPath => &doc.parent_path,
        }
    }
}

#[derive(Debug, Clone)]
enum Clause {
    Prefix(Field, String),
    Term(Field, String),
    /// Anchored regex; wildcard patterns compile to this too.
    Pattern(Field, Regex),
    /// Lower-cased needle, compared case-insensitively.
    Contains(Field, String),
    IsDir(bool),
}

impl Clause {
    fn matches(&self, doc: &IndexDocument) -> bool {
        match self {
            Self::Prefix(field, prefix) => field.value(doc).starts_with(prefix.as_str()),
            Self::Term(field, term) => field.value(doc) == term,
            Self::Pattern(field, re) => re.is_match(field.value(doc)),
            Self::Contains(field, needle) => field.value(doc).to_lowercase().contains(needle.as_str()),
            Self::IsDir(is_dir) => doc.is_dir == *is_dir,
        }
    }
}

/// A conjunction of clauses plus pagination.
///
/// ```
/// use filegate_core::index::{Field, Query};
///
/// let query = Query::new()
///     .term(Field::ParentPath, "/srv/files/photos")
///     .wildcard(Field::Name, "*.jpg")
///     .page(2, 20);
/// assert_eq!(query.offset(), 20);
/// ```
#[derive(Debug, Clone)]
pub struct Query {
    clauses: Vec<Clause>,
    page: usize,
    size: usize,
}

impl Default for Query {
    fn default() -> Self {
        Self::new()
    }
}

impl Query {
    /// A query matching every document, first page, default size.
    pub fn new() -> Self {
        Self {
            clauses: Vec::new(),
            page: 1,
            size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn prefix(mut self, field: Field, prefix: impl Into<String>) -> Self {
        self.clauses.push(Clause::Prefix(field, prefix.into()));
        self
    }

    pub fn term(mut self, field: Field, term: impl Into<String>) -> Self {
        self.clauses.push(Clause::Term(field, term.into()));
        self
    }

    /// Adds a regex clause. The pattern must match the whole field value.
    pub fn regex(mut self, field: Field, pattern: &str) -> Result<Self> {
        let re = Regex::new(&format!("^(?:{pattern})$"))
            .map_err(|e| FsError::InvalidInput(format!("invalid pattern {pattern:?}: {e}")))?;
        self.clauses.push(Clause::Pattern(field, re));
        Ok(self)
    }

    /// Adds a wildcard clause: `*` matches any run, `?` one character.
    pub fn wildcard(mut self, field: Field, pattern: &str) -> Self {
        let clause = match wildcard_regex(pattern) {
            Ok(re) => Clause::Pattern(field, re),
            // Only reachable when the pattern exceeds the regex size limit
            Err(_) => Clause::Term(field, pattern.to_string()),
        };
        self.clauses.push(clause);
        self
    }

    /// Adds a case-insensitive substring clause.
    pub fn contains(mut self, field: Field, needle: &str) -> Self {
        self.clauses.push(Clause::Contains(field, needle.to_lowercase()));
        self
    }

    pub fn is_dir(mut self, is_dir: bool) -> Self {
        self.clauses.push(Clause::IsDir(is_dir));
        self
    }

    /// Selects a 1-based page. A zero index or size falls back to the default.
    pub fn page(mut self, index: usize, size: usize) -> Self {
        self.page = index.max(1);
        self.size = if size == 0 { DEFAULT_PAGE_SIZE } else { size };
        self
    }

    pub fn page_size(&self) -> usize {
        self.size
    }

    pub fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.size)
    }

    pub fn matches(&self, doc: &IndexDocument) -> bool {
        self.clauses.iter().all(|clause| clause.matches(doc))
    }
}

fn wildcard_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut buf = [0u8; 4];
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
    }
    re.push('$');
    Regex::new(&re)
}
