//! Database seam used by the URL rewriter and the snapshot store.
//!
//! Two backends implement [`Database`]: [`MysqlDatabase`] drives the
//! `mysql` client inside the local container, [`SqliteDatabase`] talks to a
//! SQLite file through rusqlite. Values cross the seam as raw bytes so
//! neither backend re-encodes stored text.

mod mysql;
mod sqlite;

use std::fmt;

pub use mysql::MysqlDatabase;
pub use sqlite::SqliteDatabase;

/// Column types the rewriter treats as text.
pub const TEXT_TYPES: &[&str] = &[
    "CHAR",
    "VARCHAR",
    "TINYTEXT",
    "TEXT",
    "MEDIUMTEXT",
    "LONGTEXT",
    "JSON",
];

/// Failures surfaced by a backend, classified for the rewriter's retry
/// policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    /// The connection dropped or the server went away. Retryable once.
    Connection(String),
    /// A write violated a constraint. Terminal for the table.
    Constraint(String),
    Query(String),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::Connection(msg) => write!(f, "connection lost: {}", msg),
            DbError::Constraint(msg) => write!(f, "constraint violation: {}", msg),
            DbError::Query(msg) => write!(f, "query failed: {}", msg),
        }
    }
}

impl std::error::Error for DbError {}

impl From<DbError> for crate::error::StaxError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Connection(msg) => crate::error::StaxError::TransportUnavailable(msg),
            other => crate::error::StaxError::Internal(other.to_string()),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Upper-cased base type without length, e.g. `VARCHAR`.
    pub data_type: String,
    pub is_primary: bool,
}

impl ColumnInfo {
    pub fn is_text(&self) -> bool {
        TEXT_TYPES.contains(&self.data_type.as_str())
    }

    pub fn is_integer(&self) -> bool {
        self.data_type.contains("INT")
    }
}

/// Normalize a declared type (`varchar(255)`, `bigint unsigned`) to its
/// upper-cased base name.
pub fn base_type(declared: &str) -> String {
    declared
        .split(['(', ' '])
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_uppercase()
}

/// One primary-key component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyValue {
    Int(i64),
    Bytes(Vec<u8>),
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(i) => write!(f, "{}", i),
            KeyValue::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

/// Primary key of a row, in key-column order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RowKey(pub Vec<KeyValue>);

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|v| v.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

/// Row-level condition, ANDed into a scan. NULL never counts as a match,
/// so exclusions keep NULL rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Equals { column: String, value: Vec<u8> },
    NotEquals { column: String, value: Vec<u8> },
    NotPrefix { column: String, prefix: Vec<u8> },
}

impl Predicate {
    pub fn column(&self) -> &str {
        match self {
            Predicate::Equals { column, .. }
            | Predicate::NotEquals { column, .. }
            | Predicate::NotPrefix { column, .. } => column,
        }
    }
}

/// A bounded, key-ordered scan.
#[derive(Debug, Clone)]
pub struct ScanRequest<'a> {
    pub table: &'a str,
    pub key_columns: &'a [ColumnInfo],
    pub columns: &'a [String],
    /// Resume strictly after this key.
    pub after: Option<&'a RowKey>,
    /// Keep rows where any listed column contains any needle.
    pub needles: &'a [Vec<u8>],
    pub predicates: &'a [Predicate],
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedRow {
    pub key: RowKey,
    pub values: Vec<Option<Vec<u8>>>,
}

/// Minimal schema-aware access the rewriter needs.
///
/// Writes happen between [`Database::begin`] and [`Database::commit`] or
/// [`Database::rollback`]; one write transaction is open at a time.
pub trait Database: Send + Sync {
    fn engine(&self) -> &'static str;

    fn tables(&self) -> DbResult<Vec<TableInfo>>;

    fn columns(&self, table: &str) -> DbResult<Vec<ColumnInfo>>;

    /// Implicit row identifier for tables without a primary key, if the
    /// engine has one.
    fn row_id(&self) -> Option<ColumnInfo>;

    fn scan(&self, request: &ScanRequest<'_>) -> DbResult<Vec<ScannedRow>>;

    fn begin(&self) -> DbResult<()>;

    fn update(
        &self,
        table: &str,
        key_columns: &[ColumnInfo],
        key: &RowKey,
        column: &str,
        value: &[u8],
    ) -> DbResult<()>;

    /// Push buffered updates to the engine without committing.
    fn flush(&self) -> DbResult<()>;

    fn commit(&self) -> DbResult<()>;

    fn rollback(&self) -> DbResult<()>;
}

/// Identifiers are interpolated into SQL; only plain names are allowed.
pub fn check_identifier(name: &str) -> DbResult<()> {
    if !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '-')
    {
        Ok(())
    } else {
        Err(DbError::Query(format!("unsupported identifier '{}'", name)))
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("`{}`", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_type_strips_length_and_modifiers() {
        assert_eq!(base_type("varchar(255)"), "VARCHAR");
        assert_eq!(base_type("bigint(20) unsigned"), "BIGINT");
        assert_eq!(base_type("longtext"), "LONGTEXT");
        assert_eq!(base_type(""), "");
    }

    #[test]
    fn text_detection() {
        let col = |t: &str| ColumnInfo {
            name: "c".into(),
            data_type: base_type(t),
            is_primary: false,
        };
        assert!(col("longtext").is_text());
        assert!(col("json").is_text());
        assert!(!col("blob").is_text());
        assert!(!col("varbinary(10)").is_text());
        assert!(col("bigint unsigned").is_integer());
    }

    #[test]
    fn identifiers_are_restricted() {
        assert!(check_identifier("wp_2_options").is_ok());
        assert!(check_identifier("wp`; drop").is_err());
        assert!(check_identifier("").is_err());
    }
}
