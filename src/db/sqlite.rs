//! SQLite backend (rusqlite).

use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, ErrorCode};

use super::{
    ColumnInfo, Database, DbError, DbResult, KeyValue, Predicate, RowKey, ScanRequest,
    ScannedRow, TableInfo, base_type, check_identifier, quote_ident,
};

fn classify(e: rusqlite::Error) -> DbError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) => match err.code {
            ErrorCode::ConstraintViolation => DbError::Constraint(e.to_string()),
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure => DbError::Connection(e.to_string()),
            _ => DbError::Query(e.to_string()),
        },
        _ => DbError::Query(e.to_string()),
    }
}

/// Text when the bytes are UTF-8, blob otherwise.
fn bind_bytes(bytes: &[u8]) -> Value {
    match std::str::from_utf8(bytes) {
        Ok(s) => Value::Text(s.to_string()),
        Err(_) => Value::Blob(bytes.to_vec()),
    }
}

fn bind_key(value: &KeyValue) -> Value {
    match value {
        KeyValue::Int(i) => Value::Integer(*i),
        KeyValue::Bytes(b) => bind_bytes(b),
    }
}

fn value_bytes(value: ValueRef<'_>) -> Option<Vec<u8>> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string().into_bytes()),
        ValueRef::Real(f) => Some(f.to_string().into_bytes()),
        ValueRef::Text(t) => Some(t.to_vec()),
        ValueRef::Blob(b) => Some(b.to_vec()),
    }
}

fn key_value(value: ValueRef<'_>) -> KeyValue {
    match value {
        ValueRef::Integer(i) => KeyValue::Int(i),
        other => KeyValue::Bytes(value_bytes(other).unwrap_or_default()),
    }
}

/// SQL literal for a dump line.
fn literal(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => format!("{:?}", f),
        ValueRef::Text(t) => match std::str::from_utf8(t) {
            Ok(s) => format!("'{}'", s.replace('\'', "''")),
            Err(_) => format!("CAST(X'{}' AS TEXT)", hex::encode_upper(t)),
        },
        ValueRef::Blob(b) => format!("X'{}'", hex::encode_upper(b)),
    }
}

/// A SQLite database file.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    pub fn open(path: &Path) -> DbResult<Self> {
        let conn = Connection::open(path).map_err(classify)?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory().map_err(classify)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| DbError::Connection(format!("connection lock poisoned: {}", e)))
    }

    pub fn execute_batch(&self, sql: &str) -> DbResult<()> {
        self.lock()?.execute_batch(sql).map_err(classify)
    }

    /// First column of every row as text.
    pub fn query_column(&self, sql: &str) -> DbResult<Vec<Option<String>>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(classify)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(value_bytes(row.get_ref(0)?)
                    .map(|b| String::from_utf8_lossy(&b).into_owned()))
            })
            .map_err(classify)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(classify)
    }

    /// Write a replayable SQL dump of every table and index.
    pub fn dump(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let conn = self
            .lock()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let io = |e: rusqlite::Error| std::io::Error::other(e.to_string());

        writeln!(out, "PRAGMA foreign_keys=OFF;")?;
        writeln!(out, "BEGIN TRANSACTION;")?;

        let mut stmt = conn
            .prepare(
                "SELECT type, name, sql FROM sqlite_master \
                 WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite_%' \
                 ORDER BY CASE type WHEN 'table' THEN 0 ELSE 1 END, name",
            )
            .map_err(io)?;
        let objects: Vec<(String, String, String)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .map_err(io)?
            .collect::<Result<_, _>>()
            .map_err(io)?;

        for (kind, name, sql) in &objects {
            if kind == "table" {
                writeln!(out, "DROP TABLE IF EXISTS {};", quote_ident(name))?;
                writeln!(out, "{};", sql)?;

                let mut rows = conn
                    .prepare(&format!("SELECT * FROM {}", quote_ident(name)))
                    .map_err(io)?;
                let width = rows.column_count();
                let mut cursor = rows.query([]).map_err(io)?;
                while let Some(row) = cursor.next().map_err(io)? {
                    let mut values = Vec::with_capacity(width);
                    for i in 0..width {
                        values.push(literal(row.get_ref(i).map_err(io)?));
                    }
                    writeln!(
                        out,
                        "INSERT INTO {} VALUES({});",
                        quote_ident(name),
                        values.join(",")
                    )?;
                }
            } else {
                writeln!(out, "{};", sql)?;
            }
        }

        writeln!(out, "COMMIT;")?;
        Ok(())
    }

    /// Replay a dump statement by statement without buffering the whole
    /// input. Returns the number of `CREATE TABLE` statements seen.
    pub fn load(&self, input: &mut dyn Read) -> DbResult<usize> {
        let conn = self.lock()?;
        let reader = BufReader::new(input);
        let mut statement = String::new();
        let mut tables = 0;

        for line in reader.lines() {
            let line = line.map_err(|e| DbError::Query(e.to_string()))?;
            if statement.is_empty() && (line.trim().is_empty() || line.starts_with("--")) {
                continue;
            }
            statement.push_str(&line);
            statement.push('\n');
            let quotes = statement.bytes().filter(|b| *b == b'\'').count();
            if line.trim_end().ends_with(';') && quotes % 2 == 0 {
                if statement.trim_start().to_ascii_uppercase().starts_with("CREATE TABLE") {
                    tables += 1;
                }
                conn.execute_batch(&statement).map_err(classify)?;
                statement.clear();
            }
        }
        if !statement.trim().is_empty() {
            conn.execute_batch(&statement).map_err(classify)?;
        }
        Ok(tables)
    }
}

fn predicate_sql(p: &Predicate, params: &mut Vec<Value>) -> DbResult<String> {
    check_identifier(p.column())?;
    let col = quote_ident(p.column());
    Ok(match p {
        Predicate::Equals { value, .. } => {
            params.push(bind_bytes(value));
            format!("{} = ?", col)
        }
        Predicate::NotEquals { value, .. } => {
            params.push(bind_bytes(value));
            format!("({0} IS NULL OR {0} <> ?)", col)
        }
        Predicate::NotPrefix { prefix, .. } => {
            let len = String::from_utf8_lossy(prefix).chars().count();
            params.push(bind_bytes(prefix));
            format!("({0} IS NULL OR substr({0}, 1, {1}) <> ?)", col, len)
        }
    })
}

impl Database for SqliteDatabase {
    fn engine(&self) -> &'static str {
        "sqlite"
    }

    fn tables(&self) -> DbResult<Vec<TableInfo>> {
        let names = self.query_column(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        Ok(names
            .into_iter()
            .flatten()
            .map(|name| TableInfo {
                name,
                comment: String::new(),
            })
            .collect())
    }

    fn columns(&self, table: &str) -> DbResult<Vec<ColumnInfo>> {
        check_identifier(table)?;
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))
            .map_err(classify)?;
        let cols = stmt
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let declared: String = row.get(2)?;
                let pk: i64 = row.get(5)?;
                Ok((pk, ColumnInfo {
                    name,
                    data_type: base_type(&declared),
                    is_primary: pk > 0,
                }))
            })
            .map_err(classify)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify)?;

        // Composite keys are ordered by their position in the key.
        let mut cols = cols;
        cols.sort_by_key(|(pk, _)| if *pk > 0 { *pk } else { i64::MAX });
        let mut keys: Vec<ColumnInfo> = Vec::new();
        let mut rest: Vec<ColumnInfo> = Vec::new();
        for (_, c) in cols {
            if c.is_primary {
                keys.push(c);
            } else {
                rest.push(c);
            }
        }
        keys.extend(rest);
        Ok(keys)
    }

    fn row_id(&self) -> Option<ColumnInfo> {
        Some(ColumnInfo {
            name: "rowid".to_string(),
            data_type: "INTEGER".to_string(),
            is_primary: true,
        })
    }

    fn scan(&self, req: &ScanRequest<'_>) -> DbResult<Vec<ScannedRow>> {
        check_identifier(req.table)?;
        let mut params: Vec<Value> = Vec::new();
        let keys: Vec<String> = req
            .key_columns
            .iter()
            .map(|k| check_identifier(&k.name).map(|_| quote_ident(&k.name)))
            .collect::<DbResult<_>>()?;
        let cols: Vec<String> = req
            .columns
            .iter()
            .map(|c| check_identifier(c).map(|_| quote_ident(c)))
            .collect::<DbResult<_>>()?;

        let mut sql = format!(
            "SELECT {} FROM {} WHERE 1 = 1",
            keys.iter().chain(cols.iter()).cloned().collect::<Vec<_>>().join(", "),
            quote_ident(req.table)
        );

        if let Some(after) = req.after {
            let marks = vec!["?"; keys.len()].join(", ");
            sql.push_str(&format!(" AND ({}) > ({})", keys.join(", "), marks));
            params.extend(after.0.iter().map(bind_key));
        }

        if !req.needles.is_empty() && !cols.is_empty() {
            let mut any = Vec::new();
            for col in &cols {
                for needle in req.needles {
                    any.push(format!("instr({}, ?) > 0", col));
                    params.push(bind_bytes(needle));
                }
            }
            sql.push_str(&format!(" AND ({})", any.join(" OR ")));
        }

        for p in req.predicates {
            sql.push_str(&format!(" AND {}", predicate_sql(p, &mut params)?));
        }

        sql.push_str(&format!(" ORDER BY {} LIMIT {}", keys.join(", "), req.limit));

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).map_err(classify)?;
        let width = keys.len();
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                let mut key = Vec::with_capacity(width);
                for i in 0..width {
                    key.push(key_value(row.get_ref(i)?));
                }
                let mut values = Vec::with_capacity(cols.len());
                for i in 0..cols.len() {
                    values.push(value_bytes(row.get_ref(width + i)?));
                }
                Ok(ScannedRow {
                    key: RowKey(key),
                    values,
                })
            })
            .map_err(classify)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(classify)
    }

    fn begin(&self) -> DbResult<()> {
        self.execute_batch("BEGIN IMMEDIATE")
    }

    fn update(
        &self,
        table: &str,
        key_columns: &[ColumnInfo],
        key: &RowKey,
        column: &str,
        value: &[u8],
    ) -> DbResult<()> {
        check_identifier(table)?;
        check_identifier(column)?;
        let mut clauses = Vec::new();
        for k in key_columns {
            check_identifier(&k.name)?;
            clauses.push(format!("{} = ?", quote_ident(&k.name)));
        }
        let sql = format!(
            "UPDATE {} SET {} = ? WHERE {}",
            quote_ident(table),
            quote_ident(column),
            clauses.join(" AND ")
        );
        let mut params = vec![bind_bytes(value)];
        params.extend(key.0.iter().map(bind_key));

        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&sql).map_err(classify)?;
        stmt.execute(rusqlite::params_from_iter(params.iter()))
            .map_err(classify)?;
        Ok(())
    }

    fn flush(&self) -> DbResult<()> {
        Ok(())
    }

    fn commit(&self) -> DbResult<()> {
        self.execute_batch("COMMIT")
    }

    fn rollback(&self) -> DbResult<()> {
        let conn = self.lock()?;
        if conn.is_autocommit() {
            return Ok(());
        }
        conn.execute_batch("ROLLBACK").map_err(classify)
    }
}
