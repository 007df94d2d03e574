//! MySQL backend driven through the container's `mysql` client.
//!
//! Reads run one batch-mode client call per query, with every text value
//! selected as `HEX()` so bytes survive the tab-separated output untouched.
//! Writes go through one long-lived client process per transaction: updates
//! are streamed to its stdin as `X'..'` literals and the process exit status
//! decides whether the transaction committed.

use std::io::{BufWriter, Write};
use std::process::{Child, ChildStdin, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{
    ColumnInfo, Database, DbError, DbResult, KeyValue, Predicate, RowKey, ScanRequest,
    ScannedRow, TableInfo, base_type, check_identifier, quote_ident,
};
use crate::container::ContainerCli;
use crate::process::{STDERR_TAIL_LINES, TailCapture, run_captured, wait_with_deadline};

const QUERY_TIMEOUT: Duration = Duration::from_secs(300);
const COMMIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Map client stderr to a [`DbError`] class.
fn classify(stderr: &str) -> DbError {
    let msg = stderr.trim().to_string();
    let code = msg
        .split_whitespace()
        .skip_while(|w| *w != "ERROR")
        .nth(1)
        .and_then(|c| c.parse::<u32>().ok());
    match code {
        // duplicate key, foreign key parent/child, NOT NULL, data too long
        Some(1062 | 1451 | 1452 | 1048 | 1406) => DbError::Constraint(msg),
        // server gone away, lost connection, can't connect
        Some(2002 | 2003 | 2006 | 2013) => DbError::Connection(msg),
        Some(_) => DbError::Query(msg),
        None => DbError::Connection(if msg.is_empty() {
            "database client exited without output".to_string()
        } else {
            msg
        }),
    }
}

fn hex_literal(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        "''".to_string()
    } else {
        format!("X'{}'", hex::encode_upper(bytes))
    }
}

fn key_literal(value: &KeyValue) -> String {
    match value {
        KeyValue::Int(i) => i.to_string(),
        KeyValue::Bytes(b) => hex_literal(b),
    }
}

fn predicate_sql(p: &Predicate) -> DbResult<String> {
    check_identifier(p.column())?;
    let col = quote_ident(p.column());
    Ok(match p {
        Predicate::Equals { value, .. } => format!("{} = {}", col, hex_literal(value)),
        Predicate::NotEquals { value, .. } => {
            format!("({0} IS NULL OR {0} <> {1})", col, hex_literal(value))
        }
        Predicate::NotPrefix { prefix, .. } => format!(
            "({0} IS NULL OR LEFT(BINARY {0}, {1}) <> {2})",
            col,
            prefix.len(),
            hex_literal(prefix)
        ),
    })
}

/// Split batch output into rows of tab-separated fields.
fn rows(stdout: &[u8]) -> Vec<Vec<String>> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| l.split('\t').map(str::to_string).collect())
        .collect()
}

fn unhex(field: &str) -> DbResult<Option<Vec<u8>>> {
    if field == "NULL" {
        return Ok(None);
    }
    hex::decode(field)
        .map(Some)
        .map_err(|e| DbError::Query(format!("bad hex from client: {}", e)))
}

struct Writer {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stderr: TailCapture,
}

/// MySQL reached through `<container> mysql`.
pub struct MysqlDatabase {
    cli: ContainerCli,
    writer: Mutex<Option<Writer>>,
    cancel: CancellationToken,
}

impl MysqlDatabase {
    pub fn new(cli: ContainerCli, cancel: CancellationToken) -> Self {
        Self {
            cli,
            writer: Mutex::new(None),
            cancel,
        }
    }

    fn query(&self, sql: &str) -> DbResult<Vec<Vec<String>>> {
        let cmd = self.cli.mysql_command(["-N", "-B", "--raw", "-e", sql]);
        let captured = run_captured(cmd, QUERY_TIMEOUT, &self.cancel, "mysql query")
            .map_err(|e| DbError::Connection(e.to_string()))?;
        if !captured.status.success() {
            return Err(classify(&captured.stderr));
        }
        Ok(rows(&captured.stdout))
    }

    fn writer(&self) -> DbResult<MutexGuard<'_, Option<Writer>>> {
        self.writer
            .lock()
            .map_err(|e| DbError::Connection(format!("writer lock poisoned: {}", e)))
    }

    /// Close stdin and wait for the client, classifying a failure.
    fn finish(&self, mut w: Writer, last: &str) -> DbResult<()> {
        let written = w
            .stdin
            .write_all(last.as_bytes())
            .and_then(|()| w.stdin.flush());
        drop(w.stdin);
        let status = wait_with_deadline(&mut w.child, COMMIT_TIMEOUT, &self.cancel, "mysql commit")
            .map_err(|e| DbError::Connection(e.to_string()))?;
        let tail = w.stderr.finish();
        if !status.success() {
            return Err(classify(&tail));
        }
        written.map_err(|e| DbError::Connection(e.to_string()))
    }
}

impl Database for MysqlDatabase {
    fn engine(&self) -> &'static str {
        "mysql"
    }

    fn tables(&self) -> DbResult<Vec<TableInfo>> {
        let rows = self.query(
            "SELECT TABLE_NAME, HEX(TABLE_COMMENT) FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE' \
             ORDER BY TABLE_NAME",
        )?;
        rows.into_iter()
            .map(|r| {
                let name = r.first().cloned().unwrap_or_default();
                let comment = match r.get(1) {
                    Some(h) => unhex(h)?.unwrap_or_default(),
                    None => Vec::new(),
                };
                Ok(TableInfo {
                    name,
                    comment: String::from_utf8_lossy(&comment).into_owned(),
                })
            })
            .collect()
    }

    fn columns(&self, table: &str) -> DbResult<Vec<ColumnInfo>> {
        check_identifier(table)?;
        let rows = self.query(&format!(
            "SELECT COLUMN_NAME, COLUMN_TYPE, COLUMN_KEY FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = '{}' ORDER BY ORDINAL_POSITION",
            table
        ))?;
        let mut cols: Vec<ColumnInfo> = rows
            .into_iter()
            .filter(|r| r.len() >= 2)
            .map(|r| ColumnInfo {
                name: r[0].clone(),
                data_type: base_type(&r[1]),
                is_primary: r.get(2).is_some_and(|k| k == "PRI"),
            })
            .collect();
        // Key columns first, in table order.
        cols.sort_by_key(|c| !c.is_primary);
        Ok(cols)
    }

    fn row_id(&self) -> Option<ColumnInfo> {
        None
    }

    fn scan(&self, req: &ScanRequest<'_>) -> DbResult<Vec<ScannedRow>> {
        check_identifier(req.table)?;
        let mut select = Vec::new();
        for k in req.key_columns {
            check_identifier(&k.name)?;
            if k.is_integer() {
                select.push(quote_ident(&k.name));
            } else {
                select.push(format!("HEX({})", quote_ident(&k.name)));
            }
        }
        for c in req.columns {
            check_identifier(c)?;
            select.push(format!("HEX({})", quote_ident(c)));
        }
        let keys: Vec<String> = req.key_columns.iter().map(|k| quote_ident(&k.name)).collect();

        let mut sql = format!(
            "SELECT {} FROM {} WHERE 1 = 1",
            select.join(", "),
            quote_ident(req.table)
        );
        if let Some(after) = req.after {
            let values: Vec<String> = after.0.iter().map(key_literal).collect();
            sql.push_str(&format!(" AND ({}) > ({})", keys.join(", "), values.join(", ")));
        }
        if !req.needles.is_empty() && !req.columns.is_empty() {
            let mut any = Vec::new();
            for c in req.columns {
                for needle in req.needles {
                    any.push(format!(
                        "LOCATE({}, BINARY {}) > 0",
                        hex_literal(needle),
                        quote_ident(c)
                    ));
                }
            }
            sql.push_str(&format!(" AND ({})", any.join(" OR ")));
        }
        for p in req.predicates {
            sql.push_str(&format!(" AND {}", predicate_sql(p)?));
        }
        sql.push_str(&format!(" ORDER BY {} LIMIT {}", keys.join(", "), req.limit));

        let width = req.key_columns.len();
        self.query(&sql)?
            .into_iter()
            .map(|fields| {
                if fields.len() != width + req.columns.len() {
                    return Err(DbError::Query(format!(
                        "expected {} fields, got {}",
                        width + req.columns.len(),
                        fields.len()
                    )));
                }
                let mut key = Vec::with_capacity(width);
                for (k, f) in req.key_columns.iter().zip(&fields) {
                    key.push(if k.is_integer() {
                        KeyValue::Int(f.parse().map_err(|_| {
                            DbError::Query(format!("non-integer key '{}' in {}", f, req.table))
                        })?)
                    } else {
                        KeyValue::Bytes(unhex(f)?.unwrap_or_default())
                    });
                }
                let values = fields[width..]
                    .iter()
                    .map(|f| unhex(f))
                    .collect::<DbResult<Vec<_>>>()?;
                Ok(ScannedRow {
                    key: RowKey(key),
                    values,
                })
            })
            .collect()
    }

    fn begin(&self) -> DbResult<()> {
        let mut slot = self.writer()?;
        if slot.is_some() {
            return Err(DbError::Query("a write transaction is already open".into()));
        }
        let mut child = self
            .cli
            .mysql_command(["--batch"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DbError::Connection(format!("cannot start mysql client: {}", e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DbError::Connection("mysql client has no stdin".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DbError::Connection("mysql client has no stderr".into()))?;
        let mut w = Writer {
            child,
            stdin: BufWriter::new(stdin),
            stderr: TailCapture::spawn(stderr, STDERR_TAIL_LINES, |_| true),
        };
        w.stdin
            .write_all(b"SET autocommit = 0;\nSTART TRANSACTION;\n")
            .map_err(|e| DbError::Connection(e.to_string()))?;
        *slot = Some(w);
        Ok(())
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
        for (k, v) in key_columns.iter().zip(&key.0) {
            check_identifier(&k.name)?;
            clauses.push(format!("{} = {}", quote_ident(&k.name), key_literal(v)));
        }
        let statement = format!(
            "UPDATE {} SET {} = {} WHERE {};\n",
            quote_ident(table),
            quote_ident(column),
            hex_literal(value),
            clauses.join(" AND ")
        );

        let mut slot = self.writer()?;
        let w = slot
            .as_mut()
            .ok_or_else(|| DbError::Query("update outside a transaction".into()))?;
        w.stdin
            .write_all(statement.as_bytes())
            .map_err(|e| DbError::Connection(e.to_string()))
    }

    fn flush(&self) -> DbResult<()> {
        let mut slot = self.writer()?;
        let Some(w) = slot.as_mut() else {
            return Ok(());
        };
        if let Err(e) = w.stdin.flush() {
            // The client died; its stderr says why.
            if let Some(w) = slot.take() {
                return self.finish(w, "");
            }
            return Err(DbError::Connection(e.to_string()));
        }
        Ok(())
    }

    fn commit(&self) -> DbResult<()> {
        let taken = self.writer()?.take();
        match taken {
            Some(w) => self.finish(w, "COMMIT;\n"),
            None => Ok(()),
        }
    }

    fn rollback(&self) -> DbResult<()> {
        let taken = self.writer()?.take();
        match taken {
            Some(w) => match self.finish(w, "ROLLBACK;\n") {
                Ok(()) | Err(DbError::Connection(_)) => Ok(()),
                Err(e) => Err(e),
            },
            None => Ok(()),
        }
    }
}
