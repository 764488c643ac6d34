//! Explicit transactions with retried commit and rollback.
//!
//! Transactions are driven with manual `BEGIN IMMEDIATE` / `COMMIT` /
//! `ROLLBACK` statements on the store connection so that a failed commit or
//! rollback can be attempted again. Statements executed with
//! [`Transaction::execute`] are captured for the update log; statements that
//! only concern the local store go through [`Transaction::execute_local`].

use rusqlite::types::{ToSql, ToSqlOutput, Value};
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use tokenkms_common::{Error, Result};

use crate::retry::{RetryExecutor, RetryPolicy};

/// A bound statement parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum SqlParam {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    Integer(i64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlParam::Null => ToSqlOutput::Owned(Value::Null),
            SqlParam::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlParam::Text(s) => ToSqlOutput::Borrowed(s.as_str().into()),
            SqlParam::Blob(b) => ToSqlOutput::Borrowed(b.as_slice().into()),
        })
    }
}

impl From<i64> for SqlParam {
    fn from(v: i64) -> Self {
        SqlParam::Integer(v)
    }
}

impl From<u32> for SqlParam {
    fn from(v: u32) -> Self {
        SqlParam::Integer(v as i64)
    }
}

impl From<u64> for SqlParam {
    fn from(v: u64) -> Self {
        SqlParam::Integer(v as i64)
    }
}

impl From<bool> for SqlParam {
    fn from(v: bool) -> Self {
        SqlParam::Integer(v as i64)
    }
}

impl From<&str> for SqlParam {
    fn from(v: &str) -> Self {
        SqlParam::Text(v.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(v: String) -> Self {
        SqlParam::Text(v)
    }
}

impl<T: Into<SqlParam>> From<Option<T>> for SqlParam {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlParam::Null, Into::into)
    }
}

/// Build a parameter list from heterogeneous values.
#[macro_export]
macro_rules! sql_params {
    () => { Vec::<$crate::transaction::SqlParam>::new() };
    ($($p:expr),+ $(,)?) => {
        vec![$($crate::transaction::SqlParam::from($p)),+]
    };
}

/// A statement as executed, replayable on another store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedStatement {
    /// SQL text with positional placeholders.
    pub sql: String,
    /// Bound parameters.
    pub params: Vec<SqlParam>,
}

impl CapturedStatement {
    /// Create a statement.
    pub fn new(sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Execute on `conn`, returning the number of changed rows.
    pub fn apply(&self, conn: &Connection) -> Result<usize> {
        Ok(conn.execute(&self.sql, params_from_iter(self.params.iter()))?)
    }
}

/// An open transaction on the store connection.
///
/// Dropping an unfinished transaction rolls it back once, best effort.
pub struct Transaction<'c> {
    conn: &'c Connection,
    policy: RetryPolicy,
    captured: Vec<CapturedStatement>,
    finished: bool,
}

impl<'c> Transaction<'c> {
    /// Begin a write transaction.
    ///
    /// # Errors
    /// - `Error::Storage` if the store refuses to start a transaction
    pub fn begin(conn: &'c Connection, policy: &RetryPolicy) -> Result<Self> {
        RetryExecutor::new(policy.commit_attempts, policy.backoff())
            .execute("begin", || Ok(conn.execute_batch("BEGIN IMMEDIATE")?))?;
        Ok(Self {
            conn,
            policy: policy.clone(),
            captured: Vec::new(),
            finished: false,
        })
    }

    /// Connection for queries inside the transaction.
    pub fn conn(&self) -> &'c Connection {
        self.conn
    }

    /// Execute and capture a statement.
    pub fn execute(&mut self, sql: &str, params: Vec<SqlParam>) -> Result<usize> {
        let statement = CapturedStatement::new(sql, params);
        let changed = statement.apply(self.conn)?;
        self.captured.push(statement);
        Ok(changed)
    }

    /// Execute a statement that is not part of the update log.
    pub fn execute_local(&self, sql: &str, params: Vec<SqlParam>) -> Result<usize> {
        Ok(self.conn.execute(sql, params_from_iter(params.iter()))?)
    }

    /// Statements captured so far.
    pub fn captured(&self) -> &[CapturedStatement] {
        &self.captured
    }

    /// Commit, returning the captured statements.
    ///
    /// # Errors
    /// - The commit error if every commit attempt failed and the fallback
    ///   rollback succeeded
    /// - `Error::RestartRequired` if the fallback rollback failed too
    pub fn commit(mut self) -> Result<Vec<CapturedStatement>> {
        let conn = self.conn;
        let result = RetryExecutor::new(self.policy.commit_attempts, self.policy.backoff())
            .execute_with_condition("commit", || Ok(conn.execute_batch("COMMIT")?), |_| true);

        match result {
            Ok(()) => {
                self.finished = true;
                debug!(statements = self.captured.len(), "Transaction committed");
                Ok(std::mem::take(&mut self.captured))
            }
            Err(err) => {
                warn!(error = %err, "Commit failed, rolling back");
                self.rollback_inner()?;
                Err(err)
            }
        }
    }

    /// Roll back all changes.
    ///
    /// # Errors
    /// - `Error::RestartRequired` if no rollback attempt succeeded
    pub fn rollback(mut self) -> Result<()> {
        self.rollback_inner()
    }

    fn rollback_inner(&mut self) -> Result<()> {
        self.finished = true;
        if self.conn.is_autocommit() {
            return Ok(());
        }
        let conn = self.conn;
        RetryExecutor::new(self.policy.rollback_attempts, self.policy.backoff())
            .execute_with_condition("rollback", || Ok(conn.execute_batch("ROLLBACK")?), |_| true)
            .map_err(|e| {
                error!(error = %e, "Rollback failed");
                Error::RestartRequired(format!("Rollback could not be confirmed: {}", e))
            })
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "Rollback of abandoned transaction failed");
            }
        }
    }
}

/// Force journal processing and check the store at open time.
///
/// Runs one throwaway transaction (create and drop a scratch table, then roll
/// back) followed by `PRAGMA integrity_check`.
pub fn bootstrap(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "BEGIN;
         CREATE TABLE kms_bootstrap_scratch (x INTEGER);
         DROP TABLE kms_bootstrap_scratch;
         ROLLBACK;",
    )?;
    let verdict: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
    if verdict != "ok" {
        return Err(Error::Integrity(format!("Store integrity check failed: {}", verdict)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)").unwrap();
        conn
    }

    fn count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn test_commit_returns_captured() {
        let conn = conn();
        let mut tx = Transaction::begin(&conn, &RetryPolicy::default()).unwrap();
        tx.execute("INSERT INTO t (id, name) VALUES (?1, ?2)", sql_params![1u32, "a"])
            .unwrap();
        tx.execute_local("INSERT INTO t (id, name) VALUES (?1, ?2)", sql_params![2u32, "b"])
            .unwrap();
        let captured = tx.commit().unwrap();

        assert_eq!(count(&conn), 2);
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].params, vec![SqlParam::Integer(1), SqlParam::Text("a".into())]);
    }

    #[test]
    fn test_rollback_and_drop_discard() {
        let conn = conn();
        let mut tx = Transaction::begin(&conn, &RetryPolicy::default()).unwrap();
        tx.execute("INSERT INTO t (id) VALUES (?1)", sql_params![1u32]).unwrap();
        tx.rollback().unwrap();
        assert_eq!(count(&conn), 0);

        {
            let mut tx = Transaction::begin(&conn, &RetryPolicy::default()).unwrap();
            tx.execute("INSERT INTO t (id) VALUES (?1)", sql_params![1u32]).unwrap();
        }
        assert_eq!(count(&conn), 0);
        assert!(conn.is_autocommit());
    }

    #[test]
    fn test_captured_statement_replays_elsewhere() {
        let source = conn();
        let mut tx = Transaction::begin(&source, &RetryPolicy::default()).unwrap();
        tx.execute(
            "INSERT INTO t (id, name) VALUES (?1, ?2)",
            sql_params![5u32, Option::<String>::None],
        )
        .unwrap();
        let captured = tx.commit().unwrap();

        let json = serde_json::to_string(&captured[0]).unwrap();
        let statement: CapturedStatement = serde_json::from_str(&json).unwrap();
        let target = conn();
        assert_eq!(statement.apply(&target).unwrap(), 1);
        assert_eq!(count(&target), 1);
    }

    #[test]
    fn test_bootstrap_leaves_no_scratch() {
        let conn = conn();
        bootstrap(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'kms_bootstrap_scratch'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tables, 0);
        assert!(conn.is_autocommit());
    }
}
