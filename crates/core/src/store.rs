//! Per-run SQLite storage.
//!
//! Every configuration file run gets its own database file named
//! `<db_name><timestamp>.sqlite3`. All columns are declared TEXT and every
//! value read back is converted to text, so comparisons behave the same no
//! matter which stage produced a row.

use std::path::{Path, PathBuf};

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open run database {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("cannot create table '{0}' without columns")]
    EmptyHeader(String),

    #[error("row has {actual} values but table '{table}' has {expected} columns")]
    RowShape {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("sql failed on table '{table}': {source}")]
    Sql {
        table: String,
        #[source]
        source: rusqlite::Error,
    },
}

/// A fully materialized table, as read back for export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableData {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

/// Handle to one run-scoped database file.
pub struct RunStore {
    conn: Connection,
    path: PathBuf,
}

impl RunStore {
    /// Open (creating if absent) the database for `run_db` under `data_dir`.
    pub fn open(data_dir: &Path, run_db: &str) -> Result<Self, StoreError> {
        let path = data_dir.join(format!("{run_db}.sqlite3"));
        let conn = Connection::open(&path).map_err(|source| StoreError::Open {
            path: path.clone(),
            source,
        })?;
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Create `table` if it does not exist yet and append `rows`.
    ///
    /// Extraction feeds one batch per input file into the same table, so this
    /// appends rather than replaces. Join materialization goes through
    /// drop-and-recreate instead.
    pub fn append_rows(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Option<String>>],
    ) -> Result<usize, StoreError> {
        if columns.is_empty() {
            return Err(StoreError::EmptyHeader(table.to_string()));
        }
        for row in rows {
            if row.len() != columns.len() {
                return Err(StoreError::RowShape {
                    table: table.to_string(),
                    expected: columns.len(),
                    actual: row.len(),
                });
            }
        }

        let column_list = columns
            .iter()
            .map(|column| format!("{} TEXT", quote_ident(column)))
            .collect::<Vec<_>>()
            .join(", ");
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {} ({column_list})",
            quote_ident(table)
        );
        let sql_error = |source| StoreError::Sql {
            table: table.to_string(),
            source,
        };
        self.conn.execute(&create, []).map_err(sql_error)?;

        let placeholders = vec!["?"; columns.len()].join(", ");
        let insert = format!(
            "INSERT INTO {} VALUES ({placeholders})",
            quote_ident(table)
        );
        let tx = self.conn.transaction().map_err(sql_error)?;
        {
            let mut stmt = tx.prepare(&insert).map_err(sql_error)?;
            for row in rows {
                stmt.execute(rusqlite::params_from_iter(row.iter()))
                    .map_err(sql_error)?;
            }
        }
        tx.commit().map_err(sql_error)?;
        Ok(rows.len())
    }

    /// Read a whole table back, columns in engine order, cells as text.
    pub fn fetch_table(&self, table: &str) -> Result<TableData, StoreError> {
        let sql_error = |source| StoreError::Sql {
            table: table.to_string(),
            source,
        };
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {}", quote_ident(table)))
            .map_err(sql_error)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

        let mut rows = Vec::new();
        let mut raw = stmt.query([]).map_err(sql_error)?;
        while let Some(row) = raw.next().map_err(sql_error)? {
            let mut cells = Vec::with_capacity(columns.len());
            for index in 0..columns.len() {
                cells.push(value_to_text(row.get_ref(index).map_err(sql_error)?));
            }
            rows.push(cells);
        }

        Ok(TableData {
            name: table.to_string(),
            columns,
            rows,
        })
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        self.conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get::<_, i64>(0),
            )
            .map(|count| count > 0)
            .map_err(|source| StoreError::Sql {
                table: table.to_string(),
                source,
            })
    }
}

/// Quote an identifier for direct interpolation into SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Convert any SQLite storage class to the text-affine cell representation.
pub fn value_to_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(value) => Some(value.to_string()),
        ValueRef::Real(value) => Some(value.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn text_row(cells: &[&str]) -> Vec<Option<String>> {
        cells.iter().map(|cell| Some(cell.to_string())).collect()
    }

    #[test]
    fn append_and_fetch_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut store = RunStore::open(dir.path(), "testdb_20260101-000000").unwrap();

        let columns = vec!["Filename".to_string(), "Port".to_string()];
        let inserted = store
            .append_rows(
                "ports",
                &columns,
                &[text_row(&["r1.txt", "eth0"]), text_row(&["r2.txt", "eth1"])],
            )
            .unwrap();
        assert_eq!(inserted, 2);

        let table = store.fetch_table("ports").unwrap();
        assert_eq!(table.columns, columns);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0][1].as_deref(), Some("eth0"));
    }

    #[test]
    fn append_twice_accumulates_rows() {
        let dir = TempDir::new().unwrap();
        let mut store = RunStore::open(dir.path(), "testdb").unwrap();
        let columns = vec!["Filename".to_string()];

        store.append_rows("t", &columns, &[text_row(&["a"])]).unwrap();
        store.append_rows("t", &columns, &[text_row(&["b"])]).unwrap();

        assert_eq!(store.fetch_table("t").unwrap().rows.len(), 2);
    }

    #[test]
    fn mismatched_row_width_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = RunStore::open(dir.path(), "testdb").unwrap();
        let columns = vec!["a".to_string(), "b".to_string()];

        let error = store
            .append_rows("t", &columns, &[text_row(&["only one"])])
            .unwrap_err();
        assert!(matches!(error, StoreError::RowShape { expected: 2, actual: 1, .. }));
    }

    #[test]
    fn numeric_results_come_back_as_text() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::open(dir.path(), "testdb").unwrap();
        store
            .connection()
            .execute_batch("CREATE TABLE n AS SELECT 1 AS i, 2.5 AS r, NULL AS missing")
            .unwrap();

        let table = store.fetch_table("n").unwrap();
        assert_eq!(table.rows[0][0].as_deref(), Some("1"));
        assert_eq!(table.rows[0][1].as_deref(), Some("2.5"));
        assert_eq!(table.rows[0][2], None);
    }

    #[test]
    fn table_exists_reports_presence() {
        let dir = TempDir::new().unwrap();
        let mut store = RunStore::open(dir.path(), "testdb").unwrap();
        assert!(!store.table_exists("t").unwrap());
        store
            .append_rows("t", &["a".to_string()], &[text_row(&["x"])])
            .unwrap();
        assert!(store.table_exists("t").unwrap());
    }
}
