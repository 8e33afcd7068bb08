//! SQLite layout of the relational backend and column-name helpers.
//!
//! Two logical tables are expected: `params` (one row per parameter set,
//! the implicit `rowid` is the parameter id) and `results` (one row per
//! evaluation). An optional `runlog` table mirrors the flat submission log.

use std::sync::LazyLock;

use regex::Regex;
use rusqlite::Connection;

use crate::errors::{SweepError, SweepResult};

pub const PARAMS_TABLE: &str = "params";
pub const RESULTS_TABLE: &str = "results";
pub const RUNLOG_TABLE: &str = "runlog";

/// Columns every `results` row carries besides its measures.
pub const RESULT_TAG_COLUMNS: &[&str] = &["param_id", "result_name", "slurm_id"];

pub const RESULTS_DDL: &str = "CREATE TABLE IF NOT EXISTS results (
    param_id INTEGER,
    result_name TEXT,
    slurm_id TEXT
);";

pub const RUNLOG_DDL: &str = "CREATE TABLE IF NOT EXISTS runlog (
    param_id INTEGER NOT NULL,
    slurm_id TEXT NOT NULL,
    submit_dir TEXT
);";

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Upper-case metric with a rank cutoff, as in `P_5` or `NDCG_10`.
static RANKED_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Z][A-Z0-9]*)_([0-9]+)$").unwrap());

pub fn table_exists(conn: &Connection, table: &str) -> SweepResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1;",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Column names of `table` in declaration order.
pub fn table_columns(conn: &Connection, table: &str) -> SweepResult<Vec<String>> {
    let table = checked_identifier(table)?;
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Measure name as stored: `P@5` becomes `P_5`.
pub fn sql_column_name(measure: &str) -> SweepResult<String> {
    let name = measure.replace('@', "_");
    checked_identifier(&name).map(str::to_string)
}

/// Stored column name as presented: `P_5` becomes `P@5`. Lower-case names
/// such as `layer_2` are left alone.
pub fn display_column_name(column: &str) -> String {
    RANKED_SUFFIX_RE.replace(column, "$1@$2").into_owned()
}

/// `REAL` for values written with a decimal point, `INTEGER` otherwise.
pub fn sql_type(raw_value: &str) -> &'static str {
    if raw_value.contains('.') {
        "REAL"
    } else {
        "INTEGER"
    }
}

pub fn checked_identifier(name: &str) -> SweepResult<&str> {
    if IDENT_RE.is_match(name) {
        Ok(name)
    } else {
        Err(SweepError::Configuration(format!(
            "'{name}' is not a valid SQL column name"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranked_columns_round_trip_through_storage_names() {
        assert_eq!(sql_column_name("P@5").unwrap(), "P_5");
        assert_eq!(display_column_name("P_5"), "P@5");
        assert_eq!(display_column_name("NDCG_10"), "NDCG@10");
        assert_eq!(display_column_name("recall_at_10"), "recall_at_10");
        assert_eq!(display_column_name("loss"), "loss");
    }

    #[test]
    fn ordinary_numbered_columns_keep_their_name() {
        assert_eq!(display_column_name("layer_2"), "layer_2");
        assert_eq!(display_column_name("dim_300"), "dim_300");
        assert_eq!(display_column_name("P_at_5"), "P_at_5");
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        assert!(sql_column_name("P@5; DROP TABLE params").is_err());
        assert!(checked_identifier("1abc").is_err());
        assert!(checked_identifier("dim").is_ok());
    }

    #[test]
    fn sql_type_follows_decimal_point() {
        assert_eq!(sql_type("0.5"), "REAL");
        assert_eq!(sql_type("5000"), "INTEGER");
    }

    #[test]
    fn introspects_tables() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(RESULTS_DDL).unwrap();
        assert!(table_exists(&conn, RESULTS_TABLE).unwrap());
        assert!(!table_exists(&conn, PARAMS_TABLE).unwrap());
        assert_eq!(
            table_columns(&conn, RESULTS_TABLE).unwrap(),
            vec!["param_id", "result_name", "slurm_id"]
        );
    }
}
