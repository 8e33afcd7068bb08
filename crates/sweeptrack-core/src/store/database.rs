//! SQLite backend.
//!
//! Each public method opens its own connection so callers never manage
//! connection lifetime; a sweep database is read a handful of times per run.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::errors::{SweepError, SweepResult};
use crate::models::{
    parse_measure, ParamValue, ParameterSet, ResultRecord, SubmissionRecord, COUNT_MARKER_MEASURE,
};
use crate::store::schema::{
    display_column_name, sql_column_name, sql_type, table_columns, table_exists, PARAMS_TABLE,
    RESULTS_DDL, RESULTS_TABLE, RESULT_TAG_COLUMNS, RUNLOG_TABLE,
};
use crate::store::ResultStream;

fn value_ref_to_param(value: ValueRef<'_>) -> Option<ParamValue> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(v) => Some(ParamValue::Int(v)),
        ValueRef::Real(v) => Some(ParamValue::Float(v)),
        ValueRef::Text(t) => Some(ParamValue::coerce(&String::from_utf8_lossy(t))),
        ValueRef::Blob(_) => None,
    }
}

fn value_ref_to_string(value: ValueRef<'_>) -> String {
    match value_ref_to_param(value) {
        Some(v) => v.to_string(),
        None => String::new(),
    }
}

/// A positive row id stored as an integer or as digits.
fn value_ref_to_param_id(value: ValueRef<'_>) -> Option<u32> {
    let id = match value {
        ValueRef::Integer(v) => u32::try_from(v).ok()?,
        ValueRef::Text(t) => std::str::from_utf8(t).ok()?.trim().parse().ok()?,
        _ => return None,
    };
    (id > 0).then_some(id)
}

pub struct RelationalSource {
    db_path: PathBuf,
}

impl RelationalSource {
    /// Open an existing sweep database for reading.
    pub fn open(db_path: impl Into<PathBuf>) -> SweepResult<Self> {
        let db_path = db_path.into();
        if !db_path.is_file() {
            return Err(SweepError::Configuration(format!(
                "database {} doesn't exist",
                db_path.display()
            )));
        }
        Ok(Self { db_path })
    }

    /// Open a database for writing results, creating the file if needed.
    pub fn create(db_path: impl Into<PathBuf>) -> SweepResult<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { db_path })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> SweepResult<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    pub fn list_parameter_ids(&self) -> SweepResult<Vec<u32>> {
        let conn = self.connect()?;
        if !table_exists(&conn, PARAMS_TABLE)? {
            return Err(SweepError::Configuration(format!(
                "database {} has no {PARAMS_TABLE} table",
                self.db_path.display()
            )));
        }
        let mut stmt = conn.prepare("SELECT rowid FROM params ORDER BY rowid;")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, u32>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            "Read {} which contained {} sets of parameters",
            self.db_path.display(),
            ids.len()
        );
        Ok(ids)
    }

    /// Fetch one parameter set by row id, or `None` when absent.
    pub fn parameter_set(&self, param_id: u32) -> SweepResult<Option<ParameterSet>> {
        let conn = self.connect()?;
        let columns = table_columns(&conn, PARAMS_TABLE)?;
        if columns.is_empty() {
            return Err(SweepError::Configuration(format!(
                "database {} has no {PARAMS_TABLE} table",
                self.db_path.display()
            )));
        }
        conn.query_row(
            "SELECT * FROM params WHERE rowid = ?1;",
            [param_id],
            |row| {
                let mut set = ParameterSet::new(param_id);
                for (i, name) in columns.iter().enumerate() {
                    set.values.insert(name.clone(), value_ref_to_param(row.get_ref(i)?));
                }
                Ok(set)
            },
        )
        .optional()
        .map_err(SweepError::from)
    }

    pub fn load_submission_log(&self) -> SweepResult<Vec<SubmissionRecord>> {
        let conn = self.connect()?;
        if !table_exists(&conn, RUNLOG_TABLE)? {
            warn!("no {RUNLOG_TABLE} table found in {}", self.db_path.display());
            return Ok(vec![]);
        }
        let mut stmt =
            conn.prepare("SELECT param_id, slurm_id, submit_dir FROM runlog ORDER BY rowid;")?;
        let mut rows = stmt.query([])?;
        let mut runlog = Vec::new();
        let mut row_no = 0usize;
        while let Some(row) = rows.next()? {
            row_no += 1;
            let Some(param_id) = value_ref_to_param_id(row.get_ref(0)?) else {
                warn!("skipping runlog row {row_no}: param_id is not a positive integer");
                continue;
            };
            let job_id = value_ref_to_string(row.get_ref(1)?);
            if job_id.is_empty() {
                warn!("skipping runlog row {row_no}: no job id");
                continue;
            }
            runlog.push(SubmissionRecord {
                param_id,
                job_id,
                submit_dir: value_ref_to_string(row.get_ref(2)?),
            });
        }
        Ok(runlog)
    }

    /// Results left-joined with their parameter rows.
    pub fn stream_results(&self) -> SweepResult<ResultStream> {
        let conn = self.connect()?;
        if !table_exists(&conn, RESULTS_TABLE)? {
            warn!("no {RESULTS_TABLE} table found in {}", self.db_path.display());
            return Ok(ResultStream::default());
        }
        let result_columns = table_columns(&conn, RESULTS_TABLE)?;
        let param_columns = table_columns(&conn, PARAMS_TABLE)?;
        let sql = if param_columns.is_empty() {
            "SELECT r.* FROM results AS r ORDER BY r.rowid;"
        } else {
            "SELECT r.*, p.* FROM results AS r \
             LEFT JOIN params AS p ON p.rowid = r.param_id ORDER BY r.rowid;"
        };

        let mut stream = ResultStream::default();
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query([])?;
        let mut row_no = 0usize;
        while let Some(row) = rows.next()? {
            row_no += 1;
            let mut record = ResultRecord::default();
            let mut valid = false;
            for (i, column) in result_columns.iter().enumerate() {
                let value = row.get_ref(i)?;
                match column.as_str() {
                    "param_id" => {
                        if let Some(id) = value_ref_to_param_id(value) {
                            valid = true;
                            record.param_id = id;
                        }
                    }
                    COUNT_MARKER_MEASURE => {}
                    "result_name" => record.result_set = value_ref_to_string(value),
                    "slurm_id" => record.job_id = value_ref_to_string(value),
                    _ => {
                        let measure = match value {
                            ValueRef::Integer(v) => Some(v as f64),
                            ValueRef::Real(v) => Some(v),
                            ValueRef::Text(t) => parse_measure(&String::from_utf8_lossy(t)),
                            _ => None,
                        };
                        if let Some(v) = measure {
                            record.measures.insert(display_column_name(column), v);
                        }
                    }
                }
            }
            if !valid {
                warn!("skipping results row {row_no}: param_id is not a positive integer");
                stream.skipped_lines += 1;
                continue;
            }
            let offset = result_columns.len();
            let mut params = IndexMap::new();
            for (j, name) in param_columns.iter().enumerate() {
                params.insert(name.clone(), value_ref_to_param(row.get_ref(offset + j)?));
            }
            record.params = params;
            stream.records.push(record);
        }
        info!(
            "Read {} which contained {} results",
            self.db_path.display(),
            stream.records.len()
        );
        Ok(stream)
    }

    /// Append one evaluation. `measures` are `(name, raw value)` pairs as
    /// printed by the evaluator; the table grows a column for new measures.
    pub fn store_result(
        &self,
        param_id: u32,
        result_set: &str,
        job_id: Option<&str>,
        measures: &[(String, String)],
    ) -> SweepResult<()> {
        let conn = self.connect()?;
        conn.execute_batch(RESULTS_DDL)?;
        let existing = table_columns(&conn, RESULTS_TABLE)?;

        let mut columns: Vec<String> = RESULT_TAG_COLUMNS.iter().map(|c| c.to_string()).collect();
        let mut values: Vec<rusqlite::types::Value> = vec![
            rusqlite::types::Value::Integer(param_id as i64),
            rusqlite::types::Value::Text(result_set.to_string()),
            match job_id {
                Some(j) => rusqlite::types::Value::Text(j.to_string()),
                None => rusqlite::types::Value::Null,
            },
        ];
        // A measure printed twice keeps its last value.
        let mut unique: IndexMap<String, (&str, &str)> = IndexMap::new();
        for (name, raw) in measures {
            let column = sql_column_name(name)?;
            if unique.insert(column, (name.as_str(), raw.as_str())).is_some() {
                warn!("measure {name} given more than once, keeping the last value");
            }
        }
        for (column, (name, raw)) in unique {
            if RESULT_TAG_COLUMNS.contains(&column.as_str()) {
                return Err(SweepError::format(0, format!("measure {name} shadows a tag column")));
            }
            if !existing.contains(&column) {
                conn.execute_batch(&format!(
                    "ALTER TABLE results ADD COLUMN {column} {};",
                    sql_type(raw)
                ))?;
            }
            let value = match ParamValue::coerce(raw) {
                ParamValue::Int(v) => rusqlite::types::Value::Integer(v),
                ParamValue::Float(v) => rusqlite::types::Value::Real(v),
                ParamValue::Text(_) => {
                    return Err(SweepError::format(
                        0,
                        format!("measure {name} has non-numeric value '{raw}'"),
                    ))
                }
            };
            columns.push(column);
            values.push(value);
        }

        let placeholders = (1..=values.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute(
            &format!(
                "INSERT INTO results ({}) VALUES ({placeholders});",
                columns.join(", ")
            ),
            params_from_iter(values.iter()),
        )?;
        Ok(())
    }
}
