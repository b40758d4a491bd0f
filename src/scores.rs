use crate::calc;
use crate::score_config::{self, Category, ConfigScope, ScoreConfig, ScoreConfigError, Semester};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const MARK_MIN: f64 = 0.0;
pub const MARK_MAX: f64 = 100.0;

/// Marks as entered on the score sheet. Unset values count as zero.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Marks {
    pub exercise_scores: Vec<f64>,
    pub mid_term: Option<f64>,
    pub finals: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Score {
    pub id: String,
    pub student_id: String,
    pub year: u32,
    pub semester: Semester,
    pub category: Category,
    #[serde(flatten)]
    pub marks: Marks,
    pub updated_at: Option<String>,
}

/// JSON text column holding the exercise list.
struct ExerciseList(Vec<f64>);

impl FromSql for ExerciseList {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        if raw.trim().is_empty() {
            return Ok(Self(Vec::new()));
        }
        // Blank slots may have been stored as null.
        let parsed: Vec<Option<f64>> =
            serde_json::from_str(raw).map_err(|e| FromSqlError::Other(Box::new(e)))?;
        Ok(Self(parsed.into_iter().map(|v| v.unwrap_or(0.0)).collect()))
    }
}

fn encode_exercises(values: &[f64]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

const SCORE_COLUMNS: &str =
    "id, student_id, year, semester, category, exercise_scores, mid_term, finals, updated_at";

fn score_from_row(row: &Row<'_>) -> rusqlite::Result<Score> {
    Ok(Score {
        id: row.get(0)?,
        student_id: row.get(1)?,
        year: row.get(2)?,
        semester: row.get(3)?,
        category: row.get(4)?,
        marks: Marks {
            exercise_scores: row.get::<_, ExerciseList>(5)?.0,
            mid_term: row.get(6)?,
            finals: row.get(7)?,
        },
        updated_at: row.get(8)?,
    })
}

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("{field} must be between 0 and 100, got {value}")]
    OutOfRange { field: String, value: f64 },

    #[error("student not found: {0}")]
    UnknownStudent(String),

    #[error("student {0} appears more than once")]
    DuplicateStudent(String),

    #[error(transparent)]
    Config(#[from] ScoreConfigError),

    #[error("database error: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// One student's row from a submitted score sheet.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreEntry {
    pub student_id: String,
    #[serde(default)]
    pub exercise_scores: Vec<Option<f64>>,
    #[serde(default)]
    pub mid_term: Option<f64>,
    #[serde(default)]
    pub finals: Option<f64>,
}

fn check_mark(field: impl Into<String>, value: f64) -> Result<f64, ScoreError> {
    if !value.is_finite() || !(MARK_MIN..=MARK_MAX).contains(&value) {
        return Err(ScoreError::OutOfRange {
            field: field.into(),
            value,
        });
    }
    Ok(calc::round_off_2_decimals(value))
}

impl ScoreEntry {
    /// Validates the entry and shapes it for the governing config.
    fn to_marks(&self, num_exercises: u32) -> Result<Marks, ScoreError> {
        let mut exercises = Vec::with_capacity(num_exercises as usize);
        for (i, v) in self.exercise_scores.iter().enumerate() {
            exercises.push(match v {
                Some(v) => check_mark(format!("exercise {}", i + 1), *v)?,
                None => 0.0,
            });
        }
        let mid_term = self.mid_term.map(|v| check_mark("mid_term", v)).transpose()?;
        let finals = self.finals.map(|v| check_mark("finals", v)).transpose()?;
        Ok(Marks {
            exercise_scores: calc::fit_exercise_scores(&exercises, num_exercises),
            mid_term,
            finals,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveSummary {
    pub config: ScoreConfig,
    pub saved: usize,
}

/// Saves a score sheet for one `(year, semester, category)`. Either every
/// entry is stored or none is.
pub fn save_scores(
    conn: &Connection,
    year: u32,
    semester: Semester,
    category: Category,
    entries: &[ScoreEntry],
) -> Result<SaveSummary, ScoreError> {
    let config = score_config::resolve(conn, year, semester, category)?;

    let mut seen: Vec<&str> = Vec::with_capacity(entries.len());
    let mut prepared: Vec<(&str, Marks)> = Vec::with_capacity(entries.len());
    for entry in entries {
        if seen.contains(&entry.student_id.as_str()) {
            return Err(ScoreError::DuplicateStudent(entry.student_id.clone()));
        }
        seen.push(entry.student_id.as_str());
        prepared.push((entry.student_id.as_str(), entry.to_marks(config.num_exercises)?));
    }

    let now = chrono::Utc::now().to_rfc3339();
    let tx = conn.unchecked_transaction()?;
    for (student_id, marks) in &prepared {
        let exists: Option<i64> = tx
            .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
                r.get(0)
            })
            .optional()?;
        if exists.is_none() {
            return Err(ScoreError::UnknownStudent(student_id.to_string()));
        }
        tx.execute(
            "INSERT INTO scores(id, student_id, year, semester, category, exercise_scores, mid_term, finals, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, year, semester, category) DO UPDATE SET
               exercise_scores = excluded.exercise_scores,
               mid_term = excluded.mid_term,
               finals = excluded.finals,
               updated_at = excluded.updated_at",
            (
                Uuid::new_v4().to_string(),
                student_id,
                year,
                semester,
                category,
                encode_exercises(&marks.exercise_scores),
                marks.mid_term,
                marks.finals,
                &now,
            ),
        )?;
    }
    tx.commit()?;

    info!(
        target: "scorebook::scores",
        year,
        semester = semester.as_str(),
        category = category.as_str(),
        saved = prepared.len(),
        "saved score sheet"
    );
    Ok(SaveSummary {
        config,
        saved: prepared.len(),
    })
}

/// Scores for one year and semester, keyed by `(student_id, category)`.
pub fn scores_for_term(
    conn: &Connection,
    year: u32,
    semester: Semester,
) -> Result<HashMap<(String, Category), Score>, ScoreError> {
    let sql = format!("SELECT {SCORE_COLUMNS} FROM scores WHERE year = ? AND semester = ?");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((year, semester), score_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .map(|s| ((s.student_id.clone(), s.category), s))
        .collect())
}

/// The parts of a score row needed to re-fit its exercise list.
#[derive(Debug, Clone)]
pub struct ExerciseRow {
    pub id: String,
    pub year: u32,
    pub semester: Semester,
    pub category: Category,
    pub exercise_scores: Vec<f64>,
}

/// Score rows inside a config scope; `None` scope fields match everything.
pub fn exercise_rows_in_scope(
    conn: &Connection,
    scope: &ConfigScope,
) -> rusqlite::Result<Vec<ExerciseRow>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(year) = scope.year {
        clauses.push("year = ?");
        binds.push(Value::Integer(i64::from(year)));
    }
    if let Some(semester) = scope.semester {
        clauses.push("semester = ?");
        binds.push(Value::Text(semester.as_str().to_string()));
    }
    if let Some(category) = scope.category {
        clauses.push("category = ?");
        binds.push(Value::Text(category.as_str().to_string()));
    }
    let mut sql =
        "SELECT id, year, semester, category, exercise_scores FROM scores".to_string();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY rowid");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(ExerciseRow {
                id: r.get(0)?,
                year: r.get(1)?,
                semester: r.get(2)?,
                category: r.get(3)?,
                exercise_scores: r.get::<_, ExerciseList>(4)?.0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn write_exercise_scores(conn: &Connection, score_id: &str, values: &[f64]) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE scores SET exercise_scores = ?, updated_at = ? WHERE id = ?",
        (encode_exercises(values), chrono::Utc::now().to_rfc3339(), score_id),
    )?;
    Ok(())
}
