//! Scoped score configuration.
//!
//! A config is keyed by an optional `(year, semester, category)` scope. Lookups
//! walk a fixed fallback chain from the most specific scope to the global
//! default, which always exists once a workspace has been opened.

use crate::formula::{self, FormulaError};
use crate::scores;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_NUM_EXERCISES: u32 = 5;
pub const DEFAULT_FORMULA: &str = "(ex_sum + mid_term + finals) / (num_exercises + 2)";
pub const MAX_EXERCISES: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Semester {
    Mid,
    Final,
}

impl Semester {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mid" => Some(Self::Mid),
            "final" => Some(Self::Final),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mid => "mid",
            Self::Final => "final",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Reading,
    Writing,
    Listening,
    Speaking,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Reading,
        Category::Writing,
        Category::Listening,
        Category::Speaking,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reading" => Some(Self::Reading),
            "writing" => Some(Self::Writing),
            "listening" => Some(Self::Listening),
            "speaking" => Some(Self::Speaking),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reading => "reading",
            Self::Writing => "writing",
            Self::Listening => "listening",
            Self::Speaking => "speaking",
        }
    }
}

impl ToSql for Semester {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Semester {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Semester::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown semester '{s}'").into()))
    }
}

impl ToSql for Category {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Category {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Category::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown category '{s}'").into()))
    }
}

/// The key a config applies to. `None` fields match anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigScope {
    pub year: Option<u32>,
    pub semester: Option<Semester>,
    pub category: Option<Category>,
}

impl ConfigScope {
    pub const GLOBAL: ConfigScope = ConfigScope {
        year: None,
        semester: None,
        category: None,
    };

    pub fn is_global(&self) -> bool {
        *self == Self::GLOBAL
    }

    /// Candidate scopes for a score, most specific first.
    pub fn fallback_chain(year: u32, semester: Semester, category: Category) -> [ConfigScope; 4] {
        [
            ConfigScope {
                year: Some(year),
                semester: Some(semester),
                category: Some(category),
            },
            ConfigScope {
                year: Some(year),
                semester: Some(semester),
                category: None,
            },
            ConfigScope {
                year: Some(year),
                semester: None,
                category: None,
            },
            ConfigScope::GLOBAL,
        ]
    }

    /// Rejects scopes the fallback chain can never reach.
    pub fn check_shape(&self) -> Result<(), ScoreConfigError> {
        if self.year == Some(0) {
            return Err(ScoreConfigError::InvalidScope(
                "year must be a positive integer".into(),
            ));
        }
        if self.year.is_none() && (self.semester.is_some() || self.category.is_some()) {
            return Err(ScoreConfigError::InvalidScope(
                "if year is empty, semester and category must also be empty".into(),
            ));
        }
        if self.semester.is_none() && self.category.is_some() {
            return Err(ScoreConfigError::InvalidScope(
                "a category-specific config also needs a semester".into(),
            ));
        }
        Ok(())
    }

    pub fn label(&self) -> String {
        if self.is_global() {
            return "global default".to_string();
        }
        let mut parts = Vec::new();
        if let Some(y) = self.year {
            parts.push(y.to_string());
        }
        if let Some(s) = self.semester {
            parts.push(s.as_str().to_string());
        }
        if let Some(c) = self.category {
            parts.push(c.as_str().to_string());
        }
        parts.join("/")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreConfig {
    /// `None` only for the built-in default that was never persisted.
    pub id: Option<String>,
    #[serde(flatten)]
    pub scope: ConfigScope,
    pub num_exercises: u32,
    pub formula: String,
    pub updated_at: Option<String>,
}

impl ScoreConfig {
    pub fn builtin_default() -> Self {
        Self {
            id: None,
            scope: ConfigScope::GLOBAL,
            num_exercises: DEFAULT_NUM_EXERCISES,
            formula: DEFAULT_FORMULA.to_string(),
            updated_at: None,
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            scope: ConfigScope {
                year: row.get(1)?,
                semester: row.get(2)?,
                category: row.get(3)?,
            },
            num_exercises: row.get(4)?,
            formula: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}

const CONFIG_COLUMNS: &str = "id, year, semester, category, num_exercises, formula, updated_at";

#[derive(Debug, Error)]
pub enum ScoreConfigError {
    #[error("invalid configuration: {0}")]
    InvalidScope(String),

    #[error("number of exercises must be between 1 and 50, got {0}")]
    InvalidNumExercises(i64),

    #[error("invalid formula: {0}")]
    Formula(#[from] FormulaError),

    #[error("cannot delete global default configuration")]
    GlobalDefaultUndeletable,

    #[error("configuration not found")]
    NotFound,

    #[error("database error: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// Idempotent; returns the persisted global default, creating it if needed.
pub fn ensure_global_default(conn: &Connection) -> Result<ScoreConfig, ScoreConfigError> {
    if let Some(existing) = get(conn, &ConfigScope::GLOBAL)? {
        return Ok(existing);
    }
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO score_configs(id, year, semester, category, num_exercises, formula, updated_at)
         VALUES(?, NULL, NULL, NULL, ?, ?, ?)",
        (&id, DEFAULT_NUM_EXERCISES, DEFAULT_FORMULA, &now),
    )?;
    info!(target: "scorebook::config", config_id = %id, "created global default score config");
    Ok(ScoreConfig {
        id: Some(id),
        scope: ConfigScope::GLOBAL,
        num_exercises: DEFAULT_NUM_EXERCISES,
        formula: DEFAULT_FORMULA.to_string(),
        updated_at: Some(now),
    })
}

/// The config stored for exactly this scope, if any.
pub fn get(conn: &Connection, scope: &ConfigScope) -> Result<Option<ScoreConfig>, ScoreConfigError> {
    let sql = format!(
        "SELECT {CONFIG_COLUMNS} FROM score_configs
         WHERE year IS ? AND semester IS ? AND category IS ?
         LIMIT 1"
    );
    let found = conn
        .query_row(
            &sql,
            (scope.year, scope.semester, scope.category),
            ScoreConfig::from_row,
        )
        .optional()?;
    Ok(found)
}

pub fn list(conn: &Connection) -> Result<Vec<ScoreConfig>, ScoreConfigError> {
    let sql = format!(
        "SELECT {CONFIG_COLUMNS} FROM score_configs
         ORDER BY year IS NOT NULL, year, semester IS NOT NULL, semester,
                  category IS NOT NULL, category"
    );
    let mut stmt = conn.prepare(&sql)?;
    let configs = stmt
        .query_map([], ScoreConfig::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(configs)
}

/// Most specific config for a score's scope. Never fails on missing tiers.
pub fn resolve(
    conn: &Connection,
    year: u32,
    semester: Semester,
    category: Category,
) -> Result<ScoreConfig, ScoreConfigError> {
    for scope in ConfigScope::fallback_chain(year, semester, category) {
        if let Some(config) = get(conn, &scope)? {
            debug!(
                target: "scorebook::config",
                scope = %scope.label(),
                "resolved score config"
            );
            return Ok(config);
        }
    }
    warn!(
        target: "scorebook::config",
        year,
        semester = semester.as_str(),
        category = category.as_str(),
        "no stored score config; using built-in default"
    );
    Ok(ScoreConfig::builtin_default())
}

/// Every stored config, for resolving many scores without a query each.
#[derive(Debug, Clone)]
pub struct ConfigSet {
    configs: Vec<ScoreConfig>,
    fallback: ScoreConfig,
}

impl ConfigSet {
    pub fn new(configs: Vec<ScoreConfig>) -> Self {
        Self {
            configs,
            fallback: ScoreConfig::builtin_default(),
        }
    }

    pub fn load(conn: &Connection) -> Result<Self, ScoreConfigError> {
        Ok(Self::new(list(conn)?))
    }

    pub fn find(&self, scope: &ConfigScope) -> Option<&ScoreConfig> {
        self.configs.iter().find(|c| c.scope == *scope)
    }

    pub fn governing(&self, year: u32, semester: Semester, category: Category) -> &ScoreConfig {
        ConfigScope::fallback_chain(year, semester, category)
            .iter()
            .find_map(|scope| self.find(scope))
            .unwrap_or(&self.fallback)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedConfig {
    pub config: ScoreConfig,
    pub created: bool,
    pub retrofitted: usize,
}

/// Create-or-update the config for exactly `scope`, then retrofit the scores
/// it governs. Nothing is written if validation fails.
pub fn save(
    conn: &Connection,
    scope: ConfigScope,
    num_exercises: i64,
    formula_src: &str,
) -> Result<SavedConfig, ScoreConfigError> {
    scope.check_shape()?;
    let num_exercises = u32::try_from(num_exercises)
        .ok()
        .filter(|n| (1..=MAX_EXERCISES).contains(n))
        .ok_or(ScoreConfigError::InvalidNumExercises(num_exercises))?;
    let formula = formula::validate(formula_src)?;
    let now = chrono::Utc::now().to_rfc3339();

    let tx = conn.unchecked_transaction()?;
    let existing = get(&tx, &scope)?;
    let (id, created) = match existing.and_then(|c| c.id) {
        Some(id) => {
            tx.execute(
                "UPDATE score_configs SET num_exercises = ?, formula = ?, updated_at = ? WHERE id = ?",
                (num_exercises, &formula, &now, &id),
            )?;
            (id, false)
        }
        None => {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO score_configs(id, year, semester, category, num_exercises, formula, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?)",
                (
                    &id,
                    scope.year,
                    scope.semester,
                    scope.category,
                    num_exercises,
                    &formula,
                    &now,
                ),
            )?;
            (id, true)
        }
    };

    let config = ScoreConfig {
        id: Some(id),
        scope,
        num_exercises,
        formula,
        updated_at: Some(now),
    };
    let retrofitted = retrofit(&tx, &config)?;
    tx.commit()?;

    info!(
        target: "scorebook::config",
        scope = %scope.label(),
        num_exercises,
        created,
        retrofitted,
        "saved score config"
    );
    Ok(SavedConfig {
        config,
        created,
        retrofitted,
    })
}

/// Deletes a scoped config and re-fits the scores it governed to whichever
/// config governs them now. Returns the number of score rows rewritten.
pub fn delete(conn: &Connection, scope: ConfigScope) -> Result<usize, ScoreConfigError> {
    if scope.is_global() {
        return Err(ScoreConfigError::GlobalDefaultUndeletable);
    }
    let Some(target_id) = get(conn, &scope)?.and_then(|c| c.id) else {
        return Err(ScoreConfigError::NotFound);
    };

    let tx = conn.unchecked_transaction()?;
    let before = ConfigSet::load(&tx)?;
    tx.execute("DELETE FROM score_configs WHERE id = ?", [&target_id])?;
    let after = ConfigSet::load(&tx)?;
    let refitted = refit_scores(&tx, &scope, &after, |year, semester, category| {
        before.governing(year, semester, category).id.as_deref() == Some(target_id.as_str())
    })?;
    tx.commit()?;

    info!(
        target: "scorebook::config",
        scope = %scope.label(),
        refitted,
        "deleted score config"
    );
    Ok(refitted)
}

/// Resizes the exercise lists of every score governed by `config` to
/// `config.num_exercises`. Only changed rows are written. Runs on whatever
/// transaction `conn` is in; `save` passes its own.
pub fn retrofit(conn: &Connection, config: &ScoreConfig) -> Result<usize, ScoreConfigError> {
    let Some(config_id) = config.id.as_deref() else {
        return Ok(0);
    };
    let set = ConfigSet::load(conn)?;
    refit_scores(conn, &config.scope, &set, |year, semester, category| {
        set.governing(year, semester, category).id.as_deref() == Some(config_id)
    })
}

fn refit_scores<F>(
    conn: &Connection,
    scope: &ConfigScope,
    target: &ConfigSet,
    selected: F,
) -> Result<usize, ScoreConfigError>
where
    F: Fn(u32, Semester, Category) -> bool,
{
    let rows = scores::exercise_rows_in_scope(conn, scope)?;
    let mut touched = 0;
    for row in rows {
        if !selected(row.year, row.semester, row.category) {
            continue;
        }
        let governing = target.governing(row.year, row.semester, row.category);
        let fitted = crate::calc::fit_exercise_scores(&row.exercise_scores, governing.num_exercises);
        if fitted != row.exercise_scores {
            scores::write_exercise_scores(conn, &row.id, &fitted)?;
            touched += 1;
        }
    }
    Ok(touched)
}
