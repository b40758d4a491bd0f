use crate::calc::CalcError;
use crate::formula::FormulaError;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use crate::roster::{ProfileError, StudentFilters};
use crate::score_config::{Category, ConfigScope, ScoreConfigError, Semester};
use crate::scores::ScoreError;
use rusqlite::Connection;
use serde_json::{json, Value};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn formula_error_details(e: &FormulaError) -> Option<Value> {
    match e {
        FormulaError::Empty => None,
        FormulaError::UnknownVariables { names } => Some(json!({ "unknownVariables": names })),
        FormulaError::IllegalCharacters { chars } => {
            let chars: Vec<String> = chars.iter().map(|c| c.to_string()).collect();
            Some(json!({ "illegalCharacters": chars }))
        }
        FormulaError::InvalidNumber { lexeme, column } => {
            Some(json!({ "lexeme": lexeme, "column": column }))
        }
        FormulaError::Syntax { column, .. } => Some(json!({ "column": column })),
    }
}

impl From<FormulaError> for HandlerErr {
    fn from(e: FormulaError) -> Self {
        HandlerErr {
            code: "invalid_formula",
            message: e.to_string(),
            details: formula_error_details(&e),
        }
    }
}

impl From<ScoreConfigError> for HandlerErr {
    fn from(e: ScoreConfigError) -> Self {
        match e {
            ScoreConfigError::Formula(f) => f.into(),
            ScoreConfigError::InvalidScope(_) | ScoreConfigError::InvalidNumExercises(_) => {
                HandlerErr::new("bad_params", e.to_string())
            }
            ScoreConfigError::GlobalDefaultUndeletable => HandlerErr::new("conflict", e.to_string()),
            ScoreConfigError::NotFound => HandlerErr::new("not_found", e.to_string()),
            ScoreConfigError::Storage(_) => HandlerErr::new("db_query_failed", e.to_string()),
        }
    }
}

impl From<ScoreError> for HandlerErr {
    fn from(e: ScoreError) -> Self {
        match e {
            ScoreError::OutOfRange { ref field, value } => {
                let details = json!({ "field": field, "value": value });
                HandlerErr::new("bad_params", e.to_string()).with_details(details)
            }
            ScoreError::DuplicateStudent(ref id) => {
                let details = json!({ "studentId": id });
                HandlerErr::new("bad_params", e.to_string()).with_details(details)
            }
            ScoreError::UnknownStudent(ref id) => {
                let details = json!({ "studentId": id });
                HandlerErr::new("not_found", e.to_string()).with_details(details)
            }
            ScoreError::Config(inner) => inner.into(),
            ScoreError::Storage(_) => HandlerErr::new("db_update_failed", e.to_string())
                .with_details(json!({ "table": "scores" })),
        }
    }
}

impl From<ProfileError> for HandlerErr {
    fn from(e: ProfileError) -> Self {
        let details = json!({ "field": e.field() });
        HandlerErr::new("bad_params", e.to_string()).with_details(details)
    }
}

impl From<CalcError> for HandlerErr {
    fn from(e: CalcError) -> Self {
        HandlerErr {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }
}

pub fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn db_err(code: &'static str, e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new(code, e.to_string())
}

pub fn required_str(req: &Request, key: &str) -> Result<String, HandlerErr> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

/// A scope field; `null`, `""` and `"None"` all mean "not set".
fn scope_field<'a>(params: &'a Value, key: &str) -> Option<&'a Value> {
    match params.get(key)? {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() || s.trim() == "None" => None,
        v => Some(v),
    }
}

fn parse_year(key: &str, v: &Value) -> Result<u32, HandlerErr> {
    let parsed = match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed
        .filter(|y| *y >= 1)
        .and_then(|y| u32::try_from(y).ok())
        .ok_or_else(|| {
            HandlerErr::new("bad_params", format!("{key} must be a positive integer"))
                .with_details(json!({ key: v }))
        })
}

fn parse_semester(key: &str, v: &Value) -> Result<Semester, HandlerErr> {
    v.as_str().and_then(Semester::parse).ok_or_else(|| {
        HandlerErr::new("bad_params", format!("{key} must be one of: mid, final"))
            .with_details(json!({ key: v }))
    })
}

fn parse_category(key: &str, v: &Value) -> Result<Category, HandlerErr> {
    v.as_str().and_then(Category::parse).ok_or_else(|| {
        HandlerErr::new(
            "bad_params",
            format!("{key} must be one of: reading, writing, listening, speaking"),
        )
        .with_details(json!({ key: v }))
    })
}

pub fn required_year(req: &Request) -> Result<u32, HandlerErr> {
    let v = scope_field(&req.params, "year")
        .ok_or_else(|| HandlerErr::new("bad_params", "missing year"))?;
    parse_year("year", v)
}

pub fn required_semester(req: &Request) -> Result<Semester, HandlerErr> {
    let v = scope_field(&req.params, "semester")
        .ok_or_else(|| HandlerErr::new("bad_params", "missing semester"))?;
    parse_semester("semester", v)
}

pub fn required_category(req: &Request) -> Result<Category, HandlerErr> {
    let v = scope_field(&req.params, "category")
        .ok_or_else(|| HandlerErr::new("bad_params", "missing category"))?;
    parse_category("category", v)
}

/// Reads `{year, semester, category}` where any field may be unset. The shape
/// of the result is checked by the caller.
pub fn config_scope(req: &Request) -> Result<ConfigScope, HandlerErr> {
    let params = &req.params;
    Ok(ConfigScope {
        year: scope_field(params, "year")
            .map(|v| parse_year("year", v))
            .transpose()?,
        semester: scope_field(params, "semester")
            .map(|v| parse_semester("semester", v))
            .transpose()?,
        category: scope_field(params, "category")
            .map(|v| parse_category("category", v))
            .transpose()?,
    })
}

pub fn student_filters(req: &Request) -> Result<StudentFilters, HandlerErr> {
    match req.params.get("filters") {
        None | Some(Value::Null) => Ok(StudentFilters::default()),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
            HandlerErr::new("bad_params", format!("invalid filters: {e}"))
        }),
    }
}
