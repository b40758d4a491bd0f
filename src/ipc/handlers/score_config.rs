use crate::formula::{self, Bindings};
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    config_scope, db_conn, required_category, required_semester, required_str, required_year,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::score_config;
use serde_json::json;

fn number_param(req: &Request, key: &str) -> Result<f64, HandlerErr> {
    match req.params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(0.0),
        Some(v) => v.as_f64().ok_or_else(|| {
            HandlerErr::new("bad_params", format!("{key} must be a number"))
        }),
    }
}

fn config_resolve(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let year = required_year(req)?;
    let semester = required_semester(req)?;
    let category = required_category(req)?;
    let config = score_config::resolve(conn, year, semester, category)?;
    Ok(json!({ "config": config }))
}

fn config_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let scope = config_scope(req)?;
    let config = score_config::get(conn, &scope)?;
    Ok(json!({ "config": config }))
}

fn config_list(state: &AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let configs = score_config::list(conn)?;
    Ok(json!({ "configs": configs }))
}

fn config_save(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let scope = config_scope(req)?;
    let num_exercises = match req.params.get("numExercises") {
        None | Some(serde_json::Value::Null) => {
            return Err(HandlerErr::new("bad_params", "missing numExercises"))
        }
        Some(v) => v.as_i64().ok_or_else(|| {
            HandlerErr::new("bad_params", "numExercises must be an integer")
        })?,
    };
    let formula_src = required_str(req, "formula")?;
    let saved = score_config::save(conn, scope, num_exercises, &formula_src)?;
    Ok(json!(saved))
}

fn config_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let scope = config_scope(req)?;
    let refitted = score_config::delete(conn, scope)?;
    Ok(json!({ "ok": true, "refitted": refitted }))
}

/// Works without a workspace: it only parses.
fn config_validate_formula(req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let src = required_str(req, "formula")?;
    let normalized = formula::validate(&src)?;
    Ok(json!({ "formula": normalized }))
}

/// Live calculation for the config editor.
fn config_preview(req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let src = required_str(req, "formula")?;
    let normalized = formula::validate(&src)?;
    let bindings = Bindings {
        ex_sum: number_param(req, "exSum")?,
        mid_term: number_param(req, "midTerm")?,
        finals: number_param(req, "finals")?,
        num_exercises: match req.params.get("numExercises") {
            None | Some(serde_json::Value::Null) => {
                f64::from(score_config::DEFAULT_NUM_EXERCISES)
            }
            Some(_) => number_param(req, "numExercises")?,
        },
    };
    match formula::evaluate(&normalized, &bindings) {
        Ok(value) => Ok(json!({ "formula": normalized, "result": value })),
        Err(e) => Ok(json!({
            "formula": normalized,
            "result": serde_json::Value::Null,
            "evalError": e.to_string()
        })),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "scoreConfig.resolve" => config_resolve(state, req),
        "scoreConfig.get" => config_get(state, req),
        "scoreConfig.list" => config_list(state, req),
        "scoreConfig.save" => config_save(state, req),
        "scoreConfig.delete" => config_delete(state, req),
        "scoreConfig.validateFormula" => config_validate_formula(req),
        "scoreConfig.preview" => config_preview(req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
