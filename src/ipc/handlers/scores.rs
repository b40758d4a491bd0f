use crate::calc;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    db_conn, required_category, required_semester, required_year, student_filters, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::scores::{self, ScoreEntry};
use serde_json::json;

fn scores_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let year = required_year(req)?;
    let semester = required_semester(req)?;
    let category = required_category(req)?;
    let filters = student_filters(req)?;
    let sheet = calc::compute_score_sheet(conn, year, semester, category, &filters)?;
    Ok(json!(sheet))
}

fn scores_save(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let year = required_year(req)?;
    let semester = required_semester(req)?;
    let category = required_category(req)?;
    let entries: Vec<ScoreEntry> = match req.params.get("entries") {
        Some(v) if v.is_array() => serde_json::from_value(v.clone())
            .map_err(|e| HandlerErr::new("bad_params", format!("invalid entries: {e}")))?,
        _ => return Err(HandlerErr::new("bad_params", "missing entries")),
    };
    let summary = scores::save_scores(conn, year, semester, category, &entries)?;
    Ok(json!(summary))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "scores.list" => scores_list(state, req),
        "scores.save" => scores_save(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
