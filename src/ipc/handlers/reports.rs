use crate::calc;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    db_conn, required_semester, required_str, required_year, student_filters, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::roster::StudentSort;
use serde_json::json;

fn parse_sort(req: &Request) -> Result<StudentSort, HandlerErr> {
    match req.params.get("sortBy") {
        None | Some(serde_json::Value::Null) => Ok(StudentSort::default()),
        Some(v) => v.as_str().and_then(StudentSort::parse).ok_or_else(|| {
            HandlerErr::new("bad_params", "sortBy must be one of: name_asc, name_desc")
                .with_details(json!({ "sortBy": v }))
        }),
    }
}

fn reports_student_scores(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let year = required_year(req)?;
    let semester = required_semester(req)?;
    let filters = student_filters(req)?;
    let sort = parse_sort(req)?;

    let rows = calc::compute_student_scores(conn, year, semester, &filters, sort)?;
    Ok(json!({
        "year": year,
        "semester": semester,
        "students": rows
    }))
}

fn reports_top_scorers(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let year = required_year(req)?;
    let semester = required_semester(req)?;

    let categories = calc::compute_top_scorers(conn, year, semester)?;
    Ok(json!({
        "year": year,
        "semester": semester,
        "categories": categories
    }))
}

fn reports_report_card(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = required_str(req, "studentId")?;
    let year = required_year(req)?;
    let semester = required_semester(req)?;

    let card = calc::compute_report_card(conn, &student_id, year, semester)?;
    Ok(json!(card))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "reports.studentScores" => reports_student_scores(state, req),
        "reports.topScorers" => reports_top_scorers(state, req),
        "reports.reportCard" => reports_report_card(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
